//! Parser for the Lumen component schema language.
//!
//! A `.lum` file is a sequence of items:
//!
//! ```text
//! @schema 1;
//! import { Component, SceneObject } from "~lib/runtime";
//! import "scripts/helpers";
//!
//! export class Spinner extends Component {
//!     @serialize xrot: i16 = 3;
//!     @serialize target: SceneObject = null;
//!     spins: i32 = 0;
//!
//!     fn Update {
//!         (i32.store offset=@offsetof(spins) (local.get $this)
//!           (i32.add (i32.load offset=@offsetof(spins) (local.get $this)) (i32.const 1)))
//!     }
//! }
//!
//! wat {
//!     (func $helper (result i32) (i32.const 7))
//! }
//! ```
//!
//! Method bodies and `wat` blocks are captured verbatim (brace-balanced,
//! ignoring braces inside WebAssembly strings and comments) and handed to the
//! lowering stage untouched.

use crate::{Diagnostic, ScriptError, SCHEMA_VERSION, SCRIPT_EXTENSION};

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// 1-based source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

/// A parsed source file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    /// Virtual path the file was loaded from.
    pub path: String,
    /// Declared `@schema` version, if the file has the directive.
    pub schema: Option<u32>,
    pub items: Vec<Item>,
}

impl SourceFile {
    pub fn imports(&self) -> impl Iterator<Item = &Import> {
        self.items.iter().filter_map(|item| match item {
            Item::Import(import) => Some(import),
            _ => None,
        })
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassDecl> {
        self.items.iter().filter_map(|item| match item {
            Item::Class(class) => Some(class),
            _ => None,
        })
    }

    pub fn wat_blocks(&self) -> impl Iterator<Item = &RawBlock> {
        self.items.iter().filter_map(|item| match item {
            Item::Wat(block) => Some(block),
            _ => None,
        })
    }

    /// Whether this file belongs to the standard library.
    pub fn is_library(&self) -> bool {
        self.path.starts_with("~lib/")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Import(Import),
    Class(ClassDecl),
    Wat(RawBlock),
}

/// `import { A, B } from "path";` or the side-effect form `import "path";`.
#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    /// Imported class names; empty for a side-effect import.
    pub names: Vec<String>,
    /// Specifier exactly as written.
    pub specifier: String,
    pub span: Span,
}

impl Import {
    /// Virtual path the specifier refers to.
    pub fn path(&self) -> String {
        resolve_specifier(&self.specifier)
    }
}

/// Map an import specifier to a virtual path (`scripts/a` -> `scripts/a.lum`).
pub fn resolve_specifier(specifier: &str) -> String {
    let suffix = format!(".{SCRIPT_EXTENSION}");
    if specifier.ends_with(&suffix) {
        specifier.to_owned()
    } else {
        format!("{specifier}{suffix}")
    }
}

/// Inverse of [`resolve_specifier`].
pub fn specifier_for(path: &str) -> &str {
    path.strip_suffix(&format!(".{SCRIPT_EXTENSION}")[..])
        .unwrap_or(path)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    pub exported: bool,
    pub base: Option<String>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<MethodDecl>,
    pub span: Span,
}

impl ClassDecl {
    pub fn method(&self, name: &str) -> Option<&MethodDecl> {
        self.methods.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub type_name: String,
    /// Decorator names without the `@`.
    pub decorators: Vec<String>,
    pub initializer: Option<Literal>,
    pub span: Span,
}

impl FieldDecl {
    pub fn has_decorator(&self, name: &str) -> bool {
        self.decorators.iter().any(|d| d == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDecl {
    pub name: String,
    pub body: RawBlock,
    pub span: Span,
}

/// Verbatim text between a pair of braces.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBlock {
    pub text: String,
    /// Position of the first character after the opening brace.
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Null,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse one source file.
///
/// # Errors
///
/// - [`ScriptError::Syntax`] on malformed input.
/// - [`ScriptError::UnsupportedSchema`] if the `@schema` directive names a
///   version other than [`SCHEMA_VERSION`].
pub fn parse(path: &str, source: &str) -> Result<SourceFile, ScriptError> {
    Parser::new(path, source).parse_file()
}

struct Parser<'a> {
    path: &'a str,
    src: &'a str,
    pos: usize,
    line: u32,
    column: u32,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl<'a> Parser<'a> {
    fn new(path: &'a str, src: &'a str) -> Self {
        Self {
            path,
            src,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    // -- Items ---------------------------------------------------------------

    fn parse_file(mut self) -> Result<SourceFile, ScriptError> {
        let mut file = SourceFile {
            path: self.path.to_owned(),
            schema: None,
            items: Vec::new(),
        };

        self.skip_trivia()?;
        if self.rest().starts_with("@schema") {
            self.bump();
            self.ident()?;
            self.skip_trivia()?;
            let version = match self.literal()? {
                Literal::Int(v) if v >= 0 => v as u32,
                _ => return Err(self.error("`@schema` expects a version number")),
            };
            if version != SCHEMA_VERSION {
                return Err(ScriptError::UnsupportedSchema {
                    file: self.path.to_owned(),
                    found: version,
                });
            }
            file.schema = Some(version);
            self.eat(';')?;
        }

        loop {
            self.skip_trivia()?;
            if self.at_end() {
                break;
            }

            let item = if self.keyword("import") {
                Item::Import(self.import()?)
            } else if self.keyword("export") {
                self.skip_trivia()?;
                if !self.keyword("class") {
                    return Err(self.error("expected `class` after `export`"));
                }
                Item::Class(self.class(true)?)
            } else if self.keyword("class") {
                Item::Class(self.class(false)?)
            } else if self.keyword("wat") {
                Item::Wat(self.raw_block()?)
            } else {
                return Err(self.error("expected `import`, `export`, `class` or `wat`"));
            };
            file.items.push(item);
        }

        Ok(file)
    }

    fn import(&mut self) -> Result<Import, ScriptError> {
        let span = self.span();
        self.skip_trivia()?;

        let mut names = Vec::new();
        if self.peek() == Some('{') {
            self.bump();
            loop {
                self.skip_trivia()?;
                if self.peek() == Some('}') {
                    self.bump();
                    break;
                }
                names.push(self.ident()?);
                self.skip_trivia()?;
                match self.peek() {
                    Some(',') => {
                        self.bump();
                    }
                    Some('}') => {}
                    _ => return Err(self.error("expected `,` or `}` in import list")),
                }
            }
            self.skip_trivia()?;
            if !self.keyword("from") {
                return Err(self.error("expected `from` after import list"));
            }
            self.skip_trivia()?;
        }

        let specifier = self.string()?;
        self.eat(';')?;
        Ok(Import {
            names,
            specifier,
            span,
        })
    }

    fn class(&mut self, exported: bool) -> Result<ClassDecl, ScriptError> {
        self.skip_trivia()?;
        let span = self.span();
        let name = self.ident()?;

        self.skip_trivia()?;
        let base = if self.keyword("extends") {
            self.skip_trivia()?;
            Some(self.ident()?)
        } else {
            None
        };

        self.skip_trivia()?;
        self.expect('{')?;

        let mut class = ClassDecl {
            name,
            exported,
            base,
            fields: Vec::new(),
            methods: Vec::new(),
            span,
        };

        loop {
            self.skip_trivia()?;
            match self.peek() {
                None => return Err(self.error(format!("unterminated class `{}`", class.name))),
                Some('}') => {
                    self.bump();
                    break;
                }
                _ => {}
            }

            let member_span = self.span();
            let mut decorators = Vec::new();
            while self.peek() == Some('@') {
                self.bump();
                decorators.push(self.ident()?);
                self.skip_trivia()?;
            }

            if self.keyword("fn") {
                self.skip_trivia()?;
                let name = self.ident()?;
                self.skip_trivia()?;
                if self.peek() == Some('(') {
                    self.bump();
                    self.skip_trivia()?;
                    self.expect(')')?;
                    self.skip_trivia()?;
                }
                let body = self.raw_block()?;
                class.methods.push(MethodDecl {
                    name,
                    body,
                    span: member_span,
                });
                continue;
            }

            let name = self.ident()?;
            self.skip_trivia()?;
            self.expect(':')?;
            self.skip_trivia()?;
            let type_name = self.ident()?;
            self.skip_trivia()?;
            let initializer = if self.peek() == Some('=') {
                self.bump();
                self.skip_trivia()?;
                Some(self.literal()?)
            } else {
                None
            };
            self.skip_trivia()?;
            self.expect(';')?;

            class.fields.push(FieldDecl {
                name,
                type_name,
                decorators,
                initializer,
                span: member_span,
            });
        }

        Ok(class)
    }

    /// Capture the text between `{` and its matching `}`.
    fn raw_block(&mut self) -> Result<RawBlock, ScriptError> {
        self.skip_trivia()?;
        self.expect('{')?;
        let span = self.span();
        let start = self.pos;
        let mut depth = 1u32;

        loop {
            let rest = self.rest();
            if rest.starts_with(";;") {
                while !matches!(self.peek(), None | Some('\n')) {
                    self.bump();
                }
                continue;
            }
            if rest.starts_with("(;") {
                self.bump();
                self.bump();
                while !self.rest().starts_with(";)") {
                    if self.bump().is_none() {
                        return Err(self.error("unterminated block comment in raw block"));
                    }
                }
                self.bump();
                self.bump();
                continue;
            }

            match self.bump() {
                None => return Err(self.error("unterminated block: missing `}`")),
                Some('"') => loop {
                    match self.bump() {
                        None => return Err(self.error("unterminated string in raw block")),
                        Some('\\') => {
                            self.bump();
                        }
                        Some('"') => break,
                        Some(_) => {}
                    }
                },
                Some('{') => depth += 1,
                Some('}') => {
                    depth -= 1;
                    if depth == 0 {
                        let text = self.src[start..self.pos - 1].to_owned();
                        return Ok(RawBlock { text, span });
                    }
                }
                Some(_) => {}
            }
        }
    }

    // -- Tokens --------------------------------------------------------------

    fn literal(&mut self) -> Result<Literal, ScriptError> {
        match self.peek() {
            Some('"') => return Ok(Literal::Str(self.string()?)),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '.' => return self.number(),
            _ => {}
        }
        if self.keyword("true") {
            Ok(Literal::Bool(true))
        } else if self.keyword("false") {
            Ok(Literal::Bool(false))
        } else if self.keyword("null") {
            Ok(Literal::Null)
        } else {
            Err(self.error("expected a literal (number, string, `true`, `false` or `null`)"))
        }
    }

    fn number(&mut self) -> Result<Literal, ScriptError> {
        let start = self.pos;
        let mut is_float = false;

        if self.peek() == Some('-') {
            self.bump();
        }
        self.digits();
        if self.peek() == Some('.') {
            is_float = true;
            self.bump();
            self.digits();
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.bump();
            }
            self.digits();
        }

        let text = &self.src[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(Literal::Float)
                .map_err(|_| self.error(format!("malformed number `{text}`")))
        } else {
            text.parse::<i64>()
                .map(Literal::Int)
                .map_err(|_| self.error(format!("malformed or out-of-range integer `{text}`")))
        }
    }

    fn digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
    }

    fn string(&mut self) -> Result<String, ScriptError> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated string literal")),
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some('\\') => out.push('\\'),
                    Some('"') => out.push('"'),
                    Some(other) => {
                        return Err(self.error(format!("unknown escape `\\{other}` in string")))
                    }
                    None => return Err(self.error("unterminated string literal")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn ident(&mut self) -> Result<String, ScriptError> {
        match self.peek() {
            Some(c) if is_ident_start(c) => {}
            _ => return Err(self.error("expected an identifier")),
        }
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_char(c)) {
            self.bump();
        }
        Ok(self.src[start..self.pos].to_owned())
    }

    /// Consume `word` if it is the next token and is not a prefix of a
    /// longer identifier.
    fn keyword(&mut self, word: &str) -> bool {
        let rest = self.rest();
        if !rest.starts_with(word) {
            return false;
        }
        if rest[word.len()..].chars().next().is_some_and(is_ident_char) {
            return false;
        }
        for _ in 0..word.len() {
            self.bump();
        }
        true
    }

    fn expect(&mut self, c: char) -> Result<(), ScriptError> {
        if self.peek() == Some(c) {
            self.bump();
            Ok(())
        } else {
            let found = self
                .peek()
                .map(|f| format!("`{f}`"))
                .unwrap_or_else(|| "end of file".to_owned());
            Err(self.error(format!("expected `{c}`, found {found}")))
        }
    }

    /// Consume an optional `c`.
    fn eat(&mut self, c: char) -> Result<(), ScriptError> {
        self.skip_trivia()?;
        if self.peek() == Some(c) {
            self.bump();
        }
        Ok(())
    }

    fn skip_trivia(&mut self) -> Result<(), ScriptError> {
        loop {
            let rest = self.rest();
            if rest.starts_with("//") {
                while !matches!(self.peek(), None | Some('\n')) {
                    self.bump();
                }
            } else if rest.starts_with("/*") {
                let span = self.span();
                self.bump();
                self.bump();
                while !self.rest().starts_with("*/") {
                    if self.bump().is_none() {
                        return Err(ScriptError::Syntax(Diagnostic::new(
                            self.path,
                            span.line,
                            span.column,
                            "unterminated comment",
                        )));
                    }
                }
                self.bump();
                self.bump();
            } else if self.peek().is_some_and(char::is_whitespace) {
                self.bump();
            } else {
                return Ok(());
            }
        }
    }

    // -- Cursor --------------------------------------------------------------

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            column: self.column,
        }
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax(Diagnostic::new(self.path, self.line, self.column, message))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SPINNER: &str = r#"
        @schema 1;
        import { Component, SceneObject } from "~lib/runtime";
        import "scripts/helpers";

        // A rotating prop.
        export class Spinner extends Component {
            @serialize xrot: i16 = -3;
            @serialize speed: f32 = 1.5e1;
            @serialize label: string = "spin {fast}";
            @serialize @hidden target: SceneObject = null;
            spins: i32;

            fn Update {
                ;; braces in comments } are ignored
                (drop (i32.const 1))
            }

            fn onJump() { (nop) }
        }

        class Internal { }

        wat {
            (data (i32.const 0) "}")
        }
    "#;

    #[test]
    fn parses_imports_classes_and_blocks() {
        let file = parse("scripts/spinner.lum", SPINNER).unwrap();
        assert_eq!(file.schema, Some(1));

        let imports: Vec<_> = file.imports().collect();
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].names, ["Component", "SceneObject"]);
        assert_eq!(imports[0].path(), "~lib/runtime.lum");
        assert!(imports[1].names.is_empty());
        assert_eq!(imports[1].path(), "scripts/helpers.lum");

        let classes: Vec<_> = file.classes().collect();
        assert_eq!(classes.len(), 2);
        let spinner = classes[0];
        assert!(spinner.exported);
        assert_eq!(spinner.base.as_deref(), Some("Component"));
        assert_eq!(spinner.fields.len(), 5);
        assert_eq!(spinner.fields[0].initializer, Some(Literal::Int(-3)));
        assert_eq!(spinner.fields[1].initializer, Some(Literal::Float(15.0)));
        assert_eq!(
            spinner.fields[2].initializer,
            Some(Literal::Str("spin {fast}".to_owned()))
        );
        assert_eq!(spinner.fields[3].decorators, ["serialize", "hidden"]);
        assert_eq!(spinner.fields[3].initializer, Some(Literal::Null));
        assert_eq!(spinner.fields[4].initializer, None);
        assert!(spinner.fields[0].has_decorator("serialize"));
        assert!(!spinner.fields[4].has_decorator("serialize"));

        let update = spinner.method("Update").unwrap();
        assert!(update.body.text.contains("(drop (i32.const 1))"));
        assert!(spinner.method("onJump").is_some());

        assert!(!classes[1].exported);
        assert_eq!(file.wat_blocks().count(), 1);
        assert!(file.wat_blocks().next().unwrap().text.contains("\"}\""));
    }

    #[test]
    fn reports_location_of_syntax_errors() {
        let err = parse("scripts/bad.lum", "export class Broken {\n  value i32;\n}").unwrap_err();
        match err {
            ScriptError::Syntax(d) => {
                assert_eq!(d.file, "scripts/bad.lum");
                assert_eq!(d.line, 2);
                assert!(d.message.contains("expected `:`"), "message: {}", d.message);
            }
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_schema_version() {
        let err = parse("a.lum", "@schema 2;").unwrap_err();
        assert!(matches!(err, ScriptError::UnsupportedSchema { found: 2, .. }));
    }

    #[test]
    fn unterminated_raw_block_is_an_error() {
        let err = parse("a.lum", "wat { (func $f) ").unwrap_err();
        assert!(matches!(err, ScriptError::Syntax(_)));
    }

    #[test]
    fn keyword_does_not_match_identifier_prefix() {
        let err = parse("a.lum", "classic Foo {}").unwrap_err();
        assert!(matches!(err, ScriptError::Syntax(_)));
    }

    #[test]
    fn specifiers_map_to_paths_and_back() {
        assert_eq!(resolve_specifier("scripts/a"), "scripts/a.lum");
        assert_eq!(resolve_specifier("scripts/a.lum"), "scripts/a.lum");
        assert_eq!(specifier_for("scripts/a.lum"), "scripts/a");
    }
}
