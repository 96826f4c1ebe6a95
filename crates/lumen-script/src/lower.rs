//! Lowering of a resolved program to a WebAssembly text module.
//!
//! Class layouts are computed here, compile-time macros in method bodies and
//! `wat` blocks are expanded, and the module skeleton (memory, heap globals,
//! callback table, static data) is emitted around the lowered code.
//!
//! Macros:
//!
//! | macro                          | expands to                                  |
//! |--------------------------------|---------------------------------------------|
//! | `@offsetof(Class, field)`      | byte offset of `field` inside `Class`       |
//! | `@offsetof(field)`             | same, for the enclosing class               |
//! | `@sizeof(Class)`               | payload size of `Class`                     |
//! | `@rtid(Class)`                 | runtime type id of `Class`                  |
//! | `@string("text")`              | address of a static string object           |
//! | `@funcref(Class#method)`       | callback table index of the method          |
//! | `@funcref(method)`             | same, for the enclosing class               |

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::program::{ClassRef, Program};
use crate::runtime::{FIRST_CLASS_RTID, OBJECT_HEADER_SIZE, STATIC_DATA_BASE, STRING_RTID};
use crate::syntax::{ClassDecl, Literal, RawBlock, Span};
use crate::ScriptError;

const LIFECYCLE_METHODS: [&str; 3] = ["Start", "Update", "LateUpdate"];
const RESERVED_METHODS: [&str; 1] = ["construct"];
const PAGE_SIZE: u32 = 0x1_0000;

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// Field types
// ---------------------------------------------------------------------------

/// Storage class of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    Isize,
    Usize,
    I64,
    U64,
    F32,
    F64,
    Str,
    Vec3,
    Quat,
    Mat4,
    /// Another class of the program.
    Ref,
    /// A name the program does not declare: an opaque 32-bit host handle.
    Opaque,
}

impl FieldType {
    fn primitive(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => FieldType::Bool,
            "i8" => FieldType::I8,
            "u8" => FieldType::U8,
            "i16" => FieldType::I16,
            "u16" => FieldType::U16,
            "i32" => FieldType::I32,
            "u32" => FieldType::U32,
            "isize" => FieldType::Isize,
            "usize" => FieldType::Usize,
            "i64" => FieldType::I64,
            "u64" => FieldType::U64,
            "f32" => FieldType::F32,
            "f64" => FieldType::F64,
            "string" => FieldType::Str,
            "vec3" => FieldType::Vec3,
            "quat" => FieldType::Quat,
            "mat4" => FieldType::Mat4,
            _ => return None,
        })
    }

    pub(crate) fn size(self) -> u32 {
        match self {
            FieldType::Bool | FieldType::I8 | FieldType::U8 => 1,
            FieldType::I16 | FieldType::U16 => 2,
            FieldType::I32
            | FieldType::U32
            | FieldType::Isize
            | FieldType::Usize
            | FieldType::F32
            | FieldType::Str
            | FieldType::Ref
            | FieldType::Opaque => 4,
            FieldType::I64 | FieldType::U64 | FieldType::F64 => 8,
            FieldType::Vec3 => 12,
            FieldType::Quat => 16,
            FieldType::Mat4 => 64,
        }
    }

    fn align(self) -> u32 {
        match self {
            FieldType::Vec3 | FieldType::Quat | FieldType::Mat4 => 4,
            other => other.size(),
        }
    }

    /// Inclusive literal range accepted for integer fields.
    fn int_range(self) -> Option<(i64, i64)> {
        match self {
            FieldType::I8 | FieldType::U8 => Some((i8::MIN as i64, u8::MAX as i64)),
            FieldType::I16 | FieldType::U16 => Some((i16::MIN as i64, u16::MAX as i64)),
            FieldType::I32 | FieldType::U32 | FieldType::Isize | FieldType::Usize => {
                Some((i32::MIN as i64, u32::MAX as i64))
            }
            FieldType::I64 | FieldType::U64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    fn is_reference(self) -> bool {
        matches!(self, FieldType::Ref | FieldType::Opaque)
    }
}

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct FieldSlot {
    pub name: String,
    pub ty: FieldType,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct ClassLayout {
    /// Inherited fields first.
    pub fields: Vec<FieldSlot>,
    pub size: u32,
    pub align: u32,
    pub rtid: u32,
}

impl ClassLayout {
    pub(crate) fn offset_of(&self, field: &str) -> Option<u32> {
        self.fields.iter().find(|f| f.name == field).map(|f| f.offset)
    }
}

/// Layout of every class in a program.
#[derive(Debug, Default)]
pub(crate) struct Layouts {
    by_class: HashMap<ClassRef, ClassLayout>,
}

impl Layouts {
    pub(crate) fn compute(program: &Program) -> Result<Self, ScriptError> {
        let mut layouts = Layouts::default();
        let rtids: HashMap<ClassRef, u32> = program
            .classes()
            .zip(FIRST_CLASS_RTID..)
            .collect();

        for class in program.classes() {
            let mut chain = program.ancestors(class)?;
            chain.reverse();
            chain.push(class);
            for c in chain {
                if !layouts.by_class.contains_key(&c) {
                    let layout = layouts.layout_one(program, c, rtids[&c])?;
                    layouts.by_class.insert(c, layout);
                }
            }
        }
        Ok(layouts)
    }

    /// Lay out `class` assuming its base is already laid out.
    fn layout_one(
        &self,
        program: &Program,
        class: ClassRef,
        rtid: u32,
    ) -> Result<ClassLayout, ScriptError> {
        let decl = program.class(class);
        let (mut fields, mut cursor, mut align) = match program.base_of(class) {
            Some(Ok(base)) => {
                let base = &self.by_class[&base];
                (base.fields.clone(), base.size, base.align)
            }
            _ => (Vec::new(), 0, 1),
        };

        for field in &decl.fields {
            if fields.iter().any(|f: &FieldSlot| f.name == field.name) {
                return Err(program.semantic(
                    class.file,
                    field.span.line,
                    field.span.column,
                    format!("duplicate field `{}` in class `{}`", field.name, decl.name),
                ));
            }
            let ty = FieldType::primitive(&field.type_name).unwrap_or_else(|| {
                if program.resolve_class(class.file, &field.type_name).is_some() {
                    FieldType::Ref
                } else {
                    FieldType::Opaque
                }
            });
            cursor = align_up(cursor, ty.align());
            fields.push(FieldSlot {
                name: field.name.clone(),
                ty,
                offset: cursor,
            });
            cursor += ty.size();
            align = align.max(ty.align());
        }

        Ok(ClassLayout {
            fields,
            size: align_up(cursor, align),
            align,
            rtid,
        })
    }

    pub(crate) fn get(&self, class: ClassRef) -> &ClassLayout {
        &self.by_class[&class]
    }
}

// ---------------------------------------------------------------------------
// Static strings
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StringPool {
    next: u32,
    /// (header address, text) in placement order.
    entries: Vec<(u32, String)>,
    by_text: HashMap<String, u32>,
}

impl StringPool {
    fn new() -> Self {
        Self {
            next: STATIC_DATA_BASE,
            entries: Vec::new(),
            by_text: HashMap::new(),
        }
    }

    /// Address of the string object (just past its header).
    fn intern(&mut self, text: &str) -> u32 {
        if let Some(&address) = self.by_text.get(text) {
            return address;
        }
        let header = self.next;
        let address = header + OBJECT_HEADER_SIZE;
        let units = text.encode_utf16().count() as u32;
        self.next = align_up(address + units * 2, 8);
        self.entries.push((header, text.to_owned()));
        self.by_text.insert(text.to_owned(), address);
        address
    }

    fn end(&self) -> u32 {
        self.next
    }

    fn write_segments(&self, out: &mut String) {
        for (header, text) in &self.entries {
            let mut bytes = Vec::with_capacity(OBJECT_HEADER_SIZE as usize + text.len() * 2);
            let units: Vec<u16> = text.encode_utf16().collect();
            bytes.extend_from_slice(&STRING_RTID.to_le_bytes());
            bytes.extend_from_slice(&(units.len() as u32 * 2).to_le_bytes());
            for unit in units {
                bytes.extend_from_slice(&unit.to_le_bytes());
            }
            let _ = write!(out, "  (data (i32.const {header}) \"");
            for byte in bytes {
                let _ = write!(out, "\\{byte:02x}");
            }
            out.push_str("\")\n");
        }
    }
}

// ---------------------------------------------------------------------------
// Raw text scanning
// ---------------------------------------------------------------------------

/// If `text[at..]` starts a WebAssembly string or comment, the index just
/// past it.
fn skip_lexeme(text: &str, at: usize) -> Option<usize> {
    let rest = &text[at..];
    if rest.starts_with('"') {
        let mut escaped = false;
        for (i, c) in rest.char_indices().skip(1) {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => return Some(at + i + 1),
                _ => {}
            }
        }
        return Some(text.len());
    }
    if rest.starts_with(";;") {
        return Some(rest.find('\n').map_or(text.len(), |nl| at + nl));
    }
    if rest.starts_with("(;") {
        return Some(rest.find(";)").map_or(text.len(), |end| at + end + 2));
    }
    None
}

/// Split a `wat` block into its top-level s-expressions, as
/// `(byte offset, text)` pairs.
fn split_fields(text: &str) -> Result<Vec<(usize, &str)>, (usize, &'static str)> {
    let mut fields = Vec::new();
    let mut depth = 0u32;
    let mut start = 0;
    let mut i = 0;

    while i < text.len() {
        if let Some(next) = skip_lexeme(text, i) {
            if depth == 0 && text[i..].starts_with('"') {
                return Err((i, "string outside of a module field"));
            }
            i = next;
            continue;
        }
        let Some(c) = text[i..].chars().next() else {
            break;
        };
        match c {
            '(' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            ')' => {
                if depth == 0 {
                    return Err((i, "unbalanced `)`"));
                }
                depth -= 1;
                if depth == 0 {
                    fields.push((start, &text[start..=i]));
                }
            }
            c if depth == 0 && !c.is_whitespace() => {
                return Err((i, "unexpected text outside of a module field"));
            }
            _ => {}
        }
        i += c.len_utf8();
    }

    if depth != 0 {
        return Err((start, "unterminated module field"));
    }
    Ok(fields)
}

/// Keyword that opens an s-expression (`(import ...` -> `import`).
fn head_keyword(field: &str) -> &str {
    let inner = field.trim_start_matches('(').trim_start();
    let end = inner
        .find(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .unwrap_or(inner.len());
    &inner[..end]
}

/// Source position of byte `offset` within a raw block starting at `origin`.
fn locate(origin: Span, text: &str, offset: usize) -> Span {
    let prefix = &text[..offset.min(text.len())];
    match prefix.rfind('\n') {
        Some(nl) => Span {
            line: origin.line + prefix.matches('\n').count() as u32,
            column: prefix[nl + 1..].chars().count() as u32 + 1,
        },
        None => Span {
            line: origin.line,
            column: origin.column + prefix.chars().count() as u32,
        },
    }
}

fn parse_quoted(text: &str) -> Option<(String, usize)> {
    let mut chars = text.char_indices();
    if chars.next()?.1 != '"' {
        return None;
    }
    let mut out = String::new();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((out, i + 1)),
            '\\' => match chars.next()?.1 {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                other => out.push(other),
            },
            c => out.push(c),
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

/// Output of [`lower`].
#[derive(Debug)]
pub(crate) struct Lowered {
    pub text: String,
    pub heap_base: u32,
    pub callback_count: u32,
}

/// Where a piece of raw text came from.
#[derive(Clone, Copy)]
struct Scope {
    file: usize,
    class: Option<ClassRef>,
    origin: Span,
}

struct Lowerer<'p> {
    program: &'p Program,
    layouts: Layouts,
    strings: StringPool,
    table: Vec<String>,
    table_index: HashMap<String, u32>,
    imports: Vec<String>,
    code: String,
}

/// Lower a resolved program to a WebAssembly text module.
///
/// # Errors
///
/// [`ScriptError::Semantic`] for duplicate classes or members, inheritance
/// cycles, bad initializers, unknown macro arguments and malformed `wat`
/// blocks.
pub(crate) fn lower(program: &Program) -> Result<Lowered, ScriptError> {
    check_unique_classes(program)?;
    let layouts = Layouts::compute(program)?;

    let mut lowerer = Lowerer {
        program,
        layouts,
        strings: StringPool::new(),
        table: Vec::new(),
        table_index: HashMap::new(),
        imports: Vec::new(),
        code: String::new(),
    };
    lowerer.build_table()?;

    for class in program.classes() {
        lowerer.lower_class(class)?;
    }
    for (file, source) in program.files().iter().enumerate() {
        for block in source.wat_blocks() {
            lowerer.lower_block(file, block)?;
        }
    }

    Ok(lowerer.finish())
}

fn check_unique_classes(program: &Program) -> Result<(), ScriptError> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for class in program.classes() {
        let decl = program.class(class);
        let path = program.file(class.file).path.as_str();
        if let Some(first) = seen.insert(&decl.name, path) {
            return Err(program.semantic(
                class.file,
                decl.span.line,
                decl.span.column,
                format!("duplicate class `{}` (first declared in {first})", decl.name),
            ));
        }
    }
    Ok(())
}

impl<'p> Lowerer<'p> {
    fn build_table(&mut self) -> Result<(), ScriptError> {
        for class in self.program.classes() {
            let decl = self.program.class(class);
            for (i, method) in decl.methods.iter().enumerate() {
                let reserved = RESERVED_METHODS.contains(&method.name.as_str());
                let duplicate = decl.methods[..i].iter().any(|m| m.name == method.name);
                if reserved || duplicate {
                    let what = if reserved { "reserved" } else { "duplicate" };
                    return Err(self.program.semantic(
                        class.file,
                        method.span.line,
                        method.span.column,
                        format!("{what} method `{}` in class `{}`", method.name, decl.name),
                    ));
                }
            }

            let custom = decl
                .methods
                .iter()
                .map(|m| m.name.as_str())
                .filter(|name| !LIFECYCLE_METHODS.contains(name));
            for method in LIFECYCLE_METHODS.into_iter().chain(custom) {
                let name = format!("${}#{}", decl.name, method);
                self.table_index.insert(name.clone(), self.table.len() as u32);
                self.table.push(name);
            }
        }
        Ok(())
    }

    fn lower_class(&mut self, class: ClassRef) -> Result<(), ScriptError> {
        let program = self.program;
        let decl = program.class(class);
        let base = match program.base_of(class) {
            Some(Ok(base)) => Some(program.class(base).name.as_str()),
            _ => None,
        };

        // construct
        let mut construct = format!("  (func ${}#construct (param $this i32)\n", decl.name);
        if let Some(base) = base {
            let _ = writeln!(construct, "    (call ${base}#construct (local.get $this))");
        }
        for field in &decl.fields {
            let Some(literal) = &field.initializer else {
                continue;
            };
            let slot = self
                .layouts
                .get(class)
                .fields
                .iter()
                .find(|f| f.name == field.name)
                .cloned();
            let Some(slot) = slot else {
                continue;
            };
            match self.initializer_store(&slot, literal) {
                Ok(Some(store)) => {
                    let _ = writeln!(construct, "    {store}");
                }
                Ok(None) => {}
                Err(message) => {
                    return Err(program.semantic(
                        class.file,
                        field.span.line,
                        field.span.column,
                        format!(
                            "field `{}: {}` in class `{}`: {message}",
                            field.name, field.type_name, decl.name
                        ),
                    ))
                }
            }
        }
        construct.push_str("  )\n");
        self.code.push_str(&construct);

        // lifecycle
        for lifecycle in LIFECYCLE_METHODS {
            let body = match (decl.method(lifecycle), base) {
                (Some(method), _) => self.expand(
                    &method.body.text,
                    Scope {
                        file: class.file,
                        class: Some(class),
                        origin: method.body.span,
                    },
                )?,
                (None, Some(base)) => format!("(call ${base}#{lifecycle} (local.get $this))"),
                (None, None) => String::new(),
            };
            let _ = writeln!(
                self.code,
                "  (func ${}#{lifecycle} (param $this i32)\n    {}\n  )",
                decl.name,
                body.trim()
            );
        }

        // custom methods
        for method in &decl.methods {
            if LIFECYCLE_METHODS.contains(&method.name.as_str()) {
                continue;
            }
            let body = self.expand(
                &method.body.text,
                Scope {
                    file: class.file,
                    class: Some(class),
                    origin: method.body.span,
                },
            )?;
            let _ = writeln!(
                self.code,
                "  (func ${}#{} (param $this i32)\n    {}\n  )",
                decl.name,
                method.name,
                body.trim()
            );
        }
        Ok(())
    }

    fn initializer_store(
        &mut self,
        slot: &FieldSlot,
        literal: &Literal,
    ) -> Result<Option<String>, String> {
        let offset = slot.offset;
        let target = "(local.get $this)";
        let ty = slot.ty;

        let store = match (ty, literal) {
            (FieldType::Vec3 | FieldType::Quat | FieldType::Mat4, _) => {
                return Err("vector and matrix fields cannot have an initializer".to_owned())
            }
            (_, Literal::Null) if ty.is_reference() || ty == FieldType::Str => return Ok(None),
            (FieldType::Bool, Literal::Bool(b)) => {
                format!("(i32.store8 offset={offset} {target} (i32.const {}))", *b as i32)
            }
            (FieldType::F32, Literal::Int(v)) => {
                format!("(f32.store offset={offset} {target} (f32.const {v}))")
            }
            (FieldType::F32, Literal::Float(v)) => {
                format!("(f32.store offset={offset} {target} (f32.const {v:?}))")
            }
            (FieldType::F64, Literal::Int(v)) => {
                format!("(f64.store offset={offset} {target} (f64.const {v}))")
            }
            (FieldType::F64, Literal::Float(v)) => {
                format!("(f64.store offset={offset} {target} (f64.const {v:?}))")
            }
            (FieldType::Str, Literal::Str(text)) => {
                let address = self.strings.intern(text);
                format!("(i32.store offset={offset} {target} (i32.const {address}))")
            }
            (_, Literal::Int(v)) if ty.int_range().is_some() => {
                let (min, max) = ty.int_range().unwrap_or((i64::MIN, i64::MAX));
                if *v < min || *v > max {
                    return Err(format!("initializer {v} is out of range"));
                }
                match ty.size() {
                    1 => format!("(i32.store8 offset={offset} {target} (i32.const {v}))"),
                    2 => format!("(i32.store16 offset={offset} {target} (i32.const {v}))"),
                    4 => format!("(i32.store offset={offset} {target} (i32.const {v}))"),
                    _ => format!("(i64.store offset={offset} {target} (i64.const {v}))"),
                }
            }
            (_, literal) => {
                let found = match literal {
                    Literal::Int(_) => "an integer",
                    Literal::Float(_) => "a decimal",
                    Literal::Bool(_) => "a boolean",
                    Literal::Str(_) => "a string",
                    Literal::Null => "null",
                };
                return Err(format!("cannot be initialized with {found}"));
            }
        };
        Ok(Some(store))
    }

    fn lower_block(&mut self, file: usize, block: &RawBlock) -> Result<(), ScriptError> {
        let fields = split_fields(&block.text).map_err(|(offset, message)| {
            let at = locate(block.span, &block.text, offset);
            self.program
                .semantic(file, at.line, at.column, format!("malformed wat block: {message}"))
        })?;

        for (offset, field) in fields {
            let expanded = self.expand(
                field,
                Scope {
                    file,
                    class: None,
                    origin: locate(block.span, &block.text, offset),
                },
            )?;
            if head_keyword(field) == "import" {
                self.imports.push(expanded);
            } else {
                let _ = writeln!(self.code, "  {expanded}");
            }
        }
        Ok(())
    }

    // -- Macros --------------------------------------------------------------

    fn expand(&mut self, text: &str, scope: Scope) -> Result<String, ScriptError> {
        let mut out = String::with_capacity(text.len());
        let mut i = 0;

        while i < text.len() {
            if let Some(next) = skip_lexeme(text, i) {
                out.push_str(&text[i..next]);
                i = next;
                continue;
            }
            let Some(c) = text[i..].chars().next() else {
                break;
            };
            if c != '@' {
                out.push(c);
                i += c.len_utf8();
                continue;
            }

            let name_end = text[i + 1..]
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .map_or(text.len(), |n| i + 1 + n);
            let name = &text[i + 1..name_end];
            if !matches!(name, "offsetof" | "sizeof" | "rtid" | "string" | "funcref")
                || !text[name_end..].starts_with('(')
            {
                out.push('@');
                i += 1;
                continue;
            }

            let args_start = name_end + 1;
            let (value, end) = if name == "string" {
                let lead = text[args_start..].len() - text[args_start..].trim_start().len();
                let quoted = args_start + lead;
                let (literal, used) = parse_quoted(&text[quoted..])
                    .ok_or_else(|| self.macro_error(scope, text, i, "@string expects a quoted string"))?;
                let after = quoted + used;
                let lead = text[after..].len() - text[after..].trim_start().len();
                if !text[after + lead..].starts_with(')') {
                    return Err(self.macro_error(scope, text, i, "expected `)` after @string argument"));
                }
                (self.strings.intern(&literal), after + lead + 1)
            } else {
                let close = text[args_start..]
                    .find(')')
                    .map(|n| args_start + n)
                    .ok_or_else(|| self.macro_error(scope, text, i, "unterminated macro"))?;
                let args: Vec<&str> = text[args_start..close].split(',').map(str::trim).collect();
                let value = self
                    .evaluate(name, &args, scope)
                    .map_err(|message| self.macro_error(scope, text, i, &message))?;
                (value, close + 1)
            };

            let _ = write!(out, "{value}");
            i = end;
        }
        Ok(out)
    }

    fn evaluate(&self, name: &str, args: &[&str], scope: Scope) -> Result<u32, String> {
        match (name, args) {
            ("offsetof", [class, field]) => {
                let class = self.visible_class(scope, class)?;
                self.field_offset(class, field)
            }
            ("offsetof", [field]) => {
                let class = scope
                    .class
                    .ok_or("@offsetof(field) is only valid inside a class method")?;
                self.field_offset(class, field)
            }
            ("sizeof", [class]) => Ok(self.layouts.get(self.visible_class(scope, class)?).size),
            ("rtid", [class]) => Ok(self.layouts.get(self.visible_class(scope, class)?).rtid),
            ("funcref", [target]) => {
                let (class, method) = match target.split_once('#') {
                    Some((class, method)) => (self.visible_class(scope, class)?, method),
                    None => (
                        scope
                            .class
                            .ok_or("@funcref(method) is only valid inside a class method")?,
                        *target,
                    ),
                };
                self.method_index(class, method)
            }
            _ => Err(format!("wrong number of arguments to @{name}")),
        }
    }

    fn visible_class(&self, scope: Scope, name: &str) -> Result<ClassRef, String> {
        if let Some(class) = self.program.resolve_class(scope.file, name) {
            return Ok(class);
        }
        let declared_elsewhere = self
            .program
            .classes()
            .any(|c| self.program.class(c).name == name);
        if declared_elsewhere {
            Err(format!("class `{name}` is not visible here; add it to an import list"))
        } else {
            Err(format!("unknown class `{name}`"))
        }
    }

    fn field_offset(&self, class: ClassRef, field: &str) -> Result<u32, String> {
        self.layouts.get(class).offset_of(field).ok_or_else(|| {
            format!(
                "class `{}` has no field `{field}`",
                self.program.class(class).name
            )
        })
    }

    fn method_index(&self, class: ClassRef, method: &str) -> Result<u32, String> {
        let owner: &ClassDecl = if LIFECYCLE_METHODS.contains(&method) {
            self.program.class(class)
        } else {
            let mut chain = vec![class];
            chain.extend(self.program.walk_bases(class).ancestors);
            chain
                .into_iter()
                .map(|c| self.program.class(c))
                .find(|decl| decl.method(method).is_some())
                .ok_or_else(|| {
                    format!(
                        "class `{}` has no method `{method}`",
                        self.program.class(class).name
                    )
                })?
        };
        let name = format!("${}#{method}", owner.name);
        self.table_index
            .get(&name)
            .copied()
            .ok_or_else(|| format!("method `{name}` is not in the callback table"))
    }

    fn macro_error(&self, scope: Scope, text: &str, offset: usize, message: &str) -> ScriptError {
        let at = locate(scope.origin, text, offset);
        self.program.semantic(scope.file, at.line, at.column, message)
    }

    // -- Module --------------------------------------------------------------

    fn finish(self) -> Lowered {
        let heap_base = align_up(self.strings.end(), 16);
        let pages = heap_base / PAGE_SIZE + 2;
        let callback_count = self.table.len() as u32;

        let mut out = String::new();
        out.push_str(";; generated by lumen-script; do not edit\n(module\n");
        for import in &self.imports {
            let _ = writeln!(out, "  {import}");
        }
        let _ = writeln!(out, "  (memory (export \"memory\") {pages})");
        let _ = writeln!(out, "  (global $heap_top (mut i32) (i32.const {heap_base}))");
        let _ = writeln!(out, "  (global $frame_mark (mut i32) (i32.const {heap_base}))");
        out.push_str("  (type $__callback (func (param i32)))\n");
        let _ = writeln!(out, "  (table (export \"table\") {callback_count} funcref)");
        if !self.table.is_empty() {
            let _ = writeln!(out, "  (elem (i32.const 0) func {})", self.table.join(" "));
        }
        let _ = writeln!(
            out,
            "  (global (export \"__callbackCount\") i32 (i32.const {callback_count}))"
        );
        self.strings.write_segments(&mut out);
        out.push_str(&self.code);
        out.push_str(")\n");

        Lowered {
            text: out,
            heap_base,
            callback_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
