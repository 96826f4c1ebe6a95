//! Symbol table over a set of parsed source files.
//!
//! Class names are file-scoped: a name is visible in a file if the file
//! declares it or names it in an `import { ... }` list. Side-effect imports
//! only pull a file into the compilation; they do not bring names into scope.

use std::collections::{HashMap, HashSet};

use crate::runtime::RUNTIME_PATH;
use crate::syntax::{ClassDecl, SourceFile};
use crate::{Diagnostic, ScriptError};

/// Name of the runtime library class every component derives from.
pub const COMPONENT_CLASS: &str = "Component";

/// Location of a class declaration: file index and class index within the
/// file's classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassRef {
    pub file: usize,
    pub class: usize,
}

/// How an upward walk of the inheritance chain ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEnd {
    /// The last class in the chain has no base.
    Root,
    /// A base name could not be resolved from the file that names it.
    Unresolved { class: ClassRef, base: String },
    /// The chain revisits a class.
    Cycle { class: ClassRef },
}

/// Result of [`Program::walk_bases`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseWalk {
    /// Resolved ancestors, nearest first. Does not include the start class.
    pub ancestors: Vec<ClassRef>,
    pub end: WalkEnd,
}

/// Parsed files plus name resolution.
#[derive(Debug, Default)]
pub struct Program {
    files: Vec<SourceFile>,
    by_path: HashMap<String, usize>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parsed file. Adding a path twice replaces the earlier parse and
    /// keeps its index.
    pub fn add(&mut self, file: SourceFile) -> usize {
        match self.by_path.get(&file.path) {
            Some(&index) => {
                self.files[index] = file;
                index
            }
            None => {
                let index = self.files.len();
                self.by_path.insert(file.path.clone(), index);
                self.files.push(file);
                index
            }
        }
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    pub fn file(&self, index: usize) -> &SourceFile {
        &self.files[index]
    }

    pub fn file_index(&self, path: &str) -> Option<usize> {
        self.by_path.get(path).copied()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn class(&self, class: ClassRef) -> &ClassDecl {
        // Indices are only ever produced by this program.
        let file = &self.files[class.file];
        file.classes().nth(class.class).unwrap_or_else(|| {
            unreachable!("class index {} out of range in {}", class.class, file.path)
        })
    }

    /// Every class in program order: files in load order, classes in
    /// declaration order.
    pub fn classes(&self) -> impl Iterator<Item = ClassRef> + '_ {
        self.files.iter().enumerate().flat_map(|(file, source)| {
            (0..source.classes().count()).map(move |class| ClassRef { file, class })
        })
    }

    /// Resolve `name` as seen from file `file`.
    ///
    /// Local declarations shadow imports. A named import is followed into the
    /// target file, which may itself re-export the name through its own
    /// named imports.
    pub fn resolve_class(&self, file: usize, name: &str) -> Option<ClassRef> {
        let mut visited = HashSet::new();
        self.resolve_in(file, name, &mut visited)
    }

    fn resolve_in(
        &self,
        file: usize,
        name: &str,
        visited: &mut HashSet<usize>,
    ) -> Option<ClassRef> {
        if !visited.insert(file) {
            return None;
        }
        let source = &self.files[file];
        if let Some(class) = source.classes().position(|c| c.name == name) {
            return Some(ClassRef { file, class });
        }
        source
            .imports()
            .filter(|import| import.names.iter().any(|n| n == name))
            .filter_map(|import| self.file_index(&import.path()))
            .find_map(|target| self.resolve_in(target, name, visited))
    }

    /// Resolve the base class named by `class`, if it names one.
    pub fn base_of(&self, class: ClassRef) -> Option<Result<ClassRef, String>> {
        let base = self.class(class).base.as_ref()?;
        Some(self.resolve_class(class.file, base).ok_or_else(|| base.clone()))
    }

    /// Walk the inheritance chain upward from `class`.
    pub fn walk_bases(&self, class: ClassRef) -> BaseWalk {
        let mut ancestors = Vec::new();
        let mut seen = HashSet::from([class]);
        let mut current = class;

        loop {
            match self.base_of(current) {
                None => {
                    return BaseWalk {
                        ancestors,
                        end: WalkEnd::Root,
                    }
                }
                Some(Err(base)) => {
                    return BaseWalk {
                        ancestors,
                        end: WalkEnd::Unresolved {
                            class: current,
                            base,
                        },
                    }
                }
                Some(Ok(next)) => {
                    if !seen.insert(next) {
                        return BaseWalk {
                            ancestors,
                            end: WalkEnd::Cycle { class: next },
                        };
                    }
                    ancestors.push(next);
                    current = next;
                }
            }
        }
    }

    /// Like [`walk_bases`](Self::walk_bases) but treats an unresolved base or
    /// a cycle as an error.
    pub fn ancestors(&self, class: ClassRef) -> Result<Vec<ClassRef>, ScriptError> {
        let walk = self.walk_bases(class);
        match walk.end {
            WalkEnd::Root => Ok(walk.ancestors),
            WalkEnd::Unresolved { class: from, base } => {
                let decl = self.class(from);
                Err(self.semantic(
                    from.file,
                    decl.span.line,
                    decl.span.column,
                    format!("unknown base class `{base}` of `{}`", decl.name),
                ))
            }
            WalkEnd::Cycle { class: at } => {
                let decl = self.class(class);
                Err(self.semantic(
                    class.file,
                    decl.span.line,
                    decl.span.column,
                    format!(
                        "inheritance cycle: `{}` reaches `{}` again",
                        decl.name,
                        self.class(at).name
                    ),
                ))
            }
        }
    }

    /// The runtime library's `Component` class, when the library is loaded.
    pub fn component_class(&self) -> Option<ClassRef> {
        let runtime = self.file_index(RUNTIME_PATH)?;
        let source = &self.files[runtime];
        source
            .classes()
            .position(|c| c.name == COMPONENT_CLASS)
            .map(|class| ClassRef {
                file: runtime,
                class,
            })
    }

    /// Whether `class` derives (directly or transitively) from the runtime
    /// `Component`. Chains that end unresolved or in a cycle do not.
    pub fn is_component(&self, class: ClassRef) -> bool {
        let Some(component) = self.component_class() else {
            return false;
        };
        self.walk_bases(class).ancestors.contains(&component)
    }

    pub(crate) fn semantic(
        &self,
        file: usize,
        line: u32,
        column: u32,
        message: impl Into<String>,
    ) -> ScriptError {
        ScriptError::Semantic(Diagnostic::new(
            &self.files[file].path,
            line,
            column,
            message,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse;

    fn program(files: &[(&str, &str)]) -> Program {
        let mut program = Program::new();
        program.add(parse(RUNTIME_PATH, crate::runtime::RUNTIME_SOURCE).unwrap());
        for (path, source) in files {
            program.add(parse(path, source).unwrap());
        }
        program
    }

    fn find(program: &Program, path: &str, name: &str) -> ClassRef {
        let file = program.file_index(path).unwrap();
        program.resolve_class(file, name).unwrap()
    }

    #[test]
    fn resolves_through_named_imports() {
        let p = program(&[
            (
                "scripts/base.lum",
                r#"import { Component } from "~lib/runtime"; export class Mover extends Component {}"#,
            ),
            (
                "scripts/jumper.lum",
                r#"import { Mover } from "scripts/base"; export class Jumper extends Mover {}"#,
            ),
        ]);

        let jumper = find(&p, "scripts/jumper.lum", "Jumper");
        let walk = p.walk_bases(jumper);
        assert_eq!(walk.end, WalkEnd::Root);
        let names: Vec<_> = walk.ancestors.iter().map(|c| p.class(*c).name.as_str()).collect();
        assert_eq!(names, ["Mover", "Component"]);
        assert!(p.is_component(jumper));
    }

    #[test]
    fn side_effect_import_does_not_bring_names_into_scope() {
        let p = program(&[(
            "scripts/a.lum",
            r#"import "~lib/runtime"; export class A extends Component {}"#,
        )]);
        let a = find(&p, "scripts/a.lum", "A");
        assert!(matches!(
            p.walk_bases(a).end,
            WalkEnd::Unresolved { ref base, .. } if base == "Component"
        ));
        assert!(!p.is_component(a));
        assert!(matches!(p.ancestors(a), Err(ScriptError::Semantic(_))));
    }

    #[test]
    fn cycles_terminate() {
        let p = program(&[(
            "scripts/loop.lum",
            "export class A extends B {} class B extends A {}",
        )]);
        let a = find(&p, "scripts/loop.lum", "A");
        assert!(matches!(p.walk_bases(a).end, WalkEnd::Cycle { .. }));
        assert!(!p.is_component(a));
        let err = p.ancestors(a).unwrap_err();
        assert!(err.to_string().contains("inheritance cycle"), "{err}");
    }

    #[test]
    fn local_declaration_shadows_import() {
        let p = program(&[(
            "scripts/shadow.lum",
            r#"import { Component } from "~lib/runtime"; class Component {} export class S extends Component {}"#,
        )]);
        let s = find(&p, "scripts/shadow.lum", "S");
        assert!(!p.is_component(s));
    }

    #[test]
    fn classes_are_listed_in_program_order() {
        let p = program(&[("scripts/two.lum", "class X {} class Y {}")]);
        let names: Vec<_> = p.classes().map(|c| p.class(c).name.clone()).collect();
        assert_eq!(
            names,
            ["Component", "SceneObject", "RuntimeManager", "X", "Y"]
        );
    }
}
