//! Reflection over the parsed program.
//!
//! [`MetadataExtractor`] runs as a [`CompileTransform`] during compile pass 1
//! and records one [`ScriptDescriptor`](crate::ScriptDescriptor) per script
//! file that exports a class derived from the runtime `Component`.

use crate::program::{ClassRef, Program};
use crate::registry::{FieldDeclaration, InitialValue, ScriptRegistry};
use crate::syntax::{FieldDecl, Literal};
use crate::ScriptError;

/// Decorator that marks a field as editor-visible and host-populated.
pub const SERIALIZE_DECORATOR: &str = "serialize";

/// Hook into a compiler invocation.
///
/// `after_resolve` sees the fully parsed program with name resolution
/// available and runs before any lowering.
pub trait CompileTransform {
    fn after_resolve(&mut self, program: &Program) -> Result<(), ScriptError>;
}

/// Fills a [`ScriptRegistry`] from the component classes of a program.
#[derive(Debug, Default)]
pub struct MetadataExtractor {
    registry: ScriptRegistry,
}

impl MetadataExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    pub fn into_registry(self) -> ScriptRegistry {
        self.registry
    }

    fn extract_file(&mut self, program: &Program, file: usize) -> Result<(), ScriptError> {
        let source = program.file(file);
        let mut found: Option<ClassRef> = None;

        for (index, class) in source.classes().enumerate() {
            if !class.exported {
                continue;
            }
            let class_ref = ClassRef { file, class: index };
            if !program.is_component(class_ref) {
                continue;
            }
            match found {
                None => found = Some(class_ref),
                Some(first) => tracing::debug!(
                    file = %source.path,
                    class = %class.name,
                    registered = %program.class(first).name,
                    "ignoring additional component class in file"
                ),
            }
        }

        let Some(class_ref) = found else {
            return Ok(());
        };

        let declarations = serialized_fields(program, class_ref);
        self.registry
            .add(&source.path, &program.class(class_ref).name, declarations)
    }
}

impl CompileTransform for MetadataExtractor {
    fn after_resolve(&mut self, program: &Program) -> Result<(), ScriptError> {
        for (index, file) in program.files().iter().enumerate() {
            if file.is_library() {
                continue;
            }
            self.extract_file(program, index)?;
        }
        tracing::debug!(components = self.registry.len(), "metadata extraction finished");
        Ok(())
    }
}

/// `@serialize` fields of `class`, inherited fields first.
fn serialized_fields(program: &Program, class: ClassRef) -> Vec<FieldDeclaration> {
    let mut chain = program.walk_bases(class).ancestors;
    chain.reverse();
    chain.push(class);

    chain
        .into_iter()
        .flat_map(|c| program.class(c).fields.iter())
        .filter(|field| field.has_decorator(SERIALIZE_DECORATOR))
        .map(|field| {
            FieldDeclaration::new(&field.name, &field.type_name, initial_value(field))
        })
        .collect()
}

fn initial_value(field: &FieldDecl) -> InitialValue {
    match &field.initializer {
        Some(Literal::Int(v)) => InitialValue::Int(*v),
        Some(Literal::Float(v)) => InitialValue::Float(*v),
        Some(Literal::Bool(b)) => InitialValue::Bool(*b),
        Some(Literal::Str(s)) => InitialValue::Text(s.clone()),
        Some(Literal::Null) | None => InitialValue::Null,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RUNTIME_PATH, RUNTIME_SOURCE};
    use crate::syntax::parse;

    fn extract(files: &[(&str, &str)]) -> ScriptRegistry {
        let mut program = Program::new();
        program.add(parse(RUNTIME_PATH, RUNTIME_SOURCE).unwrap());
        for (path, source) in files {
            program.add(parse(path, source).unwrap());
        }
        let mut extractor = MetadataExtractor::new();
        extractor.after_resolve(&program).unwrap();
        extractor.into_registry()
    }

    #[test]
    fn extracts_serialized_fields_with_initial_values() {
        let registry = extract(&[(
            "scripts/spinner.lum",
            r#"
            import { Component, SceneObject } from "~lib/runtime";
            export class Spinner extends Component {
                @serialize xrot: i16 = 3;
                @serialize speed: f32 = 0.5;
                @serialize visible: bool = true;
                @serialize label: string = "hi";
                @serialize target: SceneObject = null;
                @serialize other: Spinner;
                counter: i32 = 9;
            }
            "#,
        )]);

        let spinner = registry.find("scripts/spinner.lum").unwrap();
        assert_eq!(spinner.class_name, "Spinner");
        assert_eq!(
            spinner.declarations,
            vec![
                FieldDeclaration::new("xrot", "i16", InitialValue::Int(3)),
                FieldDeclaration::new("speed", "f32", InitialValue::Float(0.5)),
                FieldDeclaration::new("visible", "bool", InitialValue::Bool(true)),
                FieldDeclaration::new("label", "string", InitialValue::Text("hi".into())),
                FieldDeclaration::new("target", "SceneObject", InitialValue::Null),
                FieldDeclaration::new("other", "Spinner", InitialValue::Null),
            ]
        );
    }

    #[test]
    fn inherited_fields_come_first() {
        let registry = extract(&[
            (
                "scripts/mover.lum",
                r#"import { Component } from "~lib/runtime";
                   export class Mover extends Component { @serialize speed: f32 = 2; }"#,
            ),
            (
                "scripts/jumper.lum",
                r#"import { Mover } from "scripts/mover";
                   export class Jumper extends Mover { @serialize height: f32 = 1; }"#,
            ),
        ]);

        let jumper = registry.find("Jumper").unwrap();
        let names: Vec<_> = jumper.declarations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["speed", "height"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn first_component_class_in_a_file_wins() {
        let registry = extract(&[(
            "scripts/pair.lum",
            r#"import { Component } from "~lib/runtime";
               class Hidden extends Component {}
               export class Helper {}
               export class First extends Component {}
               export class Second extends Component {}"#,
        )]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find("scripts/pair.lum").unwrap().class_name, "First");
    }

    #[test]
    fn unresolved_and_cyclic_chains_are_skipped() {
        let registry = extract(&[
            ("scripts/orphan.lum", "export class Orphan extends Missing {}"),
            ("scripts/cycle.lum", "export class A extends B {} class B extends A {}"),
        ]);
        assert!(registry.is_empty());
    }
}
