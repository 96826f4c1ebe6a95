//! Property tests for the registry, the parser and the entry generator.

use std::collections::HashSet;

use lumen_script::codegen::generate_entry;
use lumen_script::syntax::{parse, Literal};
use lumen_script::{FieldDeclaration, InitialValue, ScriptRegistry};
use proptest::prelude::*;

fn ident() -> impl Strategy<Value = String> {
    "[A-Z][a-zA-Z0-9]{0,8}"
}

fn field_name() -> impl Strategy<Value = String> {
    "[a-z][a-zA-Z0-9_]{0,8}"
}

fn declaration() -> impl Strategy<Value = FieldDeclaration> {
    (
        field_name(),
        prop_oneof![Just("f32"), Just("i32"), Just("bool"), Just("string")],
        any::<i32>(),
    )
        .prop_map(|(name, ty, v)| FieldDeclaration::new(&name, ty, InitialValue::Int(v as i64)))
}

/// (file stem index, class name, declarations)
fn registry_ops() -> impl Strategy<Value = Vec<(u8, String, Vec<FieldDeclaration>)>> {
    prop::collection::vec(
        (0u8..12, ident(), prop::collection::vec(declaration(), 0..4)),
        0..24,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn registry_lookup_round_trips(ops in registry_ops()) {
        let mut registry = ScriptRegistry::new();
        let mut first_seen = Vec::new();
        let mut seen = HashSet::new();

        for (file, class, decls) in &ops {
            let path = format!("scripts/s{file}.lum");
            registry.add(&path, class, decls.clone()).unwrap();
            if seen.insert(path.clone()) {
                first_seen.push(path);
            }
        }

        prop_assert_eq!(registry.len(), first_seen.len());
        let order: Vec<_> = registry.all().map(|d| d.file_identity.clone()).collect();
        prop_assert_eq!(&order, &first_seen);
        for descriptor in registry.all() {
            prop_assert_eq!(registry.find(&descriptor.file_identity), Some(descriptor));
        }
    }

    #[test]
    fn entry_generation_is_a_pure_function(ops in registry_ops()) {
        let mut registry = ScriptRegistry::new();
        for (file, class, decls) in &ops {
            registry.add(&format!("scripts/s{file}.lum"), class, decls.clone()).unwrap();
        }

        let first = generate_entry(&registry);
        let second = generate_entry(&registry);
        prop_assert_eq!(&first, &second);

        for descriptor in registry.all() {
            let factory = format!("(export \"add_component_{}\")", descriptor.class_name);
            prop_assert!(first.contains(&factory));
        }
    }

    #[test]
    fn string_initializers_survive_parsing(text in "[ -!#-\\[\\]-~]{0,40}") {
        let source = format!("class A {{ s: string = \"{text}\"; }}");
        let file = parse("scripts/a.lum", &source).unwrap();
        let class = file.classes().next().unwrap();
        prop_assert_eq!(&class.fields[0].initializer, &Some(Literal::Str(text)));
    }

    #[test]
    fn integer_initializers_survive_parsing(value in any::<i64>()) {
        let source = format!("class A {{ n: i64 = {value}; }}");
        let file = parse("scripts/a.lum", &source).unwrap();
        let class = file.classes().next().unwrap();
        prop_assert_eq!(&class.fields[0].initializer, &Some(Literal::Int(value)));
    }
}
