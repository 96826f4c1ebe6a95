//! End-to-end compile tests over the `.lum` fixtures.

use lumen_script::codegen::generate_entry;
use lumen_script::{compile_scripts, FieldDeclaration, InitialValue, ScriptError, VirtualFileMap};

/// Helper: load a script fixture from the tests/fixtures directory.
fn fixture(name: &str) -> String {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read fixture {}: {}", path.display(), e))
}

/// Route compiler logs to the test harness; `RUST_LOG=lumen_script=debug`
/// shows the pipeline steps.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// All fixtures mounted under `scripts/`.
fn fixture_files() -> VirtualFileMap {
    ["spinner", "mover", "jumper", "follower", "helpers"]
        .into_iter()
        .map(|name| (format!("scripts/{name}.lum"), fixture(&format!("{name}.lum"))))
        .collect()
}

// -- Test 1: Every component file registers exactly one descriptor ---------

#[test]
fn registry_contains_every_component_file() {
    init_tracing();
    let compiled = compile_scripts(&fixture_files()).unwrap();

    let mut names: Vec<_> = compiled
        .registry
        .all()
        .map(|d| d.class_name.as_str())
        .collect();
    names.sort_unstable();
    assert_eq!(names, ["Follower", "Jumper", "Mover", "Spinner"]);
    assert!(compiled.registry.find("scripts/helpers.lum").is_none());
}

// -- Test 2: Registry follows sorted file order -----------------------------

#[test]
fn registry_order_follows_sorted_paths() {
    let compiled = compile_scripts(&fixture_files()).unwrap();
    let files: Vec<_> = compiled
        .registry
        .all()
        .map(|d| d.file_identity.as_str())
        .collect();
    assert_eq!(
        files,
        [
            "scripts/follower.lum",
            "scripts/jumper.lum",
            "scripts/mover.lum",
            "scripts/spinner.lum",
        ]
    );
}

// -- Test 3: Inherited serialized fields come first -------------------------

#[test]
fn jumper_inherits_mover_fields() {
    let compiled = compile_scripts(&fixture_files()).unwrap();
    let jumper = compiled.registry.find("Jumper").unwrap();
    assert_eq!(
        jumper.declarations,
        vec![
            FieldDeclaration::new("speed", "f32", InitialValue::Int(1)),
            FieldDeclaration::new("height", "f64", InitialValue::Float(2.5)),
            FieldDeclaration::new("maxJumps", "u8", InitialValue::Int(2)),
        ]
    );
}

// -- Test 4: Exports cover factories and offsets ----------------------------

#[test]
fn exports_cover_every_serialized_field() {
    let compiled = compile_scripts(&fixture_files()).unwrap();
    for descriptor in compiled.registry.all() {
        let factory = format!("add_component_{}", descriptor.class_name);
        assert!(compiled.has_export(&factory), "missing {factory}");
        for field in &descriptor.declarations {
            let offset = format!("get_offset_{}_{}", descriptor.class_name, field.name);
            assert!(compiled.has_export(&offset), "missing {offset}");
        }
    }
    assert!(!compiled.has_export("get_offset_Spinner_ticks"));
}

// -- Test 5: Non-component files are not compiled in pass 2 -----------------

#[test]
fn unreferenced_files_are_not_lowered() {
    let compiled = compile_scripts(&fixture_files()).unwrap();
    assert!(!compiled.text.contains("$lerp"));
    assert!(!compiled.text.contains("$MathHelpers#construct"));
}

// -- Test 6: Entry source matches a fresh regeneration ----------------------

#[test]
fn entry_source_is_regenerated_identically() {
    let compiled = compile_scripts(&fixture_files()).unwrap();
    assert_eq!(compiled.entry_source, generate_entry(&compiled.registry));
}

// -- Test 7: A bad macro in a component surfaces in pass 2 -----------------

#[test]
fn component_with_bad_macro_fails_with_location() {
    init_tracing();
    let mut files = fixture_files();
    files.insert(
        "scripts/broken.lum",
        "import { Component } from \"~lib/runtime\";\n\
         export class Broken extends Component {\n\
         fn Start { (drop (i32.const @offsetof(nothing))) }\n\
         }\n",
    );

    let err = compile_scripts(&files).unwrap_err();
    match err {
        ScriptError::Semantic(d) => {
            assert_eq!(d.file, "scripts/broken.lum");
            assert_eq!(d.line, 3);
            assert!(d.message.contains("no field `nothing`"), "{}", d.message);
        }
        other => panic!("expected semantic error, got {other:?}"),
    }
}

// -- Test 8: Empty input still produces a runnable module -------------------

#[test]
fn empty_file_map_compiles_runtime_only() {
    let compiled = compile_scripts(&VirtualFileMap::new()).unwrap();
    assert!(compiled.registry.is_empty());
    for export in ["_start", "Start", "Update", "ScriptEnd", "memory", "table"] {
        assert!(compiled.has_export(export), "missing {export}");
    }
}
