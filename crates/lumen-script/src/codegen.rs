//! Generation of the bridging entry files.
//!
//! Both generators are pure functions of their input: the same registry
//! always produces byte-identical text.

use std::fmt::Write as _;

use crate::registry::{ScriptDescriptor, ScriptRegistry};
use crate::runtime::RUNTIME_SPECIFIER;
use crate::syntax::specifier_for;

/// Virtual path of the generated pass-2 entry.
pub const ENTRY_PATH: &str = "~entry.lum";

/// Virtual path of the generated pass-1 (reflection) entry.
pub const EXTRACTION_ENTRY_PATH: &str = "~extract.lum";

/// Transform fields of the runtime `SceneObject` the host can bind to.
pub const TRANSFORM_FIELDS: [&str; 5] = ["worldMatrix", "position", "rotation", "scale", "parent"];

/// Lifecycle exports and the per-component method each one dispatches.
const DISPATCHED_METHODS: [&str; 3] = ["Start", "Update", "LateUpdate"];

const HEADER: &str = "// Generated by lumen-script. Do not edit.\n@schema 1;\n";

/// Pass-1 entry: a side-effect import of every script file, sorted by path.
pub fn generate_extraction_entry<'a>(files: impl IntoIterator<Item = &'a str>) -> String {
    let mut paths: Vec<&str> = files.into_iter().collect();
    paths.sort_unstable();
    paths.dedup();

    let mut out = String::from(HEADER);
    for path in paths {
        let _ = writeln!(out, "import \"{}\";", specifier_for(path));
    }
    out
}

/// Name of the exported factory for `class`.
pub fn factory_export(class: &str) -> String {
    format!("add_component_{class}")
}

/// Name of the exported offset constant for `class.field`.
pub fn offset_export(class: &str, field: &str) -> String {
    format!("get_offset_{class}_{field}")
}

/// Name of the exported binding accessor for a transform field.
pub fn bind_export(field: &str) -> String {
    format!("bind_{field}")
}

/// Pass-2 entry for the given registry.
pub fn generate_entry(registry: &ScriptRegistry) -> String {
    let mut out = String::from(HEADER);

    let _ = writeln!(
        out,
        "import {{ Component, SceneObject, RuntimeManager }} from \"{RUNTIME_SPECIFIER}\";"
    );
    for script in registry.all() {
        let _ = writeln!(
            out,
            "import {{ {} }} from \"{}\";",
            script.class_name,
            specifier_for(&script.file_identity)
        );
    }

    out.push_str("\nwat {\n");
    write_manager(&mut out);
    write_bindings(&mut out);
    for script in registry.all() {
        write_component(&mut out, script);
    }
    for method in DISPATCHED_METHODS {
        write_dispatch(&mut out, registry, method);
    }
    write_lifecycle(&mut out);
    out.push_str("}\n");
    out
}

fn write_manager(out: &mut String) {
    out.push_str(
        r#"  (global $manager (mut i32) (i32.const 0))

  (func (export "_start")
    (global.set $manager (call $RuntimeManager#new)))

  (func (export "addSceneObject") (param $id i32) (result i32)
    (call $RuntimeManager#addSceneObject (global.get $manager) (local.get $id)))
  (func (export "registerSceneObject") (param $object i32)
    (call $RuntimeManager#registerSceneObject (global.get $manager) (local.get $object)))
  (func (export "registerComponent") (param $component i32)
    (call $RuntimeManager#registerComponent (global.get $manager) (local.get $component)))
  (func (export "findSceneObjectById") (param $id i32) (result i32)
    (call $RuntimeManager#findSceneObjectById (global.get $manager) (local.get $id)))
  (func (export "__newString") (param $units i32) (result i32)
    (call $__newString (local.get $units)))
  (func (export "__newArray") (param $elemSize i32) (param $length i32) (result i32)
    (call $__newArray (local.get $elemSize) (local.get $length)))
  (func (export "__collect")
    (call $__collect))
  (func (export "__invokeCallback") (param $index i32) (param $target i32)
    (call_indirect (type $__callback) (local.get $target) (local.get $index)))

"#,
    );
}

fn write_bindings(out: &mut String) {
    for field in TRANSFORM_FIELDS {
        let export = bind_export(field);
        match field {
            "worldMatrix" => {
                let _ = writeln!(
                    out,
                    "  (func (export \"{export}\") (param $object i32) (result i32)\n    \
                     (i32.store8 offset=@offsetof(SceneObject, bound) (local.get $object) (i32.const 1))\n    \
                     (i32.add (local.get $object) (i32.const @offsetof(SceneObject, {field}))))"
                );
            }
            "parent" => {
                let _ = writeln!(
                    out,
                    "  (func (export \"{export}\") (param $object i32) (param $parent i32)\n    \
                     (i32.store offset=@offsetof(SceneObject, {field}) (local.get $object) (local.get $parent)))"
                );
            }
            _ => {
                let _ = writeln!(
                    out,
                    "  (func (export \"{export}\") (param $object i32) (result i32)\n    \
                     (i32.add (local.get $object) (i32.const @offsetof(SceneObject, {field}))))"
                );
            }
        }
    }
    out.push('\n');
}

fn write_component(out: &mut String, script: &ScriptDescriptor) {
    let class = &script.class_name;
    let _ = writeln!(
        out,
        "  (func (export \"{factory}\") (param $object i32) (result i32)\n    \
         (local $component i32)\n    \
         (local.set $component (call $__alloc (i32.const @sizeof({class})) (i32.const @rtid({class}))))\n    \
         (call ${class}#construct (local.get $component))\n    \
         (i32.store offset=@offsetof(Component, sceneObject) (local.get $component) (local.get $object))\n    \
         (call $RuntimeManager#registerComponent (global.get $manager) (local.get $component))\n    \
         (local.get $component))",
        factory = factory_export(class),
    );
    for field in &script.declarations {
        let _ = writeln!(
            out,
            "  (global (export \"{}\") i32 (i32.const @offsetof({class}, {})))",
            offset_export(class, &field.name),
            field.name
        );
    }
    out.push('\n');
}

fn write_dispatch(out: &mut String, registry: &ScriptRegistry, method: &str) {
    let _ = write!(
        out,
        "  (func $__dispatch_{method}\n    \
         (local $i i32) (local $count i32) (local $component i32) (local $rtid i32)\n    \
         (local.set $count (call $RuntimeManager#componentCount (global.get $manager)))\n    \
         (block $done\n      \
         (loop $next\n        \
         (br_if $done (i32.ge_u (local.get $i) (local.get $count)))\n        \
         (local.set $component (call $RuntimeManager#componentAt (global.get $manager) (local.get $i)))\n        \
         (local.set $rtid (call $__rtid (local.get $component)))\n"
    );
    for script in registry.all() {
        let class = &script.class_name;
        let _ = write!(
            out,
            "        (if (i32.eq (local.get $rtid) (i32.const @rtid({class})))\n          \
             (then (call ${class}#{method} (local.get $component))))\n"
        );
    }
    out.push_str(
        "        (local.set $i (i32.add (local.get $i) (i32.const 1)))\n        \
         (br $next))))\n\n",
    );
}

fn write_lifecycle(out: &mut String) {
    out.push_str(
        r#"  (func (export "Start")
    (call $__dispatch_Start)
    (call $__markFrame))
  (func (export "Update")
    (call $__dispatch_Update))
  (func (export "ScriptEnd")
    (call $__dispatch_LateUpdate)
    (call $RuntimeManager#commitTransforms (global.get $manager)))
"#,
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldDeclaration, InitialValue};

    fn spinner_registry() -> ScriptRegistry {
        let mut registry = ScriptRegistry::new();
        registry
            .add(
                "scripts/spinner.lum",
                "Spinner",
                vec![FieldDeclaration::new("xrot", "i16", InitialValue::Int(3))],
            )
            .unwrap();
        registry
    }

    #[test]
    fn entry_generation_is_deterministic() {
        let mut registry = spinner_registry();
        registry
            .add("scripts/orbit.lum", "Orbit", Vec::new())
            .unwrap();

        let first = generate_entry(&registry);
        let second = generate_entry(&registry.clone());
        assert_eq!(first, second);
    }

    #[test]
    fn spinner_gets_one_factory_and_one_offset_export() {
        let entry = generate_entry(&spinner_registry());
        assert_eq!(entry.matches("\"add_component_Spinner\"").count(), 1);
        assert_eq!(entry.matches("\"get_offset_Spinner_xrot\"").count(), 1);
        assert!(entry.contains("import { Spinner } from \"scripts/spinner\";"));
        assert!(entry.contains("(call $Spinner#Update (local.get $component))"));
    }

    #[test]
    fn entry_exports_runtime_surface() {
        let entry = generate_entry(&ScriptRegistry::new());
        for export in [
            "_start",
            "addSceneObject",
            "registerSceneObject",
            "registerComponent",
            "findSceneObjectById",
            "__newString",
            "__newArray",
            "__collect",
            "__invokeCallback",
            "bind_worldMatrix",
            "bind_position",
            "bind_rotation",
            "bind_scale",
            "bind_parent",
            "Start",
            "Update",
            "ScriptEnd",
        ] {
            assert!(
                entry.contains(&format!("(export \"{export}\")")),
                "missing export {export}"
            );
        }
    }

    #[test]
    fn extraction_entry_imports_every_file_sorted() {
        let entry = generate_extraction_entry(["scripts/b.lum", "scripts/a.lum", "scripts/b.lum"]);
        let imports: Vec<_> = entry.lines().filter(|l| l.starts_with("import")).collect();
        assert_eq!(imports, ["import \"scripts/a\";", "import \"scripts/b\";"]);
    }
}
