//! The guest runtime library.
//!
//! Every compilation loads `~lib/runtime.lum` before anything else. It
//! declares the `Component`, `SceneObject` and `RuntimeManager` classes, the
//! host imports, the bump allocator and the world-matrix update.

/// Virtual path of the runtime library.
pub const RUNTIME_PATH: &str = "~lib/runtime.lum";

/// Import specifier for the runtime library.
pub const RUNTIME_SPECIFIER: &str = "~lib/runtime";

/// Source text of the runtime library.
pub const RUNTIME_SOURCE: &str = include_str!("../runtime/runtime.lum");

/// Runtime type id of string objects.
pub const STRING_RTID: u32 = 1;
/// Runtime type id of array buffers.
pub const ARRAY_RTID: u32 = 2;
/// First runtime type id handed to classes.
pub const FIRST_CLASS_RTID: u32 = 3;

/// Size of the object header that precedes every heap or static object.
pub const OBJECT_HEADER_SIZE: u32 = 8;

/// Start of the matrix scratch area used by `SceneObject#updateWorldMatrix`.
pub const MATRIX_SCRATCH: u32 = 64;

/// Address of the first static string object header.
pub const STATIC_DATA_BASE: u32 = 256;

/// Capacity of the runtime manager's component and scene object lists.
pub const LIST_CAPACITY: u32 = 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::Layouts;
    use crate::program::Program;
    use crate::syntax::parse;

    #[test]
    fn runtime_parses_and_declares_core_classes() {
        let file = parse(RUNTIME_PATH, RUNTIME_SOURCE).unwrap();
        let names: Vec<_> = file.classes().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Component", "SceneObject", "RuntimeManager"]);
        assert_eq!(file.wat_blocks().count(), 1);
    }

    #[test]
    fn scene_object_transform_fields_follow_the_matrix() {
        let mut program = Program::new();
        program.add(parse(RUNTIME_PATH, RUNTIME_SOURCE).unwrap());
        let layouts = Layouts::compute(&program).unwrap();
        let so = program.resolve_class(0, "SceneObject").unwrap();
        let layout = layouts.get(so);

        let offset = |field: &str| layout.offset_of(field).unwrap();
        assert_eq!(offset("id"), 0);
        assert_eq!(offset("worldMatrix"), 4);
        assert_eq!(offset("position"), offset("worldMatrix") + 64);
        assert_eq!(offset("rotation"), offset("position") + 12);
        assert_eq!(offset("scale"), offset("rotation") + 16);
        assert_eq!(offset("parent"), offset("scale") + 12);
        assert_eq!(offset("bound"), offset("parent") + 4);
        assert_eq!(layout.size, offset("bound") + 4);
    }
}
