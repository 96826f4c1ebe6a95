//! Marshalling of JSON import values into guest component fields.
//!
//! Each serialized field is classified by its declared type into a
//! [`FieldKind`], which decides how a JSON value is encoded:
//!
//! | Declared type            | Accepted JSON                         | Stored as            |
//! |--------------------------|---------------------------------------|----------------------|
//! | `bool`                   | boolean or number                     | `u8` 0/1             |
//! | integer types            | number (truncated, wrapped)           | little-endian int    |
//! | `f32` / `f64`            | number                                | little-endian float  |
//! | `vec3` / `quat` / `mat4` | array of 3 / 4 / 16 numbers           | `f32`s               |
//! | `string`                 | string or null                        | guest string pointer |
//! | `SceneObject`            | scene object id or null               | guest pointer        |
//! | component class          | `{sceneObjectId, component}` or null  | guest pointer        |
//! | anything else            | number                                | `u32`                |
//!
//! A value that does not fit its field is logged and skipped; the field
//! keeps its initializer. A reference that cannot be resolved is logged and
//! stored as null.

use std::collections::HashMap;

use lumen_script::program::COMPONENT_CLASS;
use lumen_script::{FieldDeclaration, ScriptRegistry};
use serde_json::Value;

use crate::memory::{MemoryError, MemoryViewMut};
use crate::module::ScriptModule;
use crate::package::ComponentRef;
use crate::runner::ComponentInstanceHandle;
use crate::WasmError;

// ---------------------------------------------------------------------------
// FieldKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// `n` consecutive `f32`s (`vec3`, `quat`, `mat4`).
    Floats(usize),
    String,
    SceneObject,
    /// Reference to a component of the named class. `Component` itself
    /// accepts any component.
    Component(String),
    /// A type with no dedicated marshaller, stored as a `u32`.
    Fallback,
}

impl FieldKind {
    pub fn classify(declared_type: &str, registry: &ScriptRegistry) -> Self {
        match declared_type {
            "bool" => FieldKind::Bool,
            "i8" => FieldKind::I8,
            "u8" => FieldKind::U8,
            "i16" => FieldKind::I16,
            "u16" => FieldKind::U16,
            "i32" | "isize" => FieldKind::I32,
            "u32" | "usize" => FieldKind::U32,
            "i64" => FieldKind::I64,
            "u64" => FieldKind::U64,
            "f32" => FieldKind::F32,
            "f64" => FieldKind::F64,
            "vec3" => FieldKind::Floats(3),
            "quat" => FieldKind::Floats(4),
            "mat4" => FieldKind::Floats(16),
            "string" => FieldKind::String,
            "SceneObject" => FieldKind::SceneObject,
            COMPONENT_CLASS => FieldKind::Component(COMPONENT_CLASS.to_owned()),
            other => match registry.find_class(other) {
                Some(descriptor) => FieldKind::Component(descriptor.class_name.clone()),
                None => FieldKind::Fallback,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

/// A value ready to be stored in a fixed-width field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

/// Encode `value` for a scalar field kind. `None` if the value does not fit
/// or the kind is not scalar.
pub fn encode_scalar(kind: &FieldKind, value: &Value) -> Option<Scalar> {
    Some(match kind {
        FieldKind::Bool => match value {
            Value::Bool(b) => Scalar::Bool(*b),
            Value::Number(n) => Scalar::Bool(n.as_f64()? != 0.0),
            _ => return None,
        },
        FieldKind::I8 => Scalar::I8(json_int(value)? as i8),
        FieldKind::U8 => Scalar::U8(json_int(value)? as u8),
        FieldKind::I16 => Scalar::I16(json_int(value)? as i16),
        FieldKind::U16 => Scalar::U16(json_int(value)? as u16),
        FieldKind::I32 => Scalar::I32(json_int(value)? as i32),
        FieldKind::U32 | FieldKind::Fallback => Scalar::U32(json_int(value)? as u32),
        FieldKind::I64 => Scalar::I64(json_int(value)? as i64),
        FieldKind::U64 => Scalar::U64(json_int(value)? as u64),
        FieldKind::F32 => Scalar::F32(value.as_f64()? as f32),
        FieldKind::F64 => Scalar::F64(value.as_f64()?),
        FieldKind::Floats(_)
        | FieldKind::String
        | FieldKind::SceneObject
        | FieldKind::Component(_) => return None,
    })
}

/// Integer view of a JSON number. Fractions truncate toward zero; callers
/// wrap to the field width.
fn json_int(value: &Value) -> Option<i128> {
    let Value::Number(n) = value else {
        return None;
    };
    if let Some(v) = n.as_i64() {
        return Some(v as i128);
    }
    if let Some(v) = n.as_u64() {
        return Some(v as i128);
    }
    n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i128)
}

pub fn write_scalar(memory: &mut MemoryViewMut<'_>, address: u32, scalar: Scalar) -> Result<(), MemoryError> {
    match scalar {
        Scalar::Bool(b) => memory.write_u8(address, u8::from(b)),
        Scalar::I8(v) => memory.write_i8(address, v),
        Scalar::U8(v) => memory.write_u8(address, v),
        Scalar::I16(v) => memory.write_i16(address, v),
        Scalar::U16(v) => memory.write_u16(address, v),
        Scalar::I32(v) => memory.write_i32(address, v),
        Scalar::U32(v) => memory.write_u32(address, v),
        Scalar::I64(v) => memory.write_i64(address, v),
        Scalar::U64(v) => memory.write_u64(address, v),
        Scalar::F32(v) => memory.write_f32(address, v),
        Scalar::F64(v) => memory.write_f64(address, v),
    }
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Lookup tables for reference-typed fields of one build.
pub(crate) struct References<'a> {
    pub registry: &'a ScriptRegistry,
    /// Scene object id to guest pointer.
    pub scene_objects: &'a HashMap<String, u32>,
    /// `(scene object id, file identity)` to component.
    pub components: &'a HashMap<(String, String), ComponentInstanceHandle>,
}

impl References<'_> {
    fn scene_object(&self, id: &str) -> Option<u32> {
        self.scene_objects.get(id).copied()
    }

    fn component(&self, reference: &ComponentRef, expected_class: &str) -> Option<u32> {
        let descriptor = self.registry.find(&reference.component)?;
        if expected_class != COMPONENT_CLASS && descriptor.class_name != expected_class {
            tracing::warn!(
                expected = expected_class,
                found = %descriptor.class_name,
                "component reference has the wrong class"
            );
            return None;
        }
        let key = (reference.scene_object_id.clone(), descriptor.file_identity.clone());
        self.components.get(&key).map(|handle| handle.pointer)
    }
}

/// Write one import value into the field at `address`.
pub(crate) fn publish_field(
    module: &mut ScriptModule,
    refs: &References<'_>,
    address: u32,
    field: &FieldDeclaration,
    value: &Value,
) -> Result<(), WasmError> {
    let kind = FieldKind::classify(&field.declared_type, refs.registry);

    match &kind {
        FieldKind::String => match value {
            Value::String(text) => {
                let ptr = module.alloc_string(text)?;
                module.memory_mut().write_u32(address, ptr)?;
            }
            Value::Null => module.memory_mut().write_u32(address, 0)?,
            _ => skip(field, value),
        },
        FieldKind::SceneObject => {
            let ptr = match value {
                Value::Null => 0,
                Value::String(id) => refs.scene_object(id).unwrap_or_else(|| {
                    tracing::warn!(field = %field.name, scene_object = %id, "unresolved scene object reference; stored as null");
                    0
                }),
                _ => {
                    skip(field, value);
                    return Ok(());
                }
            };
            module.memory_mut().write_u32(address, ptr)?;
        }
        FieldKind::Component(class) => {
            let ptr = match value {
                Value::Null => 0,
                _ => match serde_json::from_value::<ComponentRef>(value.clone()) {
                    Ok(reference) => refs.component(&reference, class).unwrap_or_else(|| {
                        tracing::warn!(
                            field = %field.name,
                            scene_object = %reference.scene_object_id,
                            component = %reference.component,
                            "unresolved component reference; stored as null"
                        );
                        0
                    }),
                    Err(_) => {
                        skip(field, value);
                        return Ok(());
                    }
                },
            };
            module.memory_mut().write_u32(address, ptr)?;
        }
        FieldKind::Floats(count) => {
            let floats: Option<Vec<f32>> = value
                .as_array()
                .filter(|items| items.len() == *count)
                .and_then(|items| items.iter().map(|v| v.as_f64().map(|f| f as f32)).collect());
            match floats {
                Some(floats) => module.memory_mut().write_f32s(address, &floats)?,
                None => skip(field, value),
            }
        }
        _ => {
            if kind == FieldKind::Fallback {
                tracing::warn!(
                    field = %field.name,
                    declared_type = %field.declared_type,
                    "no marshaller for declared type; writing as u32"
                );
            }
            match encode_scalar(&kind, value) {
                Some(scalar) => write_scalar(&mut module.memory_mut(), address, scalar)?,
                None => skip(field, value),
            }
        }
    }
    Ok(())
}

fn skip(field: &FieldDeclaration, value: &Value) {
    tracing::warn!(
        field = %field.name,
        declared_type = %field.declared_type,
        value = %value,
        "import value does not match the declared type; field skipped"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_script::InitialValue;
    use serde_json::json;

    fn registry() -> ScriptRegistry {
        let mut registry = ScriptRegistry::new();
        registry
            .add(
                "scripts/spinner.lum",
                "Spinner",
                vec![FieldDeclaration::new("speed", "f32", InitialValue::Float(1.5))],
            )
            .unwrap();
        registry
    }

    #[test]
    fn declared_types_classify() {
        let registry = registry();
        assert_eq!(FieldKind::classify("i16", &registry), FieldKind::I16);
        assert_eq!(FieldKind::classify("usize", &registry), FieldKind::U32);
        assert_eq!(FieldKind::classify("quat", &registry), FieldKind::Floats(4));
        assert_eq!(FieldKind::classify("SceneObject", &registry), FieldKind::SceneObject);
        assert_eq!(
            FieldKind::classify("Spinner", &registry),
            FieldKind::Component("Spinner".to_owned())
        );
        assert_eq!(
            FieldKind::classify("Component", &registry),
            FieldKind::Component("Component".to_owned())
        );
        assert_eq!(FieldKind::classify("TextureHandle", &registry), FieldKind::Fallback);
    }

    #[test]
    fn integers_truncate_and_wrap() {
        assert_eq!(encode_scalar(&FieldKind::I16, &json!(3)), Some(Scalar::I16(3)));
        assert_eq!(encode_scalar(&FieldKind::I16, &json!(2.9)), Some(Scalar::I16(2)));
        assert_eq!(encode_scalar(&FieldKind::I16, &json!(-2.9)), Some(Scalar::I16(-2)));
        assert_eq!(encode_scalar(&FieldKind::U8, &json!(257)), Some(Scalar::U8(1)));
        assert_eq!(encode_scalar(&FieldKind::I8, &json!(-1)), Some(Scalar::I8(-1)));
        assert_eq!(
            encode_scalar(&FieldKind::U64, &json!(u64::MAX)),
            Some(Scalar::U64(u64::MAX))
        );
    }

    #[test]
    fn mismatched_values_are_rejected() {
        assert_eq!(encode_scalar(&FieldKind::I32, &json!("7")), None);
        assert_eq!(encode_scalar(&FieldKind::F32, &json!(true)), None);
        assert_eq!(encode_scalar(&FieldKind::Bool, &json!("yes")), None);
        assert_eq!(encode_scalar(&FieldKind::String, &json!("text")), None);
    }

    #[test]
    fn bools_accept_numbers() {
        assert_eq!(encode_scalar(&FieldKind::Bool, &json!(false)), Some(Scalar::Bool(false)));
        assert_eq!(encode_scalar(&FieldKind::Bool, &json!(2)), Some(Scalar::Bool(true)));
        assert_eq!(encode_scalar(&FieldKind::Bool, &json!(0)), Some(Scalar::Bool(false)));
    }

    #[test]
    fn scalars_land_little_endian() {
        let mut memory = vec![0u8; 64];
        let mut view = MemoryViewMut::new(&mut memory);
        write_scalar(&mut view, 16, Scalar::I16(-2)).unwrap();
        write_scalar(&mut view, 20, Scalar::F32(1.5)).unwrap();
        write_scalar(&mut view, 24, Scalar::Bool(true)).unwrap();

        assert_eq!(&memory[16..18], &(-2i16).to_le_bytes());
        assert_eq!(&memory[20..24], &1.5f32.to_le_bytes());
        assert_eq!(memory[24], 1);
    }
}
