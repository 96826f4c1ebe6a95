//! Catalog of discovered component scripts.
//!
//! The [`ScriptRegistry`] holds one [`ScriptDescriptor`] per component source
//! file, keyed by the file's virtual path. It is filled by the
//! [`MetadataExtractor`](crate::MetadataExtractor) during compile pass 1, read
//! by the code generator during pass 2, and then shipped with the compiled
//! module so the host can marshal field values.
//!
//! Insertion order is preserved: it drives the order of the generated entry
//! file, which in turn must be stable across recompiles.

use std::collections::HashMap;

use crate::ScriptError;

// ---------------------------------------------------------------------------
// InitialValue
// ---------------------------------------------------------------------------

/// Statically evaluable initial value of a declared field.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum InitialValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    /// Reference-typed fields and fields without an initializer.
    Null,
}

impl InitialValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InitialValue::Int(v) => Some(*v as f64),
            InitialValue::Float(v) => Some(*v),
            InitialValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            InitialValue::Text(_) | InitialValue::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, InitialValue::Null)
    }
}

// ---------------------------------------------------------------------------
// FieldDeclaration / ScriptDescriptor
// ---------------------------------------------------------------------------

/// One serializable field of a component class.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDeclaration {
    pub name: String,
    /// Guest type name exactly as written in the source (`f32`, `string`,
    /// `SceneObject`, another component class, ...).
    pub declared_type: String,
    pub initial_value: InitialValue,
}

impl FieldDeclaration {
    pub fn new(name: &str, declared_type: &str, initial_value: InitialValue) -> Self {
        Self {
            name: name.to_owned(),
            declared_type: declared_type.to_owned(),
            initial_value,
        }
    }
}

/// Metadata for one discovered component script.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptDescriptor {
    /// Name of the component class inside the compiled module.
    pub class_name: String,
    /// Virtual path of the source file; the registry key.
    pub file_identity: String,
    /// Serialized fields, inherited fields first, then declaration order.
    pub declarations: Vec<FieldDeclaration>,
}

impl ScriptDescriptor {
    /// Look up a declared field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDeclaration> {
        self.declarations.iter().find(|d| d.name == name)
    }

    /// File name without directories or extension (`scripts/spinner.lum` ->
    /// `spinner`).
    pub fn file_stem(&self) -> &str {
        file_stem(&self.file_identity)
    }
}

pub(crate) fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    }
}

// ---------------------------------------------------------------------------
// ScriptRegistry
// ---------------------------------------------------------------------------

/// Ordered catalog of [`ScriptDescriptor`]s keyed by file identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptRegistry {
    entries: Vec<ScriptDescriptor>,
    by_file: HashMap<String, usize>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the descriptor for `file_identity`.
    ///
    /// Overwriting keeps the entry's original position so regenerated code
    /// stays in the same order.
    ///
    /// # Errors
    ///
    /// [`ScriptError::MissingClassName`] if `class_name` is empty.
    pub fn add(
        &mut self,
        file_identity: &str,
        class_name: &str,
        declarations: Vec<FieldDeclaration>,
    ) -> Result<(), ScriptError> {
        if class_name.trim().is_empty() {
            return Err(ScriptError::MissingClassName {
                file_identity: file_identity.to_owned(),
            });
        }

        let descriptor = ScriptDescriptor {
            class_name: class_name.to_owned(),
            file_identity: file_identity.to_owned(),
            declarations,
        };

        match self.by_file.get(file_identity) {
            Some(&index) => {
                tracing::debug!(file = file_identity, class = class_name, "replacing script descriptor");
                self.entries[index] = descriptor;
            }
            None => {
                tracing::debug!(file = file_identity, class = class_name, "registering script descriptor");
                self.by_file.insert(file_identity.to_owned(), self.entries.len());
                self.entries.push(descriptor);
            }
        }
        Ok(())
    }

    /// Resolve a registry key or a looser identifier.
    ///
    /// Tried in order: exact file identity, exact class name, file stem,
    /// case-insensitive class name.
    pub fn find(&self, key: &str) -> Option<&ScriptDescriptor> {
        if let Some(&index) = self.by_file.get(key) {
            return Some(&self.entries[index]);
        }
        self.entries
            .iter()
            .find(|d| d.class_name == key)
            .or_else(|| self.entries.iter().find(|d| d.file_stem() == key))
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|d| d.class_name.eq_ignore_ascii_case(key))
            })
    }

    /// Look up a descriptor by the class name it registers.
    pub fn find_class(&self, class_name: &str) -> Option<&ScriptDescriptor> {
        self.entries.iter().find(|d| d.class_name == class_name)
    }

    /// All descriptors in insertion order.
    pub fn all(&self) -> impl Iterator<Item = &ScriptDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_file.clear();
    }

    /// Plain serializable copy of the registry contents.
    pub fn export_snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            scripts: self.entries.clone(),
        }
    }

    /// Rebuild a registry from a snapshot produced by
    /// [`export_snapshot`](Self::export_snapshot).
    ///
    /// # Errors
    ///
    /// [`ScriptError::MissingClassName`] if any entry lacks a class name.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Result<Self, ScriptError> {
        let mut registry = Self::new();
        for descriptor in snapshot.scripts {
            registry.add(
                &descriptor.file_identity,
                &descriptor.class_name,
                descriptor.declarations,
            )?;
        }
        Ok(registry)
    }
}

/// Serializable form of a [`ScriptRegistry`], in registry order.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RegistrySnapshot {
    pub scripts: Vec<ScriptDescriptor>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
