//! Import packages: what the editor hands to [`ScriptRunner::build`].
//!
//! One [`ImportPackage`] per scene object lists the component scripts
//! attached to it and the serialized field values for each. Packages are
//! plain serde types so they can come straight from a saved scene:
//!
//! ```json
//! {
//!   "sceneObjectId": "cube",
//!   "components": [
//!     { "moduleId": "scripts/spinner.lum", "imports": { "speed": 3.0 } }
//!   ]
//! }
//! ```
//!
//! [`ScriptRunner::build`]: crate::ScriptRunner::build

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field values for one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentImport {
    /// Registry key of the component script (file identity, class name, or
    /// file stem).
    pub module_id: String,
    /// Field name to value. Fields not listed keep their initializers.
    #[serde(default)]
    pub imports: Map<String, Value>,
}

/// All components of one scene object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPackage {
    pub scene_object_id: String,
    #[serde(default)]
    pub components: Vec<ComponentImport>,
}

impl ImportPackage {
    pub fn new(scene_object_id: impl Into<String>) -> Self {
        Self {
            scene_object_id: scene_object_id.into(),
            components: Vec::new(),
        }
    }

    pub fn with_component(mut self, module_id: impl Into<String>, imports: Map<String, Value>) -> Self {
        self.components.push(ComponentImport {
            module_id: module_id.into(),
            imports,
        });
        self
    }

    /// Parse a JSON array of packages.
    pub fn parse_list(json: &str) -> Result<Vec<Self>, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A component reference value: `{ "sceneObjectId": ..., "component": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRef {
    pub scene_object_id: String,
    /// Registry key of the referenced component's script.
    pub component: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn packages_parse_from_camel_case_json() {
        let packages = ImportPackage::parse_list(
            r#"[
                {
                    "sceneObjectId": "cube",
                    "components": [
                        { "moduleId": "scripts/spinner.lum", "imports": { "speed": 3.0, "label": "hi" } },
                        { "moduleId": "Mover" }
                    ]
                },
                { "sceneObjectId": "empty" }
            ]"#,
        )
        .unwrap();

        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].components[0].imports["speed"], json!(3.0));
        assert!(packages[0].components[1].imports.is_empty());
        assert!(packages[1].components.is_empty());
    }

    #[test]
    fn builder_matches_parsed_form() {
        let mut imports = Map::new();
        imports.insert("speed".to_owned(), json!(3.0));
        let built = ImportPackage::new("cube").with_component("Spinner", imports);

        let parsed: ImportPackage = serde_json::from_value(json!({
            "sceneObjectId": "cube",
            "components": [{ "moduleId": "Spinner", "imports": { "speed": 3.0 } }]
        }))
        .unwrap();
        assert_eq!(built, parsed);
    }

    #[test]
    fn component_refs_parse() {
        let reference: ComponentRef =
            serde_json::from_value(json!({ "sceneObjectId": "cube", "component": "Spinner" })).unwrap();
        assert_eq!(reference.scene_object_id, "cube");
    }
}
