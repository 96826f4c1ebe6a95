//! Lumen Scene -- host-side scene objects and input routing.
//!
//! This crate holds the pieces of the editor/engine that the script runtime
//! bridge talks to but does not own:
//!
//! - **[`SceneGraph`]**: scene objects with a local TRS [`Transform`] and a
//!   parent link. A transform's world matrix is either host-computed
//!   ([`WorldMatrix::Host`]) or bound to guest linear memory
//!   ([`WorldMatrix::Guest`]), in which case the host stops recomputing it.
//! - **[`InputSystem`]**: named input states holding triggers. Firing an
//!   [`InputEvent`] yields the [`InputAction`]s of every matching trigger,
//!   including guest callbacks identified by a [`CallbackHandle`].
//!
//! # Example
//!
//! ```
//! use lumen_scene::{SceneGraph, SceneObject};
//! use glam::Vec3;
//!
//! let mut scene = SceneGraph::new();
//! scene.add(SceneObject::new("root")).unwrap();
//! let mut child = SceneObject::new("child").with_parent("root");
//! child.transform.position = Vec3::new(1.0, 0.0, 0.0);
//! scene.add(child).unwrap();
//!
//! scene.get_mut("root").unwrap().transform.position = Vec3::new(0.0, 2.0, 0.0);
//! scene.update_world_matrices();
//!
//! let world = scene.get("child").unwrap().transform.host_world().unwrap();
//! assert_eq!(world.w_axis.truncate(), Vec3::new(1.0, 2.0, 0.0));
//! ```

#![deny(unsafe_code)]

pub mod input;
pub mod scene;

pub use input::{
    CallbackHandle, InputAction, InputEvent, InputState, InputSystem, InputTrigger, KeyPhase,
    Modifiers, MouseDescriptor, TriggerSource,
};
pub use scene::{SceneGraph, SceneObject, Transform, WorldMatrix};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by scene graph operations.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    /// A scene object with this id is already in the graph.
    #[error("scene object '{id}' already exists")]
    DuplicateSceneObject { id: String },

    /// No scene object has this id.
    #[error("scene object '{id}' does not exist")]
    UnknownSceneObject { id: String },
}
