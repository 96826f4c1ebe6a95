//! Scene objects and their transforms.

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};

use crate::SceneError;

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// Storage of a transform's world matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorldMatrix {
    /// Host-owned matrix, recomputed by [`SceneGraph::update_world_matrices`].
    Host(Mat4),
    /// Sixteen column-major `f32`s at `address` in the guest memory of the
    /// build identified by `generation`.
    Guest { address: u32, generation: u64 },
}

/// Local translation/rotation/scale plus world matrix storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub world: WorldMatrix,
    /// Whether the host recomputes `world` every update. Cleared while the
    /// matrix is guest-bound.
    pub auto_update: bool,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            world: WorldMatrix::Host(Mat4::IDENTITY),
            auto_update: true,
        }
    }
}

impl Transform {
    pub fn from_trs(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        let mut transform = Self {
            position,
            rotation,
            scale,
            ..Self::default()
        };
        transform.world = WorldMatrix::Host(transform.local_matrix());
        transform
    }

    /// `T * R * S` of the local fields.
    pub fn local_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// The host-owned world matrix, or `None` while guest-bound.
    pub fn host_world(&self) -> Option<Mat4> {
        match self.world {
            WorldMatrix::Host(m) => Some(m),
            WorldMatrix::Guest { .. } => None,
        }
    }

    pub fn is_guest_bound(&self) -> bool {
        matches!(self.world, WorldMatrix::Guest { .. })
    }

    /// Hand the world matrix over to guest memory.
    pub fn bind_guest(&mut self, address: u32, generation: u64) {
        self.world = WorldMatrix::Guest {
            address,
            generation,
        };
        self.auto_update = false;
    }

    /// Take the world matrix back from the guest. The host matrix restarts
    /// from the local fields until the next graph update.
    pub fn unbind(&mut self) {
        if self.is_guest_bound() {
            self.world = WorldMatrix::Host(self.local_matrix());
            self.auto_update = true;
        }
    }
}

// ---------------------------------------------------------------------------
// SceneObject
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SceneObject {
    pub id: String,
    pub transform: Transform,
    /// Id of the parent scene object.
    pub parent: Option<String>,
}

impl SceneObject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transform: Transform::default(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }
}

// ---------------------------------------------------------------------------
// SceneGraph
// ---------------------------------------------------------------------------

/// Scene objects in insertion order, addressable by id.
#[derive(Debug, Default)]
pub struct SceneGraph {
    objects: Vec<SceneObject>,
    by_id: HashMap<String, usize>,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// [`SceneError::DuplicateSceneObject`] if the id is taken.
    pub fn add(&mut self, object: SceneObject) -> Result<(), SceneError> {
        if self.by_id.contains_key(&object.id) {
            return Err(SceneError::DuplicateSceneObject { id: object.id });
        }
        self.by_id.insert(object.id.clone(), self.objects.len());
        self.objects.push(object);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&SceneObject> {
        self.by_id.get(id).map(|&i| &self.objects[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SceneObject> {
        self.by_id.get(id).map(|&i| &mut self.objects[i])
    }

    /// Like [`get_mut`](Self::get_mut) but reports a missing id as an error.
    pub fn require_mut(&mut self, id: &str) -> Result<&mut SceneObject, SceneError> {
        self.get_mut(id).ok_or_else(|| SceneError::UnknownSceneObject { id: id.to_owned() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SceneObject> {
        self.objects.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SceneObject> {
        self.objects.iter_mut()
    }

    /// Recompute host-owned world matrices from the local transforms.
    ///
    /// Guest-bound transforms are skipped; their local fields still feed
    /// the world matrices of their children.
    pub fn update_world_matrices(&mut self) {
        let worlds: Vec<Option<Mat4>> = (0..self.objects.len())
            .map(|i| {
                let transform = &self.objects[i].transform;
                transform.auto_update.then(|| self.compose(i))
            })
            .collect();

        for (object, world) in self.objects.iter_mut().zip(worlds) {
            if let Some(world) = world {
                object.transform.world = WorldMatrix::Host(world);
            }
        }
    }

    /// Parent chain product ending in the local matrix of `index`.
    fn compose(&self, index: usize) -> Mat4 {
        let mut world = self.objects[index].transform.local_matrix();
        let mut current = index;
        for _ in 0..self.objects.len() {
            let Some(parent) = self.objects[current]
                .parent
                .as_deref()
                .and_then(|id| self.by_id.get(id).copied())
            else {
                return world;
            };
            world = self.objects[parent].transform.local_matrix() * world;
            current = parent;
        }
        tracing::warn!(id = %self.objects[index].id, "parent cycle; world matrix truncated");
        world
    }

    /// Return every guest-bound world matrix to host ownership. Returns the
    /// number of transforms released.
    pub fn unbind_all(&mut self) -> usize {
        let mut released = 0;
        for object in &mut self.objects {
            if object.transform.is_guest_bound() {
                object.transform.unbind();
                released += 1;
            }
        }
        if released > 0 {
            tracing::debug!(released, "guest world matrices released");
        }
        released
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
