//! The script lifecycle: compile, build, bind, start, frame, stop.
//!
//! [`ScriptRunner`] moves through
//! `Idle -> Compiled -> Built -> Running -> Stopped`:
//!
//! - [`compile`](ScriptRunner::compile) stores a new compiled artifact. It
//!   never touches the current build.
//! - [`build`](ScriptRunner::build) instantiates the artifact, creates scene
//!   objects and components, and publishes import values. A failed build
//!   leaves the previous one in place.
//! - [`start`](ScriptRunner::start) runs the guest `Start` phase.
//! - [`frame`](ScriptRunner::frame) runs `Update`, `ScriptEnd` and
//!   `__collect`. Any failure stops the run.
//! - [`stop`](ScriptRunner::stop) removes the run's input states and drops
//!   the build.
//!
//! Every method takes `&mut self`, so phases never overlap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lumen_scene::{
    InputAction, InputEvent, InputSystem, InputTrigger, SceneGraph, SceneObject, Transform, WorldMatrix,
};
use lumen_script::{compile_scripts, CompiledScripts, ScriptDescriptor, ScriptRegistry, VirtualFileMap};
use wasmtime::{Engine, Module};

use crate::marshal::{publish_field, References};
use crate::memory::{Mat4View, MemoryView};
use crate::module::{compile_module, new_engine, ScriptModule, WasmConfig};
use crate::package::ImportPackage;
use crate::WasmError;

/// Input state that forwards mouse events into the guest cells.
pub const MOUSE_STATE: &str = "__script_mouse";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Compiled,
    Built,
    Running,
    Stopped,
}

/// A component created by a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInstanceHandle {
    pub scene_object_id: String,
    /// File identity of the component's script.
    pub script: String,
    pub class_name: String,
    /// Guest pointer of the component object.
    pub pointer: u32,
    /// Build the component belongs to.
    pub generation: u64,
}

struct CompiledArtifact {
    scripts: Arc<CompiledScripts>,
    module: Module,
}

struct Build {
    module: ScriptModule,
    scripts: Arc<CompiledScripts>,
    /// Scene object id to guest pointer.
    scene_objects: HashMap<String, u32>,
    /// `(scene object id, file identity)` to component.
    components: HashMap<(String, String), ComponentInstanceHandle>,
    /// Scene objects whose world matrix the guest owns.
    bound: HashSet<String>,
    time_since_startup: f32,
}

impl Build {
    fn generation(&self) -> u64 {
        self.module.generation()
    }
}

// ---------------------------------------------------------------------------
// ScriptRunner
// ---------------------------------------------------------------------------

pub struct ScriptRunner {
    engine: Engine,
    config: WasmConfig,
    state: RunnerState,
    compiled: Option<CompiledArtifact>,
    build: Option<Build>,
    last_generation: u64,
    /// Input states created by the current run.
    input_states: Vec<String>,
}

impl ScriptRunner {
    pub fn new(config: WasmConfig) -> Result<Self, WasmError> {
        Ok(Self {
            engine: new_engine()?,
            config,
            state: RunnerState::Idle,
            compiled: None,
            build: None,
            last_generation: 0,
            input_states: Vec::new(),
        })
    }

    // -- Compile ----------------------------------------------------------------

    /// Compile `files` and keep the result for the next build.
    ///
    /// # Errors
    ///
    /// [`WasmError::Script`] for source errors, [`WasmError::CompileError`]
    /// or [`WasmError::MissingExport`] if Wasmtime rejects the bytecode. The
    /// previous artifact is kept on failure.
    pub fn compile(&mut self, files: &VirtualFileMap) -> Result<Arc<CompiledScripts>, WasmError> {
        let scripts = Arc::new(compile_scripts(files)?);
        let module = compile_module(&self.engine, &scripts.bytecode)?;

        tracing::debug!(
            fingerprint = %scripts.fingerprint,
            components = scripts.registry.len(),
            "compiled artifact stored"
        );
        self.compiled = Some(CompiledArtifact {
            scripts: Arc::clone(&scripts),
            module,
        });
        if matches!(self.state, RunnerState::Idle | RunnerState::Stopped) {
            self.state = RunnerState::Compiled;
        }
        Ok(scripts)
    }

    // -- Build ------------------------------------------------------------------

    /// Instantiate the compiled artifact and populate it from `packages`.
    ///
    /// Scene objects are created in package order, then every component,
    /// then every field value, so references may point at any package.
    /// Listing the same script twice on one scene object reuses the first
    /// component.
    ///
    /// # Errors
    ///
    /// - [`WasmError::InvalidState`] if nothing has been compiled.
    /// - [`WasmError::UnknownComponent`] if a package names an unregistered
    ///   script. Checked before anything is instantiated.
    /// - [`WasmError::RegistryMismatch`] if an offset export is missing.
    /// - Any guest failure while creating objects.
    pub fn build(&mut self, packages: &[ImportPackage]) -> Result<(), WasmError> {
        let Some(artifact) = &self.compiled else {
            return Err(WasmError::InvalidState("build requires compiled scripts".to_owned()));
        };
        let scripts = Arc::clone(&artifact.scripts);
        let module = artifact.module.clone();
        let registry = &scripts.registry;

        for package in packages {
            for import in &package.components {
                if registry.find(&import.module_id).is_none() {
                    return Err(unknown_component(registry, &import.module_id));
                }
            }
        }

        let generation = self.last_generation + 1;
        let mut guest = ScriptModule::instantiate(&self.engine, &module, &self.config, generation)?;
        guest.call_void("_start")?;

        let mut scene_objects = HashMap::new();
        for package in packages {
            if !scene_objects.contains_key(&package.scene_object_id) {
                let ptr = guest.add_scene_object(&package.scene_object_id)?;
                scene_objects.insert(package.scene_object_id.clone(), ptr);
            }
        }

        let mut components = HashMap::new();
        for package in packages {
            let scene_object = scene_objects[&package.scene_object_id];
            for import in &package.components {
                let descriptor = lookup(registry, &import.module_id)?;
                let key = (package.scene_object_id.clone(), descriptor.file_identity.clone());
                if components.contains_key(&key) {
                    continue;
                }
                let pointer = guest.add_component(&descriptor.class_name, scene_object)?;
                tracing::debug!(
                    scene_object = %package.scene_object_id,
                    class = %descriptor.class_name,
                    pointer,
                    "component created"
                );
                components.insert(
                    key,
                    ComponentInstanceHandle {
                        scene_object_id: package.scene_object_id.clone(),
                        script: descriptor.file_identity.clone(),
                        class_name: descriptor.class_name.clone(),
                        pointer,
                        generation,
                    },
                );
            }
        }

        let refs = References {
            registry,
            scene_objects: &scene_objects,
            components: &components,
        };
        for package in packages {
            for import in &package.components {
                let descriptor = lookup(registry, &import.module_id)?;
                let key = (package.scene_object_id.clone(), descriptor.file_identity.clone());
                let pointer = components[&key].pointer;
                for (name, value) in &import.imports {
                    let Some(field) = descriptor.field(name) else {
                        tracing::warn!(
                            class = %descriptor.class_name,
                            field = %name,
                            "import names a field that is not serialized; skipped"
                        );
                        continue;
                    };
                    let offset = guest.offset_of(&descriptor.class_name, &field.name)?;
                    publish_field(&mut guest, &refs, pointer + offset, field, value)?;
                }
            }
        }

        tracing::info!(
            generation,
            scene_objects = scene_objects.len(),
            components = components.len(),
            "build complete"
        );

        self.last_generation = generation;
        self.build = Some(Build {
            module: guest,
            scripts,
            scene_objects,
            components,
            bound: HashSet::new(),
            time_since_startup: 0.0,
        });
        self.state = RunnerState::Built;
        Ok(())
    }

    // -- Bind -------------------------------------------------------------------

    /// Hand the world matrix of `object` over to the guest.
    ///
    /// Position, rotation and scale are copied into the guest once, the
    /// parent is wired when it is part of the build, and the current host
    /// world matrix seeds the guest matrix. From then on `ScriptEnd`
    /// recomputes it and the host stops updating it.
    ///
    /// A parent that is part of the build must be bound first, since the
    /// guest composes the child from the parent's guest matrix.
    /// [`bind_scene_object`](Self::bind_scene_object) does this for a whole
    /// parent chain.
    ///
    /// # Errors
    ///
    /// - [`WasmError::UnknownSceneObject`] if no package created `object.id`.
    /// - [`WasmError::UnboundParent`] if the parent is part of the build but
    ///   not bound. Nothing is written in that case.
    pub fn bind(&mut self, object: &mut SceneObject) -> Result<(), WasmError> {
        let build = self.build_mut()?;
        let Some(&ptr) = build.scene_objects.get(&object.id) else {
            return Err(WasmError::UnknownSceneObject { id: object.id.clone() });
        };
        let parent = match object.parent.as_deref() {
            Some(parent_id) => match build.scene_objects.get(parent_id) {
                Some(&parent_ptr) if build.bound.contains(parent_id) => Some(parent_ptr),
                Some(_) => {
                    return Err(WasmError::UnboundParent {
                        id: object.id.clone(),
                        parent: parent_id.to_owned(),
                    })
                }
                None => None,
            },
            None => None,
        };

        let world_addr = build.module.bind_field("worldMatrix", ptr)?;
        let position_addr = build.module.bind_field("position", ptr)?;
        let rotation_addr = build.module.bind_field("rotation", ptr)?;
        let scale_addr = build.module.bind_field("scale", ptr)?;
        if let Some(parent) = parent {
            build.module.bind_parent(ptr, parent)?;
        }

        let transform = &object.transform;
        let seed = transform.host_world().unwrap_or_else(|| transform.local_matrix());
        let mut memory = build.module.memory_mut();
        memory.write_f32s(position_addr, &transform.position.to_array())?;
        memory.write_f32s(rotation_addr, &transform.rotation.to_array())?;
        memory.write_f32s(scale_addr, &transform.scale.to_array())?;
        memory.write_f32s(world_addr, &seed.to_cols_array())?;

        let generation = build.generation();
        build.bound.insert(object.id.clone());
        object.transform.bind_guest(world_addr, generation);
        tracing::debug!(id = %object.id, address = world_addr, generation, "world matrix bound");
        Ok(())
    }

    /// Bind the scene object `id` of `scene` together with every ancestor
    /// that is part of the build and not bound yet, root first. Returns the
    /// number of objects bound.
    ///
    /// # Errors
    ///
    /// [`WasmError::UnknownSceneObject`] if `id` is not in `scene` or not in
    /// the build, plus the errors of [`bind`](Self::bind).
    pub fn bind_scene_object(&mut self, scene: &mut SceneGraph, id: &str) -> Result<usize, WasmError> {
        if !scene.contains(id) {
            return Err(WasmError::UnknownSceneObject { id: id.to_owned() });
        }
        let chain = {
            let build = self.build_ref()?;
            let mut chain = vec![id.to_owned()];
            let mut current = id;
            while let Some(parent) = scene.get(current).and_then(|o| o.parent.as_deref()) {
                if !build.scene_objects.contains_key(parent)
                    || build.bound.contains(parent)
                    || chain.iter().any(|c| c == parent)
                {
                    break;
                }
                chain.push(parent.to_owned());
                current = parent;
            }
            chain
        };

        for object_id in chain.iter().rev() {
            let object = scene
                .get_mut(object_id)
                .ok_or_else(|| WasmError::UnknownSceneObject { id: object_id.clone() })?;
            self.bind(object)?;
        }
        Ok(chain.len())
    }

    /// Borrow the guest world matrix of a bound transform.
    ///
    /// # Errors
    ///
    /// [`WasmError::InvalidState`] if the transform is host-owned or there
    /// is no build, [`WasmError::StaleHandle`] if it was bound by another
    /// build.
    pub fn world_matrix_view(&self, transform: &Transform) -> Result<Mat4View<'_>, WasmError> {
        let build = self.build_ref()?;
        let WorldMatrix::Guest { address, generation } = transform.world else {
            return Err(WasmError::InvalidState("transform is not guest-bound".to_owned()));
        };
        let current = build.generation();
        if generation != current {
            return Err(WasmError::StaleHandle {
                handle: generation,
                current,
            });
        }
        Ok(build.module.memory().mat4(address)?)
    }

    // -- Run --------------------------------------------------------------------

    /// Start the current build.
    ///
    /// # Errors
    ///
    /// [`WasmError::InvalidState`] unless the runner is `Built`. A guest
    /// failure stops the run.
    pub fn start(&mut self, input: &mut InputSystem) -> Result<(), WasmError> {
        if self.state != RunnerState::Built {
            return Err(self.invalid_state("start"));
        }
        self.clear_input_states(input);

        let result = self.start_inner(input);
        if let Err(e) = &result {
            tracing::error!(error = %e, "start failed; stopping");
            self.stop(input);
        }
        result
    }

    fn start_inner(&mut self, input: &mut InputSystem) -> Result<(), WasmError> {
        let build = self.build_mut()?;
        build.time_since_startup = 0.0;
        build.module.set_time(0.0, 0.0)?;

        input.add_trigger(MOUSE_STATE, InputTrigger::mouse(InputAction::ForwardMouse));
        self.input_states.push(MOUSE_STATE.to_owned());

        let build = self.build_mut()?;
        build.module.call_void("Start")?;
        self.register_bindings(input)?;

        self.state = RunnerState::Running;
        tracing::info!(generation = self.generation(), "scripts started");
        Ok(())
    }

    /// Advance one frame.
    ///
    /// # Errors
    ///
    /// [`WasmError::InvalidState`] unless the runner is `Running`. Any other
    /// error stops the run before it is returned.
    pub fn frame(&mut self, delta_time: f32, input: &mut InputSystem) -> Result<(), WasmError> {
        if self.state != RunnerState::Running {
            return Err(self.invalid_state("frame"));
        }

        let result = self.frame_inner(delta_time, input);
        if let Err(e) = &result {
            tracing::error!(error = %e, "frame failed; stopping");
            self.stop(input);
        }
        result
    }

    fn frame_inner(&mut self, delta_time: f32, input: &mut InputSystem) -> Result<(), WasmError> {
        let build = self.build_mut()?;
        build.time_since_startup += delta_time;
        let since = build.time_since_startup;
        build.module.set_time(delta_time, since)?;

        let mut fuel = build.module.call_void("Update")?;
        fuel += build.module.call_void("ScriptEnd")?;
        fuel += build.module.call_void("__collect")?;
        tracing::trace!(delta_time, time_since_startup = since, fuel, "frame");

        self.register_bindings(input)
    }

    /// Route an input event to the guest.
    ///
    /// Mouse events update the mouse cells; matching guest triggers invoke
    /// their callbacks. Callbacks left over from an older build are skipped.
    ///
    /// # Errors
    ///
    /// [`WasmError::InvalidState`] unless the runner is `Running`. A guest
    /// failure stops the run.
    pub fn handle_input(&mut self, event: &InputEvent, input: &mut InputSystem) -> Result<(), WasmError> {
        if self.state != RunnerState::Running {
            return Err(self.invalid_state("handle_input"));
        }

        let result = self.handle_input_inner(event, input);
        if let Err(e) = &result {
            tracing::error!(error = %e, "input callback failed; stopping");
            self.stop(input);
        }
        result
    }

    fn handle_input_inner(&mut self, event: &InputEvent, input: &mut InputSystem) -> Result<(), WasmError> {
        let actions = input.fire(event);
        let build = self.build_mut()?;
        let generation = build.generation();

        for action in actions {
            match action {
                InputAction::ForwardMouse => {
                    if let InputEvent::Mouse(mouse) = event {
                        build.module.set_mouse(mouse)?;
                    }
                }
                InputAction::Guest(handle) if handle.generation != generation => {
                    tracing::debug!(
                        handle = handle.generation,
                        current = generation,
                        "skipping callback from an older build"
                    );
                }
                InputAction::Guest(handle) => build.module.invoke_callback(handle)?,
            }
        }
        self.register_bindings(input)
    }

    /// Remove the run's input states and drop the build.
    pub fn stop(&mut self, input: &mut InputSystem) {
        self.clear_input_states(input);
        if self.build.take().is_some() {
            tracing::info!("scripts stopped");
        }
        if self.state != RunnerState::Idle {
            self.state = RunnerState::Stopped;
        }
    }

    // -- Accessors --------------------------------------------------------------

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn config(&self) -> &WasmConfig {
        &self.config
    }

    /// The artifact the next build will use.
    pub fn compiled(&self) -> Option<&CompiledScripts> {
        self.compiled.as_ref().map(|a| a.scripts.as_ref())
    }

    /// Registry of the current build, or of the compiled artifact when
    /// nothing is built.
    pub fn registry(&self) -> Option<&ScriptRegistry> {
        match &self.build {
            Some(build) => Some(&build.scripts.registry),
            None => self.compiled().map(|c| &c.registry),
        }
    }

    /// Generation of the current build, 0 when there is none.
    pub fn generation(&self) -> u64 {
        self.build.as_ref().map_or(0, Build::generation)
    }

    /// The component of script `script` (any registry key) on
    /// `scene_object_id`.
    pub fn component(&self, scene_object_id: &str, script: &str) -> Option<&ComponentInstanceHandle> {
        let build = self.build.as_ref()?;
        let descriptor = build.scripts.registry.find(script)?;
        build
            .components
            .get(&(scene_object_id.to_owned(), descriptor.file_identity.clone()))
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentInstanceHandle> {
        self.build.iter().flat_map(|b| b.components.values())
    }

    /// Guest pointer of a scene object in the current build.
    pub fn scene_object_pointer(&self, id: &str) -> Option<u32> {
        self.build.as_ref()?.scene_objects.get(id).copied()
    }

    /// Guest address of a serialized field of `handle`.
    ///
    /// # Errors
    ///
    /// [`WasmError::StaleHandle`] for handles of another build,
    /// [`WasmError::RegistryMismatch`] for unknown fields.
    pub fn field_address(&mut self, handle: &ComponentInstanceHandle, field: &str) -> Result<u32, WasmError> {
        let build = self.build_mut()?;
        let current = build.generation();
        if handle.generation != current {
            return Err(WasmError::StaleHandle {
                handle: handle.generation,
                current,
            });
        }
        let offset = build.module.offset_of(&handle.class_name, field)?;
        Ok(handle.pointer + offset)
    }

    /// Read access to guest memory of the current build.
    pub fn memory(&self) -> Result<MemoryView<'_>, WasmError> {
        Ok(self.build_ref()?.module.memory())
    }

    /// The instantiated module of the current build.
    pub fn module(&self) -> Option<&ScriptModule> {
        self.build.as_ref().map(|b| &b.module)
    }

    pub fn module_mut(&mut self) -> Option<&mut ScriptModule> {
        self.build.as_mut().map(|b| &mut b.module)
    }

    /// Input states created by the current run, in creation order.
    pub fn input_states(&self) -> &[String] {
        &self.input_states
    }

    // -- Internal helpers -------------------------------------------------------

    fn build_ref(&self) -> Result<&Build, WasmError> {
        self.build
            .as_ref()
            .ok_or_else(|| WasmError::InvalidState("no build".to_owned()))
    }

    fn build_mut(&mut self) -> Result<&mut Build, WasmError> {
        self.build
            .as_mut()
            .ok_or_else(|| WasmError::InvalidState("no build".to_owned()))
    }

    fn invalid_state(&self, operation: &str) -> WasmError {
        WasmError::InvalidState(format!("{operation} is not allowed while {:?}", self.state))
    }

    /// Move guest-registered bindings into the input system.
    fn register_bindings(&mut self, input: &mut InputSystem) -> Result<(), WasmError> {
        let bindings = self.build_mut()?.module.host_state_mut().drain_bindings();
        for binding in bindings {
            input.add_trigger(
                &binding.state,
                InputTrigger::key(
                    binding.key,
                    binding.phase,
                    binding.modifiers,
                    InputAction::Guest(binding.handle),
                ),
            );
            if !self.input_states.contains(&binding.state) {
                self.input_states.push(binding.state);
            }
        }
        Ok(())
    }

    fn clear_input_states(&mut self, input: &mut InputSystem) {
        for name in self.input_states.drain(..) {
            input.delete_state(&name);
        }
    }
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("generation", &self.generation())
            .field("input_states", &self.input_states)
            .finish_non_exhaustive()
    }
}

fn lookup<'r>(registry: &'r ScriptRegistry, module_id: &str) -> Result<&'r ScriptDescriptor, WasmError> {
    registry
        .find(module_id)
        .ok_or_else(|| unknown_component(registry, module_id))
}

fn unknown_component(registry: &ScriptRegistry, module_id: &str) -> WasmError {
    let registered: Vec<&str> = registry.all().map(|d| d.file_identity.as_str()).collect();
    WasmError::UnknownComponent {
        module_id: module_id.to_owned(),
        registered: if registered.is_empty() {
            "none".to_owned()
        } else {
            registered.join(", ")
        },
    }
}
