//! Instantiation and invocation of a compiled script module.
//!
//! [`ScriptModule`] wraps the Wasmtime store and instance of one build. Every
//! guest call goes through [`ScriptModule::call`], which resets the fuel
//! budget first and classifies failures into [`WasmError`]s.

use std::collections::HashMap;

use lumen_scene::{CallbackHandle, MouseDescriptor};
use lumen_script::codegen::{bind_export, factory_export, offset_export};
use wasmtime::{
    Engine, Global, GlobalType, Instance, Linker, Memory, Module, Mutability, Store, Val, ValType,
    WasmParams, WasmResults,
};

use crate::host_api::{register_host_api, HostState};
use crate::memory::{MemoryView, MemoryViewMut};
use crate::WasmError;

/// Exports the host calls directly. Checked before instantiation.
pub const REQUIRED_EXPORTS: [&str; 12] = [
    "memory",
    "_start",
    "Start",
    "Update",
    "ScriptEnd",
    "addSceneObject",
    "findSceneObjectById",
    "__newString",
    "__collect",
    "__invokeCallback",
    "__callbackCount",
    "__gcEpoch",
];

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the script sandbox.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    /// Fuel units granted to each guest call (one lifecycle export, one
    /// callback, one factory). Default: 10,000,000.
    pub fuel_per_call: u64,

    /// Maximum linear memory, in bytes. Default: 16 MiB.
    pub memory_limit_bytes: usize,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            fuel_per_call: 10_000_000,
            memory_limit_bytes: 16 * 1024 * 1024, // 16 MiB
        }
    }
}

impl WasmConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Build an engine with fuel metering enabled.
pub(crate) fn new_engine() -> Result<Engine, WasmError> {
    let mut engine_config = wasmtime::Config::new();
    engine_config.consume_fuel(true);
    Engine::new(&engine_config)
        .map_err(|e| WasmError::Runtime(format!("failed to create Wasmtime engine: {e}")))
}

/// Compile bytecode for `engine`, checking the exports the host relies on.
pub(crate) fn compile_module(engine: &Engine, bytecode: &[u8]) -> Result<Module, WasmError> {
    let module =
        Module::new(engine, bytecode).map_err(|e| WasmError::CompileError(format!("{e}")))?;
    for name in REQUIRED_EXPORTS {
        if module.get_export(name).is_none() {
            return Err(WasmError::MissingExport {
                name: name.to_owned(),
            });
        }
    }
    Ok(module)
}

// ---------------------------------------------------------------------------
// Guest cells
// ---------------------------------------------------------------------------

/// Host-defined globals the runtime imports from `env`.
struct GuestCells {
    delta_time: Global,
    time_since_startup: Global,
    mouse_x: Global,
    mouse_y: Global,
    mouse_delta_x: Global,
    mouse_delta_y: Global,
    mouse_buttons: Global,
}

impl GuestCells {
    fn define(store: &mut Store<HostState>, linker: &mut Linker<HostState>) -> Result<Self, WasmError> {
        let mut f32_cell = |name: &str| -> Result<Global, WasmError> {
            let ty = GlobalType::new(ValType::F32, Mutability::Var);
            let global = Global::new(&mut *store, ty, Val::F32(0f32.to_bits()))
                .map_err(|e| WasmError::Runtime(format!("failed to create global '{name}': {e}")))?;
            linker
                .define(&mut *store, "env", name, global)
                .map_err(|e| WasmError::Runtime(format!("failed to define global '{name}': {e}")))?;
            Ok(global)
        };

        let delta_time = f32_cell("deltaTime")?;
        let time_since_startup = f32_cell("timeSinceStartup")?;
        let mouse_x = f32_cell("mouseX")?;
        let mouse_y = f32_cell("mouseY")?;
        let mouse_delta_x = f32_cell("mouseDeltaX")?;
        let mouse_delta_y = f32_cell("mouseDeltaY")?;

        let ty = GlobalType::new(ValType::I32, Mutability::Var);
        let mouse_buttons = Global::new(&mut *store, ty, Val::I32(0))
            .map_err(|e| WasmError::Runtime(format!("failed to create global 'mouseButtons': {e}")))?;
        linker
            .define(&mut *store, "env", "mouseButtons", mouse_buttons)
            .map_err(|e| WasmError::Runtime(format!("failed to define global 'mouseButtons': {e}")))?;

        Ok(Self {
            delta_time,
            time_since_startup,
            mouse_x,
            mouse_y,
            mouse_delta_x,
            mouse_delta_y,
            mouse_buttons,
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptModule
// ---------------------------------------------------------------------------

/// One instantiated script module.
///
/// # Sandbox Guarantees
///
/// - No WASI; the only imports are the ones in [`crate::host_api`] and the
///   `env` cells.
/// - Fuel metering bounds every guest call.
/// - Linear memory is capped at [`WasmConfig::memory_limit_bytes`].
pub struct ScriptModule {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    cells: GuestCells,
    config: WasmConfig,
    /// Scene object id to the guest string holding it.
    id_strings: HashMap<String, u32>,
}

impl ScriptModule {
    /// Instantiate `module` for the build `generation`.
    ///
    /// # Errors
    ///
    /// - [`WasmError::MissingExport`] if the module has no `memory` export.
    /// - [`WasmError::Runtime`] if instantiation fails (e.g. unsatisfied
    ///   imports).
    pub fn instantiate(
        engine: &Engine,
        module: &Module,
        config: &WasmConfig,
        generation: u64,
    ) -> Result<Self, WasmError> {
        let mut store = Store::new(engine, HostState::new(generation, config.memory_limit_bytes));
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(config.fuel_per_call)
            .map_err(|e| WasmError::Runtime(format!("failed to set fuel: {e}")))?;

        let mut linker = Linker::new(engine);
        register_host_api(&mut linker)
            .map_err(|e| WasmError::Runtime(format!("failed to register host API: {e}")))?;
        let cells = GuestCells::define(&mut store, &mut linker)?;

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| WasmError::Runtime(format!("{e}")))?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| WasmError::MissingExport {
                name: "memory".to_owned(),
            })?;

        tracing::debug!(
            generation,
            fuel_per_call = config.fuel_per_call,
            memory_limit = config.memory_limit_bytes,
            "script module instantiated"
        );

        Ok(Self {
            store,
            instance,
            memory,
            cells,
            config: config.clone(),
            id_strings: HashMap::new(),
        })
    }

    /// Call the export `name` with a fresh fuel budget. Returns the result
    /// and the fuel consumed.
    ///
    /// # Errors
    ///
    /// - [`WasmError::MissingExport`] if there is no such function.
    /// - [`WasmError::Runtime`] if its signature does not match `P -> R`.
    /// - [`WasmError::OutOfFuel`], [`WasmError::GuestAbort`] or
    ///   [`WasmError::Trap`] on execution failure.
    pub fn call<P, R>(&mut self, name: &str, params: P) -> Result<(R, u64), WasmError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| WasmError::MissingExport {
                name: name.to_owned(),
            })?
            .typed::<P, R>(&self.store)
            .map_err(|e| WasmError::Runtime(format!("export '{name}' has the wrong signature: {e}")))?;

        self.reset_fuel()?;
        self.store.data_mut().begin_call();

        let result = func
            .call(&mut self.store, params)
            .map_err(|e| self.classify_trap(e))?;

        let remaining = self
            .store
            .get_fuel()
            .map_err(|e| WasmError::Runtime(format!("failed to read fuel: {e}")))?;
        let consumed = self.config.fuel_per_call.saturating_sub(remaining);
        tracing::trace!(export = name, fuel_consumed = consumed, "guest call completed");
        Ok((result, consumed))
    }

    /// Call a `() -> ()` export. Returns the fuel consumed.
    pub fn call_void(&mut self, name: &str) -> Result<u64, WasmError> {
        self.call::<(), ()>(name, ()).map(|(_, fuel)| fuel)
    }

    // -- Runtime entry points -------------------------------------------------

    /// Allocate a guest string holding `text`.
    pub fn alloc_string(&mut self, text: &str) -> Result<u32, WasmError> {
        let units = text.encode_utf16().count() as i32;
        let (ptr, _) = self.call::<i32, i32>("__newString", units)?;
        let ptr = ptr as u32;
        self.memory_mut().write_string(ptr, text)?;
        Ok(ptr)
    }

    /// Create and register a guest scene object.
    pub fn add_scene_object(&mut self, id: &str) -> Result<u32, WasmError> {
        let id_ptr = self.alloc_string(id)?;
        let (ptr, _) = self.call::<i32, i32>("addSceneObject", id_ptr as i32)?;
        self.id_strings.insert(id.to_owned(), id_ptr);
        Ok(ptr as u32)
    }

    /// Guest pointer of the scene object `id`, or `None`.
    ///
    /// Only ids created through [`add_scene_object`](Self::add_scene_object)
    /// can be found. The lookup reuses the id string allocated there and
    /// does not allocate guest memory.
    pub fn find_scene_object(&mut self, id: &str) -> Result<Option<u32>, WasmError> {
        let Some(&id_ptr) = self.id_strings.get(id) else {
            return Ok(None);
        };
        let (ptr, _) = self.call::<i32, i32>("findSceneObjectById", id_ptr as i32)?;
        Ok((ptr != 0).then_some(ptr as u32))
    }

    /// Create a `class` component attached to the scene object at
    /// `scene_object`.
    pub fn add_component(&mut self, class: &str, scene_object: u32) -> Result<u32, WasmError> {
        let (ptr, _) = self.call::<i32, i32>(&factory_export(class), scene_object as i32)?;
        Ok(ptr as u32)
    }

    /// Address of a transform field of the scene object. Binding
    /// `worldMatrix` also marks the object for matrix commits.
    pub fn bind_field(&mut self, field: &str, scene_object: u32) -> Result<u32, WasmError> {
        let (addr, _) = self.call::<i32, i32>(&bind_export(field), scene_object as i32)?;
        Ok(addr as u32)
    }

    pub fn bind_parent(&mut self, scene_object: u32, parent: u32) -> Result<(), WasmError> {
        self.call::<(i32, i32), ()>(&bind_export("parent"), (scene_object as i32, parent as i32))?;
        Ok(())
    }

    /// Invoke the table entry of `handle` on its target.
    pub fn invoke_callback(&mut self, handle: CallbackHandle) -> Result<(), WasmError> {
        let current = self.generation();
        if handle.generation != current {
            return Err(WasmError::StaleHandle {
                handle: handle.generation,
                current,
            });
        }
        self.call::<(i32, i32), ()>(
            "__invokeCallback",
            (handle.index as i32, handle.target as i32),
        )?;
        Ok(())
    }

    /// Field offset from the `get_offset_<class>_<field>` export.
    ///
    /// # Errors
    ///
    /// [`WasmError::RegistryMismatch`] if the export does not exist.
    pub fn offset_of(&mut self, class: &str, field: &str) -> Result<u32, WasmError> {
        let name = offset_export(class, field);
        self.global_i32(&name)
            .map(|offset| offset as u32)
            .ok_or_else(|| WasmError::RegistryMismatch(format!("module has no offset export '{name}'")))
    }

    /// Value of an exported `i32` global.
    pub fn global_i32(&mut self, name: &str) -> Option<i32> {
        let global = self.instance.get_global(&mut self.store, name)?;
        match global.get(&mut self.store) {
            Val::I32(value) => Some(value),
            _ => None,
        }
    }

    // -- Cells ----------------------------------------------------------------

    pub fn set_time(&mut self, delta_time: f32, time_since_startup: f32) -> Result<(), WasmError> {
        set_f32(&mut self.store, self.cells.delta_time, delta_time)?;
        set_f32(&mut self.store, self.cells.time_since_startup, time_since_startup)
    }

    pub fn set_mouse(&mut self, mouse: &MouseDescriptor) -> Result<(), WasmError> {
        set_f32(&mut self.store, self.cells.mouse_x, mouse.x)?;
        set_f32(&mut self.store, self.cells.mouse_y, mouse.y)?;
        set_f32(&mut self.store, self.cells.mouse_delta_x, mouse.dx)?;
        set_f32(&mut self.store, self.cells.mouse_delta_y, mouse.dy)?;
        self.cells
            .mouse_buttons
            .set(&mut self.store, Val::I32(mouse.buttons as i32))
            .map_err(|e| WasmError::Runtime(format!("failed to set mouseButtons: {e}")))
    }

    /// Current `deltaTime` cell value.
    pub fn delta_time(&mut self) -> f32 {
        match self.cells.delta_time.get(&mut self.store) {
            Val::F32(bits) => f32::from_bits(bits),
            _ => 0.0,
        }
    }

    // -- Accessors ------------------------------------------------------------

    pub fn memory(&self) -> MemoryView<'_> {
        MemoryView::new(self.memory.data(&self.store))
    }

    pub fn memory_mut(&mut self) -> MemoryViewMut<'_> {
        MemoryViewMut::new(self.memory.data_mut(&mut self.store))
    }

    pub fn host_state(&self) -> &HostState {
        self.store.data()
    }

    pub fn host_state_mut(&mut self) -> &mut HostState {
        self.store.data_mut()
    }

    pub fn generation(&self) -> u64 {
        self.store.data().generation
    }

    pub fn fuel_remaining(&self) -> u64 {
        self.store.get_fuel().unwrap_or(0)
    }

    pub fn config(&self) -> &WasmConfig {
        &self.config
    }

    // -- Internal helpers -----------------------------------------------------

    /// Reset fuel to the per-call budget. `set_fuel` replaces the remaining
    /// amount, so leftovers from the previous call never carry over.
    fn reset_fuel(&mut self) -> Result<(), WasmError> {
        self.store
            .set_fuel(self.config.fuel_per_call)
            .map_err(|e| WasmError::Runtime(format!("failed to set fuel: {e}")))
    }

    /// Classify a Wasmtime error into the appropriate [`WasmError`] variant.
    fn classify_trap(&self, error: anyhow::Error) -> WasmError {
        for cause in error.chain() {
            if let Some(abort) = cause.downcast_ref::<crate::GuestAbort>() {
                return WasmError::GuestAbort(abort.clone());
            }
            if let Some(trap) = cause.downcast_ref::<wasmtime::Trap>() {
                if *trap == wasmtime::Trap::OutOfFuel {
                    return WasmError::OutOfFuel {
                        budget: self.config.fuel_per_call,
                    };
                }
                return WasmError::Trap(format!("{error}"));
            }
        }
        // Host functions can fail with their own error types; the recorded
        // abort still wins if there is one.
        if let Some(abort) = &self.store.data().abort {
            return WasmError::GuestAbort(abort.clone());
        }
        WasmError::Trap(format!("{error:#}"))
    }
}

fn set_f32(store: &mut Store<HostState>, global: Global, value: f32) -> Result<(), WasmError> {
    global
        .set(&mut *store, Val::F32(value.to_bits()))
        .map_err(|e| WasmError::Runtime(format!("failed to set guest cell: {e}")))
}

impl std::fmt::Debug for ScriptModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptModule")
            .field("config", &self.config)
            .field("generation", &self.generation())
            .field("fuel_remaining", &self.fuel_remaining())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Runtime-only module: no user scripts.
    fn runtime_module(config: &WasmConfig) -> ScriptModule {
        let compiled = lumen_script::compile_scripts(&lumen_script::VirtualFileMap::new()).unwrap();
        let engine = new_engine().unwrap();
        let module = compile_module(&engine, &compiled.bytecode).unwrap();
        let mut module = ScriptModule::instantiate(&engine, &module, config, 1).unwrap();
        module.call_void("_start").unwrap();
        module
    }

    // -- Test 1: Lifecycle exports run and consume fuel -----------------------

    #[test]
    fn lifecycle_exports_consume_fuel() {
        let mut module = runtime_module(&WasmConfig::default());
        for export in ["Start", "Update", "ScriptEnd", "__collect"] {
            let fuel = module.call_void(export).unwrap();
            assert!(fuel > 0, "{export} should consume some fuel");
        }
    }

    // -- Test 2: Fuel resets between calls (deterministic) ---------------------

    #[test]
    fn fuel_resets_between_calls() {
        let mut module = runtime_module(&WasmConfig::default());
        module.call_void("Update").unwrap();
        let first = module.call_void("Update").unwrap();
        let second = module.call_void("Update").unwrap();
        assert_eq!(first, second, "identical calls must consume identical fuel");
    }

    // -- Test 3: Strings round-trip through the guest allocator ---------------

    #[test]
    fn alloc_string_writes_guest_string() {
        let mut module = runtime_module(&WasmConfig::default());
        let ptr = module.alloc_string("héllo").unwrap();
        let view = module.memory();
        assert_eq!(view.runtime_type_id(ptr).unwrap(), lumen_script::runtime::STRING_RTID);
        assert_eq!(view.read_string(ptr).unwrap(), "héllo");
    }

    // -- Test 4: Scene objects are found by id ---------------------------------

    #[test]
    fn scene_objects_are_found_by_id() {
        let mut module = runtime_module(&WasmConfig::default());
        let cube = module.add_scene_object("cube").unwrap();
        module.add_scene_object("lamp").unwrap();

        assert_eq!(module.find_scene_object("cube").unwrap(), Some(cube));
        assert_eq!(module.find_scene_object("ghost").unwrap(), None);

        let id_ptr = module.memory().read_u32(cube).unwrap();
        assert_eq!(module.memory().read_string(id_ptr).unwrap(), "cube");
    }

    // -- Test 5: Cells are visible to the guest --------------------------------

    #[test]
    fn time_cells_are_written() {
        let mut module = runtime_module(&WasmConfig::default());
        module.set_time(0.25, 1.0).unwrap();
        assert_eq!(module.delta_time(), 0.25);
    }

    // -- Test 6: Missing offset export is a registry mismatch ------------------

    #[test]
    fn missing_offset_export_is_a_mismatch() {
        let mut module = runtime_module(&WasmConfig::default());
        let err = module.offset_of("Spinner", "xrot").unwrap_err();
        assert!(
            matches!(err, WasmError::RegistryMismatch(_)),
            "expected RegistryMismatch, got: {err:?}"
        );
    }

    // -- Test 7: Stale callback handles are rejected ---------------------------

    #[test]
    fn stale_callback_handle_is_rejected() {
        let mut module = runtime_module(&WasmConfig::default());
        let err = module
            .invoke_callback(CallbackHandle {
                index: 0,
                target: 0,
                generation: 99,
            })
            .unwrap_err();
        assert!(
            matches!(err, WasmError::StaleHandle { handle: 99, current: 1 }),
            "expected StaleHandle, got: {err:?}"
        );
    }

    // -- Test 8: Bytecode without the runtime exports is rejected --------------

    #[test]
    fn foreign_module_is_missing_exports() {
        let engine = new_engine().unwrap();
        let err = compile_module(&engine, br#"(module (func (export "tick")))"#).unwrap_err();
        assert!(
            matches!(err, WasmError::MissingExport { ref name } if name == "memory"),
            "expected MissingExport for 'memory', got: {err:?}"
        );
    }

    // -- Test 9: Config loads from JSON with defaults -----------------------

    #[test]
    fn config_loads_from_json() {
        let config = WasmConfig::from_json(r#"{ "fuel_per_call": 5000 }"#).unwrap();
        assert_eq!(config.fuel_per_call, 5000);
        assert_eq!(config.memory_limit_bytes, WasmConfig::default().memory_limit_bytes);
    }

    // -- Test 10: Garbage bytes fail to compile ---------------------------------

    #[test]
    fn garbage_bytes_fail_to_compile() {
        let engine = new_engine().unwrap();
        let err = compile_module(&engine, b"not wasm").unwrap_err();
        assert!(
            matches!(err, WasmError::CompileError(_)),
            "expected CompileError, got: {err:?}"
        );
    }

    // -- Test 11: Scene object lookups do not allocate --------------------------

    #[test]
    fn scene_object_lookups_reuse_id_strings() {
        let mut module = runtime_module(&WasmConfig::default());
        let cube = module.add_scene_object("cube").unwrap();

        let first = module.alloc_string("ab").unwrap();
        let second = module.alloc_string("ab").unwrap();
        for _ in 0..100 {
            assert_eq!(module.find_scene_object("cube").unwrap(), Some(cube));
            assert_eq!(module.find_scene_object("ghost").unwrap(), None);
        }
        let third = module.alloc_string("ab").unwrap();
        assert_eq!(
            third - second,
            second - first,
            "lookups must not move the guest heap"
        );
    }
}
