//! Lumen WASM Host -- runs compiled component scripts inside Wasmtime.
//!
//! This crate is the host half of the script runtime bridge. It takes the
//! module produced by `lumen-script`, instantiates it in a fuel-metered
//! Wasmtime store, creates scene objects and components inside the guest,
//! publishes serialized field values into guest memory, and drives the
//! per-frame lifecycle.
//!
//! # Architecture
//!
//! - **[`ScriptRunner`]**: the lifecycle state machine
//!   (`Idle -> Compiled -> Built -> Running -> Stopped`). Owns the engine,
//!   the current compiled artifact, and the current build.
//! - **[`ScriptModule`]**: one instantiated guest module. Resets fuel before
//!   every guest call and classifies traps into [`WasmError`]s.
//! - **[`HostState`]**: data inside the Wasmtime store. Host imports
//!   (`env.abort`, `env.consoleLog`, `input.*`) record into it.
//! - **[`MemoryView`] / [`MemoryViewMut`]**: typed little-endian access to
//!   guest linear memory.
//! - **[`marshal`]**: writes JSON import values into guest fields according
//!   to their declared types.
//!
//! # Guest imports
//!
//! | Import                      | Kind               | Purpose                          |
//! |-----------------------------|--------------------|----------------------------------|
//! | `env.abort`                 | func(i32 x4)       | fatal guest error, traps the call|
//! | `env.consoleLog`            | func(i32)          | guest string to the log          |
//! | `env.deltaTime`             | global mut f32     | seconds since the last frame     |
//! | `env.timeSinceStartup`      | global mut f32     | seconds since `start`            |
//! | `env.mouseX` .. `mouseDeltaY` | global mut f32   | last forwarded mouse state       |
//! | `env.mouseButtons`          | global mut i32     | pressed button bits              |
//! | `input.onPress/onHeld/onLift` | func(i32 x5)     | register a guest input callback  |
//!
//! # Example
//!
//! ```no_run
//! use lumen_scene::InputSystem;
//! use lumen_script::VirtualFileMap;
//! use lumen_wasm_host::{ImportPackage, ScriptRunner, WasmConfig};
//!
//! let mut files = VirtualFileMap::new();
//! files.insert("scripts/spinner.lum", std::fs::read_to_string("spinner.lum").unwrap());
//!
//! let mut runner = ScriptRunner::new(WasmConfig::default()).unwrap();
//! let mut input = InputSystem::new();
//! runner.compile(&files).unwrap();
//! runner.build(&[ImportPackage::new("cube").with_component("Spinner", Default::default())]).unwrap();
//! runner.start(&mut input).unwrap();
//! runner.frame(1.0 / 60.0, &mut input).unwrap();
//! ```

#![deny(unsafe_code)]

pub mod host_api;
pub mod marshal;
pub mod memory;
mod module;
pub mod package;
pub mod runner;

pub use host_api::{GuestAbort, HostState, InputBinding};
pub use memory::{Mat4View, MemoryError, MemoryView, MemoryViewMut};
pub use module::{ScriptModule, WasmConfig};
pub use package::{ComponentImport, ImportPackage};
pub use runner::{ComponentInstanceHandle, RunnerState, ScriptRunner, MOUSE_STATE};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while compiling, building, or running scripts.
#[derive(Debug, thiserror::Error)]
pub enum WasmError {
    /// Script sources failed to compile.
    #[error(transparent)]
    Script(#[from] lumen_script::ScriptError),

    /// Wasmtime rejected the compiled bytecode.
    #[error("WASM compilation failed: {0}")]
    CompileError(String),

    /// The module lacks an export the host calls.
    #[error("missing required export '{name}' -- the module was not produced by lumen-script or is out of date")]
    MissingExport { name: String },

    /// A guest call exhausted its fuel budget.
    #[error("guest call ran out of fuel (budget: {budget} units) -- possible infinite loop in a script")]
    OutOfFuel { budget: u64 },

    /// A WebAssembly trap (unreachable, out-of-bounds access, ...).
    #[error("WASM trap: {0}")]
    Trap(String),

    /// The guest called `abort`.
    #[error("guest aborted: {0}")]
    GuestAbort(GuestAbort),

    /// A general Wasmtime error.
    #[error("WASM runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// An import package names a script the registry does not know.
    #[error("unknown component script '{module_id}' (registered: {registered})")]
    UnknownComponent { module_id: String, registered: String },

    /// The module and the registry disagree (an offset export is missing).
    #[error("registry and module disagree: {0}")]
    RegistryMismatch(String),

    /// The operation is not valid in the runner's current state.
    #[error("invalid runner state: {0}")]
    InvalidState(String),

    /// No guest scene object has this id in the current build.
    #[error("scene object '{id}' is not part of the current build")]
    UnknownSceneObject { id: String },

    /// A scene object was bound before its parent.
    #[error("scene object '{id}' cannot be bound before its parent '{parent}'")]
    UnboundParent { id: String, parent: String },

    /// A handle from an earlier build was used against a newer one.
    #[error("handle from build {handle} used with build {current}")]
    StaleHandle { handle: u64, current: u64 },
}
