//! Host functions imported by guest scripts.
//!
//! [`HostState`] lives inside the Wasmtime [`Store`](wasmtime::Store) and is
//! reachable from every host function through [`Caller::data_mut`]. Host
//! functions never call back into the guest; they record what happened
//! (console lines, aborts, input bindings) and the runner picks it up after
//! the guest call returns.
//!
//! # Functions
//!
//! | Module  | Name         | Signature                                        |
//! |---------|--------------|--------------------------------------------------|
//! | `env`   | `abort`      | `(message, file, line, column)`                  |
//! | `env`   | `consoleLog` | `(message)`                                      |
//! | `input` | `onPress`    | `(state, key, target, callback, modifiers)`      |
//! | `input` | `onHeld`     | same as `onPress`                                |
//! | `input` | `onLift`     | same as `onPress`                                |
//!
//! String arguments are guest string pointers. `callback` is an index into
//! the exported `table` and is checked against the `__callbackCount` export.

use lumen_scene::{CallbackHandle, KeyPhase, Modifiers};
use wasmtime::{Caller, Linker, StoreLimits, StoreLimitsBuilder, Val};

use crate::memory::MemoryView;

/// Name of the exported global holding the callback table length.
pub const CALLBACK_COUNT_EXPORT: &str = "__callbackCount";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A decoded guest `abort` call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({file}:{line}:{column})")]
pub struct GuestAbort {
    pub message: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// An input callback registered by the guest, not yet handed to the input
/// system.
#[derive(Debug, Clone, PartialEq)]
pub struct InputBinding {
    /// Input state the trigger belongs to.
    pub state: String,
    pub key: String,
    pub phase: KeyPhase,
    pub modifiers: Modifiers,
    pub handle: CallbackHandle,
}

// ---------------------------------------------------------------------------
// HostState
// ---------------------------------------------------------------------------

/// State held inside the Wasmtime store.
pub struct HostState {
    /// Messages passed to `consoleLog` since the last drain.
    pub console: Vec<String>,
    /// The last `abort` call, if the guest aborted.
    pub abort: Option<GuestAbort>,
    /// Bindings registered since the last drain.
    pub pending_bindings: Vec<InputBinding>,
    /// Host function calls during the current guest call.
    pub host_call_count: u32,
    /// Build generation stamped into callback handles.
    pub generation: u64,
    pub(crate) limits: StoreLimits,
}

impl HostState {
    pub fn new(generation: u64, memory_limit_bytes: usize) -> Self {
        Self {
            console: Vec::new(),
            abort: None,
            pending_bindings: Vec::new(),
            host_call_count: 0,
            generation,
            limits: StoreLimitsBuilder::new()
                .memory_size(memory_limit_bytes)
                .build(),
        }
    }

    /// Reset per-call bookkeeping before entering the guest.
    pub fn begin_call(&mut self) {
        self.host_call_count = 0;
        self.abort = None;
    }

    pub fn drain_console(&mut self) -> Vec<String> {
        std::mem::take(&mut self.console)
    }

    pub fn drain_bindings(&mut self) -> Vec<InputBinding> {
        std::mem::take(&mut self.pending_bindings)
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new(0, crate::WasmConfig::default().memory_limit_bytes)
    }
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("console", &self.console.len())
            .field("abort", &self.abort)
            .field("pending_bindings", &self.pending_bindings.len())
            .field("host_call_count", &self.host_call_count)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register every host function with the linker.
///
/// # Errors
///
/// Returns an error if a function is already defined in the linker.
pub fn register_host_api(linker: &mut Linker<HostState>) -> Result<(), anyhow::Error> {
    linker.func_wrap("env", "abort", host_abort)?;
    linker.func_wrap("env", "consoleLog", host_console_log)?;
    linker.func_wrap("input", "onPress", host_on_press)?;
    linker.func_wrap("input", "onHeld", host_on_held)?;
    linker.func_wrap("input", "onLift", host_on_lift)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Host function implementations
// ---------------------------------------------------------------------------

/// `env.abort(message, file, line, column)`. Always traps.
fn host_abort(
    mut caller: Caller<'_, HostState>,
    message_ptr: i32,
    file_ptr: i32,
    line: i32,
    column: i32,
) -> Result<(), anyhow::Error> {
    caller.data_mut().host_call_count += 1;

    let message = read_optional_string(&mut caller, message_ptr);
    let file = read_optional_string(&mut caller, file_ptr);
    let abort = GuestAbort {
        message,
        file,
        line: line as u32,
        column: column as u32,
    };

    tracing::error!(
        source = "wasm",
        file = %abort.file,
        line = abort.line,
        column = abort.column,
        "abort: {}",
        abort.message
    );
    caller.data_mut().abort = Some(abort.clone());
    Err(anyhow::Error::new(abort))
}

/// `env.consoleLog(message)`.
fn host_console_log(mut caller: Caller<'_, HostState>, message_ptr: i32) {
    caller.data_mut().host_call_count += 1;

    match read_guest_string(&mut caller, message_ptr) {
        Ok(msg) => {
            tracing::info!(source = "wasm", "{msg}");
            caller.data_mut().console.push(msg);
        }
        Err(e) => {
            tracing::warn!(error = %e, "consoleLog: failed to read message");
        }
    }
}

fn host_on_press(
    caller: Caller<'_, HostState>,
    state_ptr: i32,
    key_ptr: i32,
    target: i32,
    index: i32,
    modifiers: i32,
) -> Result<(), anyhow::Error> {
    bind_input(caller, KeyPhase::Press, state_ptr, key_ptr, target, index, modifiers)
}

fn host_on_held(
    caller: Caller<'_, HostState>,
    state_ptr: i32,
    key_ptr: i32,
    target: i32,
    index: i32,
    modifiers: i32,
) -> Result<(), anyhow::Error> {
    bind_input(caller, KeyPhase::Held, state_ptr, key_ptr, target, index, modifiers)
}

fn host_on_lift(
    caller: Caller<'_, HostState>,
    state_ptr: i32,
    key_ptr: i32,
    target: i32,
    index: i32,
    modifiers: i32,
) -> Result<(), anyhow::Error> {
    bind_input(caller, KeyPhase::Lift, state_ptr, key_ptr, target, index, modifiers)
}

fn bind_input(
    mut caller: Caller<'_, HostState>,
    phase: KeyPhase,
    state_ptr: i32,
    key_ptr: i32,
    target: i32,
    index: i32,
    modifiers: i32,
) -> Result<(), anyhow::Error> {
    caller.data_mut().host_call_count += 1;

    let state = read_guest_string(&mut caller, state_ptr)?;
    let key = read_guest_string(&mut caller, key_ptr)?;

    let count = callback_count(&mut caller)?;
    let index = index as u32;
    if index >= count {
        tracing::warn!(state = %state, key = %key, index, count, "input callback index out of range");
        anyhow::bail!("input callback index {index} is outside the callback table ({count} entries)");
    }

    let binding = InputBinding {
        state,
        key,
        phase,
        modifiers: Modifiers::from_bits_truncate(modifiers as u32),
        handle: CallbackHandle {
            index,
            target: target as u32,
            generation: caller.data().generation,
        },
    };
    tracing::debug!(state = %binding.state, key = %binding.key, ?phase, index, "input callback registered");
    caller.data_mut().pending_bindings.push(binding);
    Ok(())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Read a guest string through the exported `memory`.
fn read_guest_string(caller: &mut Caller<'_, HostState>, ptr: i32) -> Result<String, anyhow::Error> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("module has no exported memory"))?;
    let text = MemoryView::new(memory.data(&caller)).read_string(ptr as u32)?;
    Ok(text)
}

/// Like [`read_guest_string`] but never fails; used on the abort path where
/// the original failure matters more than a bad message pointer.
fn read_optional_string(caller: &mut Caller<'_, HostState>, ptr: i32) -> String {
    if ptr == 0 {
        return String::new();
    }
    read_guest_string(caller, ptr).unwrap_or_else(|e| format!("<unreadable: {e}>"))
}

fn callback_count(caller: &mut Caller<'_, HostState>) -> Result<u32, anyhow::Error> {
    let global = caller
        .get_export(CALLBACK_COUNT_EXPORT)
        .and_then(|e| e.into_global())
        .ok_or_else(|| anyhow::anyhow!("module has no `{CALLBACK_COUNT_EXPORT}` export"))?;
    match global.get(&mut *caller) {
        Val::I32(count) => Ok(count as u32),
        _ => anyhow::bail!("`{CALLBACK_COUNT_EXPORT}` is not an i32 global"),
    }
}
