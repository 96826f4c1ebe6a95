//! Named input states and trigger matching.
//!
//! An [`InputState`] is a named group of [`InputTrigger`]s. Scripts create
//! states at runtime (through the host input imports) and the runner removes
//! them again when the run stops, so states are addressed by name.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Modifiers
// ---------------------------------------------------------------------------

/// Bit set of held modifier keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Modifiers(pub u8);

impl Modifiers {
    pub const NONE: Self = Self(0);
    pub const SHIFT: Self = Self(1);
    pub const CONTROL: Self = Self(2);
    pub const ALT: Self = Self(4);
    pub const META: Self = Self(8);

    const ALL_BITS: u8 = 0b1111;

    /// Keep only known modifier bits.
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self((bits & Self::ALL_BITS as u32) as u8)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every modifier in `other` is also in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Modifiers {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Triggers and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPhase {
    Press,
    Held,
    Lift,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Key(String),
    /// Any mouse movement or button change.
    Mouse,
}

/// Reference to a guest function in the compiled module's callback table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackHandle {
    /// Index into the exported `table`.
    pub index: u32,
    /// Guest pointer passed to the callback.
    pub target: u32,
    /// Build generation the handle belongs to.
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputAction {
    /// Copy mouse position, deltas and buttons into the guest cells.
    ForwardMouse,
    /// Invoke a guest callback.
    Guest(CallbackHandle),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputTrigger {
    pub source: TriggerSource,
    pub phase: KeyPhase,
    /// Modifiers that must be held. Extra held modifiers still match.
    #[serde(default)]
    pub modifiers: Modifiers,
    pub action: InputAction,
}

impl InputTrigger {
    pub fn key(key: impl Into<String>, phase: KeyPhase, modifiers: Modifiers, action: InputAction) -> Self {
        Self {
            source: TriggerSource::Key(key.into()),
            phase,
            modifiers,
            action,
        }
    }

    pub fn mouse(action: InputAction) -> Self {
        Self {
            source: TriggerSource::Mouse,
            phase: KeyPhase::Held,
            modifiers: Modifiers::NONE,
            action,
        }
    }

    fn matches(&self, event: &InputEvent) -> bool {
        match (&self.source, event) {
            (
                TriggerSource::Key(key),
                InputEvent::Key {
                    key: pressed,
                    phase,
                    modifiers,
                },
            ) => key == pressed && self.phase == *phase && modifiers.contains(self.modifiers),
            (TriggerSource::Mouse, InputEvent::Mouse(_)) => true,
            _ => false,
        }
    }
}

/// Mouse state delivered with a mouse event.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MouseDescriptor {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
    /// Bit per pressed button, primary button in bit 0.
    pub buttons: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputEvent {
    Key {
        key: String,
        phase: KeyPhase,
        #[serde(default)]
        modifiers: Modifiers,
    },
    Mouse(MouseDescriptor),
}

// ---------------------------------------------------------------------------
// InputState / InputSystem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct InputState {
    name: String,
    triggers: Vec<InputTrigger>,
}

impl InputState {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn triggers(&self) -> &[InputTrigger] {
        &self.triggers
    }
}

/// Registered input states, in creation order.
#[derive(Debug, Default)]
pub struct InputSystem {
    states: Vec<InputState>,
}

impl InputSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `trigger` to the state called `state`, creating the state on
    /// first use.
    pub fn add_trigger(&mut self, state: &str, trigger: InputTrigger) {
        match self.states.iter_mut().find(|s| s.name == state) {
            Some(existing) => existing.triggers.push(trigger),
            None => {
                tracing::debug!(state, "input state created");
                self.states.push(InputState {
                    name: state.to_owned(),
                    triggers: vec![trigger],
                });
            }
        }
    }

    /// Remove a state and all of its triggers. Returns whether it existed.
    pub fn delete_state(&mut self, name: &str) -> bool {
        let before = self.states.len();
        self.states.retain(|s| s.name != name);
        let removed = self.states.len() != before;
        if removed {
            tracing::debug!(state = name, "input state deleted");
        }
        removed
    }

    pub fn state(&self, name: &str) -> Option<&InputState> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.state(name).is_some()
    }

    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(|s| s.name.as_str())
    }

    /// Actions of every trigger matching `event`, in state then trigger
    /// order.
    pub fn fire(&self, event: &InputEvent) -> Vec<InputAction> {
        self.states
            .iter()
            .flat_map(|s| s.triggers.iter())
            .filter(|t| t.matches(event))
            .map(|t| t.action)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
