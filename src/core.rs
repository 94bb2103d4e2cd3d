//! State and event vocabulary shared by every object.
//!
//! The names and variants defined here are the contract between the core and any
//! observer (GUI, console, automation scripts). Observers must not assume anything
//! beyond this enumerated set.
//!
//! # Data Flow
//!
//! ```text
//! Object::set_state --[Event::Changed]--> listeners (registration order)
//! Object::emit      --[Event::*]-------> listeners subscribed to that EventKind
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::automounter::{MounterEvent, MounterState};
use crate::engine::{EngineEvent, RunState};
use crate::health::Health;
use crate::scan::ScanEvent;

// =============================================================================
// State Values
// =============================================================================

/// Value stored in a named state slot.
///
/// Typed variants exist for the enumerated state machines so that observers can
/// match on them directly instead of parsing strings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    /// Explicitly empty value (e.g., no sample mounted)
    Null,
    /// Boolean flag (active, busy, enabled, ...)
    Bool(bool),
    /// Integer value (counts, indices)
    Int(i64),
    /// Floating point value (positions, readings)
    Float(f64),
    /// Free text (messages, port ids)
    Text(String),
    /// Aggregated device health
    Health(Health),
    /// Engine run state
    Run(RunState),
    /// Automounter state
    Mounter(MounterState),
    /// Structured value (slot tables, snapshots)
    Json(serde_json::Value),
}

impl StateValue {
    /// Returns the boolean payload, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the numeric payload as f64 (ints are widened).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Float(v) => Some(*v),
            StateValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the text payload, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StateValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the health payload, if any.
    pub fn as_health(&self) -> Option<Health> {
        match self {
            StateValue::Health(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the engine run state payload, if any.
    pub fn as_run_state(&self) -> Option<RunState> {
        match self {
            StateValue::Run(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the automounter state payload, if any.
    pub fn as_mounter_state(&self) -> Option<MounterState> {
        match self {
            StateValue::Mounter(v) => Some(*v),
            _ => None,
        }
    }

    /// True for [`StateValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Null => write!(f, "null"),
            StateValue::Bool(v) => write!(f, "{v}"),
            StateValue::Int(v) => write!(f, "{v}"),
            StateValue::Float(v) => write!(f, "{v}"),
            StateValue::Text(v) => write!(f, "{v}"),
            StateValue::Health(v) => write!(f, "{v}"),
            StateValue::Run(v) => write!(f, "{v}"),
            StateValue::Mounter(v) => write!(f, "{v}"),
            StateValue::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Int(value)
    }
}

impl From<usize> for StateValue {
    fn from(value: usize) -> Self {
        StateValue::Int(value as i64)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::Text(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::Text(value)
    }
}

impl From<Health> for StateValue {
    fn from(value: Health) -> Self {
        StateValue::Health(value)
    }
}

impl From<RunState> for StateValue {
    fn from(value: RunState) -> Self {
        StateValue::Run(value)
    }
}

impl From<MounterState> for StateValue {
    fn from(value: MounterState) -> Self {
        StateValue::Mounter(value)
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(value: serde_json::Value) -> Self {
        StateValue::Json(value)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(StateValue::Null, Into::into)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Events delivered to object listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A state slot was written (`changed(name, value)`).
    Changed {
        /// State name
        name: String,
        /// New value
        value: StateValue,
    },
    /// Human readable message with no persisted value.
    Message(String),
    /// The device released its backend and is now terminal.
    Closed,
    /// Engine lifecycle notification.
    Engine(EngineEvent),
    /// Automounter notification.
    Mounter(MounterEvent),
    /// Scan acquisition notification.
    Scan(ScanEvent),
}

impl Event {
    /// Subscription key for this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Changed { .. } => EventKind::Changed,
            Event::Message(_) => EventKind::Message,
            Event::Closed => EventKind::Closed,
            Event::Engine(_) => EventKind::Engine,
            Event::Mounter(_) => EventKind::Mounter,
            Event::Scan(_) => EventKind::Scan,
        }
    }
}

/// Subscription key used by [`crate::observable::Object::on`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// `changed(name, value)`
    Changed,
    /// `message(text)`
    Message,
    /// `closed`
    Closed,
    /// engine lifecycle
    Engine,
    /// automounter notifications
    Mounter,
    /// scan notifications
    Scan,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Changed => "changed",
            EventKind::Message => "message",
            EventKind::Closed => "closed",
            EventKind::Engine => "engine",
            EventKind::Mounter => "mounter",
            EventKind::Scan => "scan",
        };
        f.write_str(name)
    }
}
