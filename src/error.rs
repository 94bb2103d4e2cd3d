//! Custom error types for the beamline core.
//!
//! This module defines the primary error type, `BeamlineError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur, from invalid configuration to automounter faults.
//!
//! ## Error Hierarchy
//!
//! `BeamlineError` consolidates the following groups:
//!
//! - **Framework errors**: `UnknownState` (read of an undeclared state), `ClosedDevice`
//!   (use after `cleanup()`), `NotFound` (registry lookup), `EngineState` (an engine
//!   command issued from a state that does not accept it).
//! - **Input errors**: `Configuration` (bad options, duplicate names, bad config files) and
//!   `InvalidScanSpec` (malformed scan ranges).
//! - **AutoMounter preconditions**: `PortEmpty`, `InvalidPort`, `AutomounterBusy`,
//!   `NotReady` and `Fault`. Busy contention is reported, never queued silently.
//! - **Backend errors**: `Hardware` wraps the `anyhow::Error` returned by the opaque
//!   device backends; `MoveTimeout` marks a positioner that never reached its target.
//! - **Persistence errors**: `Io`, `Csv`, `Json`, `Record` and `Template` for the scan record.
//!
//! Timeouts of `wait*` primitives are not errors: they are returned as `false`.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, BeamlineError>;

/// Error type shared by every device, engine and the beamline registry.
#[derive(Error, Debug)]
pub enum BeamlineError {
    /// Configuration file could not be loaded or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Semantically invalid configuration or device options.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A state name was read before it was ever declared or set.
    #[error("Unknown state '{name}' on '{object}'")]
    UnknownState {
        /// Object that was queried.
        object: String,
        /// Requested state name.
        name: String,
    },

    /// The requested automounter port holds no sample.
    #[error("Port {0} is empty")]
    PortEmpty(String),

    /// The port id is malformed or not part of the dewar inventory.
    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    /// Another mount/dismount currently owns the manipulator.
    #[error("Automounter busy: {0}")]
    AutomounterBusy(String),

    /// The automounter is in its sticky fault state.
    #[error("Automounter fault: {0}")]
    Fault(String),

    /// The automounter has not been prepared or is in a state that rejects the command.
    #[error("'{device}' not ready (state: {state})")]
    NotReady {
        /// Device name.
        device: String,
        /// Current state name.
        state: String,
    },

    /// Malformed scan specification.
    #[error("Invalid scan specification: {0}")]
    InvalidScanSpec(String),

    /// Operation attempted after `cleanup()`.
    #[error("Device '{0}' is closed")]
    ClosedDevice(String),

    /// Registry lookup failed.
    #[error("No {kind} named '{name}'")]
    NotFound {
        /// Kind of entry that was requested.
        kind: &'static str,
        /// Requested name.
        name: String,
    },

    /// Engine command not accepted from the current run state.
    #[error("Engine '{engine}' cannot {action} while {state}")]
    EngineState {
        /// Engine name.
        engine: String,
        /// Rejected action.
        action: &'static str,
        /// Current run state name.
        state: String,
    },

    /// A run ended in `failed`; carries the rendered cause.
    #[error("Engine '{engine}' failed: {reason}")]
    RunFailed {
        /// Engine name.
        engine: String,
        /// Cause of the failure.
        reason: String,
    },

    /// A positioner did not reach its target in time or outside tolerance.
    #[error("Positioner '{device}' did not reach {target}: {reason}")]
    MoveTimeout {
        /// Positioner name.
        device: String,
        /// Requested target.
        target: f64,
        /// Timeout or tolerance detail.
        reason: String,
    },

    /// Error reported by an opaque hardware backend.
    #[error("Hardware error: {0}")]
    Hardware(#[from] anyhow::Error),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Scan record row encoding/decoding failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration snapshot encoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed scan record.
    #[error("Scan record error: {0}")]
    Record(String),

    /// Output template could not be rendered.
    #[error("Output template error: {0}")]
    Template(String),

    /// One or more components failed to release their resources.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<BeamlineError>),
}

impl BeamlineError {
    /// Returns true for conditions a caller may retry or back off from.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BeamlineError::AutomounterBusy(_)
                | BeamlineError::NotReady { .. }
                | BeamlineError::MoveTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BeamlineError::PortEmpty("MA3".to_string());
        assert_eq!(err.to_string(), "Port MA3 is empty");

        let err = BeamlineError::NotFound {
            kind: "device",
            name: "mono".into(),
        };
        assert_eq!(err.to_string(), "No device named 'mono'");
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = BeamlineError::ShutdownFailed(vec![
            BeamlineError::ClosedDevice("omega".into()),
            BeamlineError::Hardware(anyhow::anyhow!("robot link lost")),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(BeamlineError::AutomounterBusy("mounting".into()).is_recoverable());
        assert!(!BeamlineError::Fault("gripper jammed".into()).is_recoverable());
    }
}
