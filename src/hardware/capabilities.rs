//! Hardware backend capabilities
//!
//! The control-channel protocol behind each device is opaque to the core. Backends
//! implement the small capability traits they actually support:
//!
//! - A motor implements [`Positioner`]
//! - A scaler channel or detector implements [`Counter`]
//! - A sample-exchange robot implements [`Manipulator`]
//!
//! Each trait is async, thread-safe and returns `anyhow::Result`; the core wraps
//! backend failures into [`crate::error::BeamlineError::Hardware`].
//!
//! Positioners and counters expose the [`Device`] that carries their observable
//! states, so engines can wait on them with the usual `wait*` primitives.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::automounter::slots::{PortId, Slot};
use crate::device::Device;

/// Capability: move to an absolute position.
///
/// Positioner devices publish a `position` state while moving and hold `busy`
/// for the duration of a move.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Device carrying the `position`, `target` and `busy` states.
    fn device(&self) -> &Device;

    /// Command a move. Returns once the move is accepted, not when it completes.
    async fn move_to(&self, target: f64) -> Result<()>;

    /// Current position read from the backend.
    async fn position(&self) -> Result<f64>;

    /// Halt any move in progress.
    async fn stop(&self) -> Result<()>;

    /// Engineering units of the position.
    fn units(&self) -> &str {
        "mm"
    }
}

/// Capability: integrate a reading over a dwell time.
#[async_trait]
pub trait Counter: Send + Sync {
    /// Device carrying the `value` and `busy` states.
    fn device(&self) -> &Device;

    /// Count for `dwell` and return the integrated value.
    async fn count(&self, dwell: Duration) -> Result<f64>;
}

impl fmt::Debug for dyn Positioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Positioner").field(self.device()).finish()
    }
}

impl fmt::Debug for dyn Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(self.device()).finish()
    }
}

/// Capability: the mechanical steps of a sample-exchange robot.
///
/// Each call is one uninterruptible mechanical action. Callers sequence them and
/// check for cancellation only between calls.
#[async_trait]
pub trait Manipulator: Send + Sync {
    /// Run the homing sequence, leaving the arm parked with an empty gripper.
    async fn home(&self) -> Result<()>;

    /// Take the sample out of `port` into the gripper.
    async fn pick(&self, port: &PortId) -> Result<()>;

    /// Put the sample in the gripper into `port`.
    async fn place(&self, port: &PortId) -> Result<()>;

    /// Transfer the sample in the gripper onto the goniometer.
    async fn load_goniometer(&self) -> Result<()>;

    /// Take the sample on the goniometer into the gripper.
    async fn unload_goniometer(&self) -> Result<()>;

    /// Move the arm to its safe rest position.
    async fn park(&self) -> Result<()>;

    /// Pre-position the arm next to `port`.
    async fn prefetch(&self, port: &PortId) -> Result<()>;

    /// Probe all ports.
    async fn inventory(&self) -> Result<Vec<Slot>>;
}
