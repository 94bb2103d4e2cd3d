//! Capability interfaces implemented by devices and engines.
//!
//! Instead of a deep class hierarchy, concrete structs implement the small set of
//! capabilities they actually support:
//!
//! - [`Waitable`]: timeout-bounded waits on the object's states
//! - [`Configurable`]: validated, idempotent configuration
//! - [`Pausable`]: cooperative pause/resume/stop
//!
//! Code that needs polymorphism over these uses trait bounds or the tagged
//! variants of the beamline registry.

use async_trait::async_trait;
use std::time::Duration;

use crate::core::StateValue;
use crate::error::AppResult;
use crate::observable::Object;

/// Capability: block the calling task until a state condition holds.
///
/// All waits return `false` on timeout instead of raising, so callers decide how
/// to escalate.
#[async_trait]
pub trait Waitable: Send + Sync {
    /// The object whose states are waited on.
    fn object(&self) -> &Object;

    /// Wait until `name` satisfies `predicate`.
    async fn wait<F>(&self, name: &str, predicate: F, timeout: Duration) -> bool
    where
        F: Fn(&StateValue) -> bool + Send + Sync,
    {
        self.object().wait_for(name, predicate, timeout).await
    }

    /// Wait until `name` takes any of `values`.
    async fn wait_until(&self, name: &str, values: &[StateValue], timeout: Duration) -> bool {
        self.object().wait_until(name, values, timeout).await
    }

    /// Wait while `name` holds any of `values`.
    async fn wait_while(&self, name: &str, values: &[StateValue], timeout: Duration) -> bool {
        self.object().wait_while(name, values, timeout).await
    }
}

/// Capability: accept a validated configuration.
///
/// Implementations must be idempotent: applying the same options twice leaves the
/// object unchanged and emits nothing the second time.
pub trait Configurable {
    /// Configuration input type
    type Options;

    /// Validate and apply `options`.
    fn configure(&self, options: Self::Options) -> AppResult<()>;
}

/// Capability: cooperative pause/resume/stop.
///
/// Requests issued from a state that does not accept them are silent no-ops and
/// return `false`; this absorbs double-clicks and similar UI races.
pub trait Pausable {
    /// Request a pause at the next checkpoint (valid from `running`).
    fn pause(&self) -> bool;

    /// Resume a paused task (valid from `paused`).
    fn resume(&self) -> bool;

    /// Request cooperative cancellation (valid from any non-terminal state).
    fn stop(&self) -> bool;
}
