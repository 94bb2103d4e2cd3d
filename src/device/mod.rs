//! Devices
//!
//! A [`Device`] is an [`Object`] that stands for one piece of hardware. On top of
//! the raw state slots it maintains the standard states every observer can rely on:
//!
//! | State     | Type     | Meaning                                             |
//! |-----------|----------|-----------------------------------------------------|
//! | `active`  | bool     | backend connected and all components active         |
//! | `busy`    | bool     | at least one operation in flight                    |
//! | `enabled` | bool     | not manually disabled                               |
//! | `health`  | `Health` | aggregate of the health registry                    |
//! | `message` | text     | last human readable status message                  |
//! | `closed`  | bool     | `cleanup()` has run; the device is terminal         |
//!
//! Predicates such as [`Device::is_busy`] are pure reads of these states and never
//! touch the backend.
//!
//! # Components
//!
//! A device owns its sub-devices. A component that degrades or faults registers a
//! SERIOUS `component:<name>` entry on its parent, and the parent only reports
//! `active` while every component does. Components hold no strong reference back to
//! the parent.

pub mod options;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub use options::{ConfigMap, OptionKind, OptionSpec};

use crate::core::{Event, EventKind, StateValue};
use crate::error::{AppResult, BeamlineError};
use crate::health::{Health, HealthManager, HealthReport, Severity};
use crate::observable::Object;
use crate::traits::{Configurable, Waitable};

/// Names of the standard states declared on every device.
pub const STANDARD_STATES: [&str; 6] = ["active", "busy", "enabled", "health", "message", "closed"];

/// Capability tags a device may advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Moves to a commanded position
    Positioner,
    /// Integrates a reading over a dwell time
    Counter,
    /// Robotic sample exchange
    SampleExchange,
    /// Can pre-position for the next mount
    Prefetch,
    /// Reads sample barcodes
    Barcode,
    /// Beam shutter
    Shutter,
    /// Sample rotation stage
    Goniometer,
    /// Multi-channel analyzer
    Mca,
}

type ReleaseHook = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct DeviceInner {
    object: Object,
    components: RwLock<Vec<Device>>,
    features: RwLock<BTreeSet<Feature>>,
    health: Mutex<HealthManager>,
    /// Backend-reported activity, before combining with components
    backend_active: AtomicBool,
    pending: AtomicUsize,
    closed: AtomicBool,
    schema: RwLock<Vec<OptionSpec>>,
    config: RwLock<ConfigMap>,
    release_hooks: Mutex<Vec<ReleaseHook>>,
}

/// Handle to one piece of hardware. Clones share the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("components", &self.inner.components.read().len())
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Device {
    /// Create a device with the standard states declared and no backend attached.
    pub fn new(name: impl Into<String>) -> Self {
        let object = Object::new(name);
        object.declare("active", false);
        object.declare("busy", false);
        object.declare("enabled", true);
        object.declare("health", Health::Ok);
        object.declare("message", "");
        object.declare("closed", false);
        Self {
            inner: Arc::new(DeviceInner {
                object,
                components: RwLock::new(Vec::new()),
                features: RwLock::new(BTreeSet::new()),
                health: Mutex::new(HealthManager::new()),
                backend_active: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                schema: RwLock::new(Vec::new()),
                config: RwLock::new(ConfigMap::new()),
                release_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        self.inner.object.name()
    }

    /// Underlying observable object.
    pub fn object(&self) -> &Object {
        &self.inner.object
    }

    /// Fail with [`BeamlineError::ClosedDevice`] once `cleanup()` has run.
    pub fn ensure_open(&self) -> AppResult<()> {
        if self.is_closed() {
            return Err(BeamlineError::ClosedDevice(self.name().to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Components and features
    // =========================================================================

    /// Take ownership of a sub-device and aggregate its health and activity.
    pub fn add_component(&self, component: Device) -> AppResult<()> {
        self.ensure_open()?;
        let child = component.name().to_string();
        if self.component(&child).is_some() {
            return Err(BeamlineError::Configuration(format!(
                "{}: duplicate component '{}'",
                self.name(),
                child
            )));
        }

        let parent: Weak<DeviceInner> = Arc::downgrade(&self.inner);
        let watched = child.clone();
        component.object().on(EventKind::Changed, move |event| {
            let Event::Changed { name, .. } = event else {
                return;
            };
            if name != "health" && name != "active" {
                return;
            }
            if let Some(inner) = parent.upgrade() {
                Device { inner }.refresh_component(&watched);
            }
        });

        self.inner.components.write().push(component);
        debug!(device = %self.name(), component = %child, "component added");
        self.refresh_component(&child);
        Ok(())
    }

    /// Component by name.
    pub fn component(&self, name: &str) -> Option<Device> {
        self.inner
            .components
            .read()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// All components in insertion order.
    pub fn components(&self) -> Vec<Device> {
        self.inner.components.read().clone()
    }

    /// Advertise a capability.
    pub fn add_feature(&self, feature: Feature) {
        self.inner.features.write().insert(feature);
    }

    /// True if the capability was advertised.
    pub fn supports(&self, feature: Feature) -> bool {
        self.inner.features.read().contains(&feature)
    }

    /// Advertised capabilities, ordered.
    pub fn features(&self) -> Vec<Feature> {
        self.inner.features.read().iter().copied().collect()
    }

    fn refresh_component(&self, child: &str) {
        let Some(component) = self.component(child) else {
            return;
        };
        let context = format!("component:{child}");
        match component.health() {
            Health::Ok => self.clear_health(&context),
            health => self.set_health(
                Severity::SERIOUS,
                &context,
                Some(&format!("{child} {health}")),
            ),
        }
        self.refresh_active();
    }

    fn refresh_active(&self) {
        let active = self.inner.backend_active.load(Ordering::SeqCst)
            && self.inner.components.read().iter().all(Device::is_active);
        self.update_state("active", active);
    }

    /// Store only if the value differs, so repeated identical writes stay silent.
    fn update_state(&self, name: &str, value: impl Into<StateValue>) {
        let value = value.into();
        let _hold = self.inner.object.hold();
        if self.inner.object.get_state(name).ok().as_ref() != Some(&value) {
            self.inner.object.set_state(name, value);
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Report backend connectivity. The `active` state also requires all components.
    pub fn set_active(&self, active: bool) {
        self.inner.backend_active.store(active, Ordering::SeqCst);
        self.refresh_active();
    }

    /// Publish a status message (state `message` plus a `message` event).
    pub fn set_message(&self, text: impl Into<String>) {
        let text = text.into();
        let _hold = self.inner.object.hold();
        self.inner.object.set_state("message", text.as_str());
        self.inner.object.emit(Event::Message(text));
    }

    /// Enable or manually disable the device. Disabling marks it faulted.
    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.clear_health("disabled");
        } else {
            self.set_health(Severity::DISABLED, "disabled", Some("disabled"));
        }
        self.update_state("enabled", enabled);
        info!(device = %self.name(), enabled, "device enable changed");
    }

    /// Register a health problem under `context`.
    pub fn set_health(&self, severity: Severity, context: &str, message: Option<&str>) {
        let report = {
            let mut health = self.inner.health.lock();
            health.add(severity, context, message);
            health.report()
        };
        if report.health != Health::Ok {
            debug!(device = %self.name(), context, severity = severity.bits(), "health problem");
        }
        self.update_state("health", report.health);
    }

    /// Clear the health problem registered under `context`.
    pub fn clear_health(&self, context: &str) {
        let report = {
            let mut health = self.inner.health.lock();
            if !health.remove(context) {
                return;
            }
            health.report()
        };
        self.update_state("health", report.health);
    }

    /// Aggregated health registry.
    pub fn health_report(&self) -> HealthReport {
        self.inner.health.lock().report()
    }

    fn flag(&self, name: &str) -> bool {
        self.inner
            .object
            .get_state(name)
            .ok()
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Current health level.
    pub fn health(&self) -> Health {
        self.inner
            .object
            .get_state("health")
            .ok()
            .and_then(|v| v.as_health())
            .unwrap_or_default()
    }

    /// True while at least one operation is in flight.
    pub fn is_busy(&self) -> bool {
        self.flag("busy")
    }

    /// True when the backend and all components are active.
    pub fn is_active(&self) -> bool {
        self.flag("active")
    }

    /// True unless manually disabled.
    pub fn is_enabled(&self) -> bool {
        self.flag("enabled")
    }

    /// True when no health problem is registered.
    pub fn is_healthy(&self) -> bool {
        self.health() == Health::Ok
    }

    /// True once `cleanup()` has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of in-flight operations.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Mark the start of an operation. `busy` stays set until every guard is dropped.
    pub fn begin_operation(&self) -> AppResult<OperationGuard> {
        self.ensure_open()?;
        let _hold = self.inner.object.hold();
        if self.inner.pending.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inner.object.set_state("busy", true);
        }
        Ok(OperationGuard {
            device: self.clone(),
        })
    }

    fn end_operation(&self) {
        let _hold = self.inner.object.hold();
        if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.object.set_state("busy", false);
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Declare the options accepted by [`Device::apply_config`].
    pub fn declare_options(&self, specs: Vec<OptionSpec>) -> AppResult<()> {
        if let Some(spec) = specs
            .iter()
            .find(|s| STANDARD_STATES.contains(&s.name.as_str()))
        {
            return Err(BeamlineError::Configuration(format!(
                "{}: option '{}' shadows a standard state",
                self.name(),
                spec.name
            )));
        }
        self.inner.schema.write().extend(specs);
        Ok(())
    }

    /// Validate and apply a configuration map.
    ///
    /// Every entry is validated before anything is applied. Each applied option is
    /// stored in the state slot of the same name. Returns `false` when nothing
    /// changed (no events are emitted in that case).
    pub fn apply_config(&self, options: &ConfigMap) -> AppResult<bool> {
        self.ensure_open()?;
        let validated = {
            let schema = self.inner.schema.read();
            let mut validated = Vec::with_capacity(options.len());
            for (name, value) in options {
                let spec = schema.iter().find(|s| &s.name == name).ok_or_else(|| {
                    BeamlineError::Configuration(format!(
                        "{}: unknown option '{}'",
                        self.name(),
                        name
                    ))
                })?;
                validated.push((name, value, spec.validate(value)?));
            }
            validated
        };

        let _hold = self.inner.object.hold();
        let mut changed = false;
        for (name, raw, state) in validated {
            if self.inner.object.get_state(name).ok().as_ref() == Some(&state) {
                continue;
            }
            self.inner.config.write().insert(name.clone(), raw.clone());
            self.inner.object.set_state(name, state);
            changed = true;
        }
        if changed {
            info!(device = %self.name(), "configuration applied");
        } else {
            debug!(device = %self.name(), "configuration unchanged");
        }
        Ok(changed)
    }

    /// Applied value of an option.
    pub fn option(&self, name: &str) -> Option<StateValue> {
        if !self.inner.config.read().contains_key(name) {
            return None;
        }
        self.inner.object.get_state(name).ok()
    }

    /// Copy of the applied configuration.
    pub fn config(&self) -> ConfigMap {
        self.inner.config.read().clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register a hook that releases backend resources during `cleanup()`.
    pub fn on_release<F>(&self, hook: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.inner.release_hooks.lock().push(Box::new(hook));
    }

    /// Release backend resources and enter the terminal `closed` state.
    ///
    /// Components are cleaned first, in reverse order. Release failures are
    /// collected; the device still ends up closed. Calling it again is a no-op.
    pub fn cleanup(&self) -> AppResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut failures = Vec::new();
        for component in self.components().into_iter().rev() {
            if let Err(e) = component.cleanup() {
                failures.push(e);
            }
        }
        let hooks = std::mem::take(&mut *self.inner.release_hooks.lock());
        for hook in hooks {
            if let Err(e) = hook() {
                warn!(device = %self.name(), error = %e, "backend release failed");
                failures.push(BeamlineError::Hardware(e));
            }
        }

        self.inner.backend_active.store(false, Ordering::SeqCst);
        {
            let _hold = self.inner.object.hold();
            self.update_state("active", false);
            self.inner.object.set_state("closed", true);
            self.inner.object.emit(Event::Closed);
        }
        info!(device = %self.name(), "device closed");

        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(BeamlineError::ShutdownFailed(failures)),
        }
    }
}

impl Waitable for Device {
    fn object(&self) -> &Object {
        &self.inner.object
    }
}

impl Configurable for Device {
    type Options = ConfigMap;

    fn configure(&self, options: ConfigMap) -> AppResult<()> {
        self.apply_config(&options).map(|_| ())
    }
}

/// RAII marker for an in-flight operation. See [`Device::begin_operation`].
#[must_use = "the operation ends when the guard is dropped"]
pub struct OperationGuard {
    device: Device,
}

impl fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationGuard")
            .field("device", &self.device.name())
            .finish()
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.device.end_operation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    fn count_changes(device: &Device) -> Arc<AtomicU64> {
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        device.object().on(EventKind::Changed, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_standard_states_declared() {
        let device = Device::new("shutter");
        for name in STANDARD_STATES {
            assert!(device.object().has_state(name), "missing {name}");
        }
        assert!(!device.is_busy());
        assert!(device.is_enabled());
        assert!(device.is_healthy());
        assert!(!device.is_active());
    }

    #[test]
    fn test_features() {
        let device = Device::new("robot");
        device.add_feature(Feature::SampleExchange);
        device.add_feature(Feature::Prefetch);
        assert!(device.supports(Feature::Prefetch));
        assert!(!device.supports(Feature::Mca));
        assert_eq!(device.features().len(), 2);
    }

    #[test]
    fn test_configure_validates_before_applying() {
        let device = Device::new("motor");
        device
            .declare_options(vec![
                OptionSpec::float("speed", 0.1, 100.0),
                OptionSpec::choice("mode", &["fast", "fine"]),
            ])
            .unwrap();

        let mut bad = ConfigMap::new();
        bad.insert("mode".into(), json!("fine"));
        bad.insert("speed".into(), json!(500.0));
        let err = device.apply_config(&bad).unwrap_err();
        assert!(matches!(err, BeamlineError::Configuration(_)));
        // nothing applied, including the valid entry
        assert!(device.option("mode").is_none());

        let mut unknown = ConfigMap::new();
        unknown.insert("acceleration".into(), json!(1.0));
        assert!(device.apply_config(&unknown).is_err());
    }

    #[test]
    fn test_configure_is_idempotent() {
        let device = Device::new("motor");
        device
            .declare_options(vec![OptionSpec::float("speed", 0.1, 100.0)])
            .unwrap();
        let changes = count_changes(&device);

        let mut config = ConfigMap::new();
        config.insert("speed".into(), json!(2.5));
        assert!(device.apply_config(&config).unwrap());
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        assert!(!device.apply_config(&config).unwrap());
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert_eq!(device.option("speed"), Some(StateValue::Float(2.5)));
    }

    #[test]
    fn test_option_may_not_shadow_standard_state() {
        let device = Device::new("motor");
        let err = device
            .declare_options(vec![OptionSpec::boolean("busy")])
            .unwrap_err();
        assert!(err.to_string().contains("standard state"));
    }

    #[test]
    fn test_operation_guard_tracks_busy() {
        let device = Device::new("counter");
        let first = device.begin_operation().unwrap();
        let second = device.begin_operation().unwrap();
        assert!(device.is_busy());
        assert_eq!(device.pending(), 2);
        drop(first);
        assert!(device.is_busy());
        drop(second);
        assert!(!device.is_busy());
        assert_eq!(device.pending(), 0);
    }

    #[test]
    fn test_component_fault_degrades_parent() {
        let parent = Device::new("automounter");
        let child = Device::new("gripper");
        parent.add_component(child.clone()).unwrap();
        assert!(parent.is_healthy());

        child.set_health(Severity::CRITICAL, "motor", Some("stalled"));
        assert_eq!(child.health(), Health::Faulted);
        assert_eq!(parent.health(), Health::Degraded);
        assert!(parent.health_report().message.contains("gripper faulted"));

        child.clear_health("motor");
        assert!(parent.is_healthy());
    }

    #[test]
    fn test_active_requires_all_components() {
        let parent = Device::new("goniometer");
        let omega = Device::new("omega");
        parent.add_component(omega.clone()).unwrap();
        parent.set_active(true);
        assert!(!parent.is_active());
        omega.set_active(true);
        assert!(parent.is_active());
        omega.set_active(false);
        assert!(!parent.is_active());
    }

    #[test]
    fn test_disable_faults_device() {
        let device = Device::new("shutter");
        device.set_enabled(false);
        assert!(!device.is_enabled());
        assert_eq!(device.health(), Health::Faulted);
        device.set_enabled(true);
        assert!(device.is_healthy());
    }

    #[test]
    fn test_sibling_fault_is_contained() {
        let parent = Device::new("table");
        let a = Device::new("x");
        let b = Device::new("y");
        parent.add_component(a.clone()).unwrap();
        parent.add_component(b.clone()).unwrap();
        a.set_health(Severity::CRITICAL, "limit", None);
        assert!(b.is_healthy());
        assert_eq!(a.health(), Health::Faulted);
    }

    #[test]
    fn test_cleanup_closes_device_and_components() {
        let parent = Device::new("detector");
        let child = Device::new("cooler");
        parent.add_component(child.clone()).unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        parent.on_release(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let closed_events = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&closed_events);
        parent.object().on(EventKind::Closed, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        parent.cleanup().unwrap();
        assert!(released.load(Ordering::SeqCst));
        assert!(parent.is_closed());
        assert!(child.is_closed());
        assert_eq!(closed_events.load(Ordering::SeqCst), 1);

        // second cleanup is a no-op
        parent.cleanup().unwrap();
        assert_eq!(closed_events.load(Ordering::SeqCst), 1);

        assert!(matches!(
            parent.begin_operation().unwrap_err(),
            BeamlineError::ClosedDevice(_)
        ));
        assert!(matches!(
            parent.apply_config(&ConfigMap::new()).unwrap_err(),
            BeamlineError::ClosedDevice(_)
        ));
    }

    #[test]
    fn test_cleanup_reports_release_failure() {
        let device = Device::new("mca");
        device.on_release(|| anyhow::bail!("socket already gone"));
        let err = device.cleanup().unwrap_err();
        assert!(matches!(err, BeamlineError::Hardware(_)));
        assert!(device.is_closed());
    }

    #[tokio::test]
    async fn test_wait_on_busy() {
        let device = Device::new("slow");
        let guard = device.begin_operation().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        let idle = device
            .wait_while("busy", &[true.into()], Duration::from_secs(2))
            .await;
        assert!(idle);
    }
}
