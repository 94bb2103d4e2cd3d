//! Robotic sample exchange
//!
//! The [`AutoMounter`] serializes every sample-exchange operation against one
//! physical manipulator.
//!
//! # State machine
//!
//! ```text
//! unknown --prepare--> preparing --> idle
//! idle --mount--> preparing --> mounting --> mounted
//! mounted --mount(other)--> preparing --> dismounting --> mounting --> mounted
//! mounted --dismount--> dismounting --> idle
//! any --hardware error--> fault --recover--> recovering --> idle | mounted
//!                                                        +--> fault (retries exhausted)
//! ```
//!
//! `fault` is sticky: only [`AutoMounter::recover`] leaves it.
//!
//! # Concurrency
//!
//! A second mount/dismount issued while one is in flight is rejected with
//! [`BeamlineError::AutomounterBusy`], never queued. Prefetch is optimistic and
//! only runs when the arm is free. Cancellation is checked between mechanical
//! steps; a cancelled operation first returns the sample to a known position and
//! parks the arm.

pub mod slots;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::{Event, StateValue};
use crate::device::{Device, Feature, OperationGuard};
use crate::error::{AppResult, BeamlineError};
use crate::error_recovery::{retry_with_policy, RetryPolicy};
use crate::hardware::capabilities::Manipulator;
use crate::health::Severity;
use crate::observable::Object;
use crate::traits::Waitable;

pub use slots::{Occupancy, PortId, SampleStore, Slot};

/// State of the sample-exchange state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MounterState {
    /// Power-on, not yet prepared
    Unknown,
    /// Ready, no sample mounted
    Idle,
    /// Command accepted, getting ready
    Preparing,
    /// Transferring a sample to the goniometer
    Mounting,
    /// A sample is on the goniometer
    Mounted,
    /// Returning a sample to its port
    Dismounting,
    /// Running the homing sequence after a fault
    Recovering,
    /// Mechanical fault; only `recover()` leaves this state
    Fault,
}

impl MounterState {
    /// An operation owns the arm.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            MounterState::Preparing
                | MounterState::Mounting
                | MounterState::Dismounting
                | MounterState::Recovering
        )
    }

    /// Accepts mount and prefetch requests.
    pub fn is_ready(self) -> bool {
        matches!(self, MounterState::Idle | MounterState::Mounted)
    }
}

impl fmt::Display for MounterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MounterState::Unknown => "unknown",
            MounterState::Idle => "idle",
            MounterState::Preparing => "preparing",
            MounterState::Mounting => "mounting",
            MounterState::Mounted => "mounted",
            MounterState::Dismounting => "dismounting",
            MounterState::Recovering => "recovering",
            MounterState::Fault => "fault",
        };
        f.write_str(name)
    }
}

/// Notifications emitted as [`Event::Mounter`].
#[derive(Clone, Debug, PartialEq)]
pub enum MounterEvent {
    /// State machine transition
    State(MounterState),
    /// Sample on the goniometer changed (`None` after a dismount)
    Sample(Option<PortId>),
    /// Port inventory changed
    Ports,
    /// The arm was pre-positioned next to a port
    Prefetched(PortId),
    /// An operation failed and the device entered `fault`
    Failure(String),
}

/// Result of a mount or dismount request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MountOutcome {
    /// The sample was mounted
    Mounted(PortId),
    /// The requested sample was already on the goniometer; nothing moved
    AlreadyMounted(PortId),
    /// The previously mounted sample was returned, then the new one mounted
    Exchanged {
        /// Port of the sample that was returned
        returned: PortId,
        /// Port of the sample now mounted
        mounted: PortId,
    },
    /// The mounted sample was returned to its port
    Dismounted(PortId),
    /// Aborted on request; the sample is back in a known position
    Cancelled,
}

enum MountPlan {
    AlreadyMounted,
    Load {
        exchange: Option<PortId>,
        _guard: OperationGuard,
    },
}

struct MounterInner {
    device: Device,
    manipulator: Arc<dyn Manipulator>,
    /// The physical arm. Held for the full duration of every mechanical sequence.
    arm: tokio::sync::Mutex<()>,
    control: watch::Sender<MounterState>,
    store: Mutex<SampleStore>,
    cancel: AtomicBool,
    prefetched: Mutex<Option<PortId>>,
    prefetch_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    last_fault: Mutex<String>,
    retry: RetryPolicy,
}

/// Robotic sample changer. Clones share the same device.
#[derive(Clone)]
pub struct AutoMounter {
    inner: Arc<MounterInner>,
}

impl fmt::Debug for AutoMounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoMounter")
            .field("name", &self.inner.device.name())
            .field("state", &self.state())
            .field("mounted", &self.mounted_port())
            .finish()
    }
}

impl AutoMounter {
    /// Automounter driving `manipulator`, recovering with the default retry policy.
    pub fn new(name: &str, manipulator: Arc<dyn Manipulator>) -> Self {
        Self::with_retry_policy(name, manipulator, RetryPolicy::default())
    }

    /// Automounter with a custom recovery retry policy.
    pub fn with_retry_policy(
        name: &str,
        manipulator: Arc<dyn Manipulator>,
        retry: RetryPolicy,
    ) -> Self {
        let device = Device::new(name);
        device.add_feature(Feature::SampleExchange);
        device.add_feature(Feature::Prefetch);
        device.add_feature(Feature::Barcode);
        let object = device.object();
        object.declare("state", MounterState::Unknown);
        object.declare("sample", StateValue::Null);
        object.declare("mounted", false);
        object.declare("ports", serde_json::json!({}));

        let prefetch_task: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        let pending = Arc::clone(&prefetch_task);
        device.on_release(move || {
            if let Some(handle) = pending.lock().take() {
                handle.abort();
            }
            Ok(())
        });
        device.set_active(true);

        let (control, _) = watch::channel(MounterState::Unknown);
        Self {
            inner: Arc::new(MounterInner {
                device,
                manipulator,
                arm: tokio::sync::Mutex::new(()),
                control,
                store: Mutex::new(SampleStore::new()),
                cancel: AtomicBool::new(false),
                prefetched: Mutex::new(None),
                prefetch_task,
                last_fault: Mutex::new(String::new()),
                retry,
            }),
        }
    }

    /// Underlying device.
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    /// Device name.
    pub fn name(&self) -> &str {
        self.inner.device.name()
    }

    /// Current state.
    pub fn state(&self) -> MounterState {
        *self.inner.control.borrow()
    }

    // =========================================================================
    // Inventory queries
    // =========================================================================

    /// All ports, ordered.
    pub fn slots(&self) -> Vec<Slot> {
        self.inner.store.lock().slots()
    }

    /// One port.
    pub fn slot(&self, port: &str) -> AppResult<Slot> {
        let port = PortId::parse(port)?;
        self.inner
            .store
            .lock()
            .get(&port)
            .cloned()
            .ok_or_else(|| BeamlineError::InvalidPort(port.to_string()))
    }

    /// Port of the sample on the goniometer.
    pub fn mounted_port(&self) -> Option<PortId> {
        self.inner
            .store
            .lock()
            .mounted()
            .map(|slot| slot.port.clone())
    }

    /// True if any sample is mounted, or if the sample from `port` is mounted.
    pub fn is_mounted(&self, port: Option<&str>) -> bool {
        match (port, self.mounted_port()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(text), Some(mounted)) => PortId::parse(text).map_or(false, |p| p == mounted),
        }
    }

    /// True if `port` could be mounted right now.
    pub fn is_mountable(&self, port: &str) -> bool {
        let Ok(port) = PortId::parse(port) else {
            return false;
        };
        if !self.state().is_ready() || self.inner.device.is_closed() {
            return false;
        }
        let store = self.inner.store.lock();
        matches!(
            store.occupancy(&port),
            Ok(Occupancy::Occupied | Occupancy::Unknown)
        )
    }

    /// Port the arm was last pre-positioned at.
    pub fn prefetched(&self) -> Option<PortId> {
        self.inner.prefetched.lock().clone()
    }

    /// Wait until the device accepts new requests (`idle` or `mounted`).
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.wait_until(
            "state",
            &[MounterState::Idle.into(), MounterState::Mounted.into()],
            timeout,
        )
        .await
    }

    // =========================================================================
    // State bookkeeping
    // =========================================================================

    fn emitter(&self) -> &Object {
        self.inner.device.object()
    }

    fn transition_to(&self, to: MounterState) {
        let object = self.emitter();
        let _hold = object.hold();
        let mut from = None;
        self.inner.control.send_if_modified(|state| {
            if *state == to {
                return false;
            }
            from = Some(*state);
            *state = to;
            true
        });
        if let Some(from) = from {
            info!(device = %self.name(), %from, %to, "automounter state");
            object.set_state("state", to);
            object.emit(Event::Mounter(MounterEvent::State(to)));
        }
    }

    /// Apply an inventory update and publish `ports`, `sample` and `mounted`.
    fn update_store<F: FnOnce(&mut SampleStore)>(&self, update: F) {
        let object = self.emitter();
        let _hold = object.hold();
        let (before, after, ports) = {
            let mut store = self.inner.store.lock();
            let before = store.mounted().map(|slot| slot.port.clone());
            update(&mut store);
            let after = store.mounted().map(|slot| slot.port.clone());
            (before, after, store.to_json())
        };
        object.set_state("ports", ports);
        object.emit(Event::Mounter(MounterEvent::Ports));
        if before != after {
            object.set_state("sample", after.as_ref().map(ToString::to_string));
            object.set_state("mounted", after.is_some());
            object.emit(Event::Mounter(MounterEvent::Sample(after)));
        }
    }

    fn settled_state(&self) -> MounterState {
        if self.mounted_port().is_some() {
            MounterState::Mounted
        } else {
            MounterState::Idle
        }
    }

    fn take_cancel(&self) -> bool {
        self.inner.cancel.swap(false, Ordering::SeqCst)
    }

    fn enter_fault(&self, context: &str, e: anyhow::Error) -> BeamlineError {
        let message = format!("{context}: {e:#}");
        error!(device = %self.name(), error = %message, "automounter fault");
        *self.inner.last_fault.lock() = message.clone();
        let _hold = self.emitter().hold();
        self.transition_to(MounterState::Fault);
        self.inner
            .device
            .set_health(Severity::CRITICAL, "fault", Some(&message));
        self.inner.device.set_message(message.clone());
        self.emitter()
            .emit(Event::Mounter(MounterEvent::Failure(message.clone())));
        BeamlineError::Fault(message)
    }

    fn reject(&self, state: MounterState) -> BeamlineError {
        match state {
            MounterState::Fault => BeamlineError::Fault(self.inner.last_fault.lock().clone()),
            state if state.is_busy() => {
                BeamlineError::AutomounterBusy(format!("{} is {}", self.name(), state))
            }
            state => BeamlineError::NotReady {
                device: self.name().to_string(),
                state: state.to_string(),
            },
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Home the arm and probe the ports, bringing the device from `unknown` to `idle`.
    pub async fn prepare(&self) -> AppResult<()> {
        let _guard = {
            self.inner.device.ensure_open()?;
            let _hold = self.emitter().hold();
            match self.state() {
                MounterState::Unknown | MounterState::Idle => {}
                MounterState::Mounted => return Ok(()),
                state => return Err(self.reject(state)),
            }
            let guard = self.inner.device.begin_operation()?;
            self.transition_to(MounterState::Preparing);
            guard
        };

        let _arm = self.inner.arm.lock().await;
        let robot = &self.inner.manipulator;
        let probed = async {
            robot.home().await?;
            robot.inventory().await
        }
        .await;
        match probed {
            Ok(slots) => {
                self.update_store(|store| store.refresh(slots));
                self.transition_to(self.settled_state());
                info!(device = %self.name(), ports = self.slots().len(), "automounter ready");
                Ok(())
            }
            Err(e) => Err(self.enter_fault("prepare failed", e)),
        }
    }

    fn begin_mount(&self, port: &PortId) -> AppResult<MountPlan> {
        self.inner.device.ensure_open()?;
        let _hold = self.emitter().hold();
        let state = self.state();
        if !state.is_ready() {
            return Err(self.reject(state));
        }
        let exchange = {
            let store = self.inner.store.lock();
            let mounted = store.mounted().map(|slot| slot.port.clone());
            if mounted.as_ref() == Some(port) {
                return Ok(MountPlan::AlreadyMounted);
            }
            if store.occupancy(port)? == Occupancy::Empty {
                return Err(BeamlineError::PortEmpty(port.to_string()));
            }
            mounted
        };
        let guard = self.inner.device.begin_operation()?;
        self.inner.cancel.store(false, Ordering::SeqCst);
        self.transition_to(MounterState::Preparing);
        Ok(MountPlan::Load {
            exchange,
            _guard: guard,
        })
    }

    /// Mount the sample stored in `port`.
    ///
    /// If another sample is mounted it is returned to its port first.
    pub async fn mount(&self, port: &str) -> AppResult<MountOutcome> {
        let port = PortId::parse(port)?;
        let (exchange, _guard) = match self.begin_mount(&port)? {
            MountPlan::AlreadyMounted => {
                debug!(device = %self.name(), %port, "already mounted");
                return Ok(MountOutcome::AlreadyMounted(port));
            }
            MountPlan::Load { exchange, _guard: guard } => (exchange, guard),
        };

        let _arm = self.inner.arm.lock().await;
        info!(device = %self.name(), %port, "mount started");
        match self.mount_sequence(&port, exchange.as_ref()).await {
            Ok(outcome) => {
                info!(device = %self.name(), ?outcome, "mount finished");
                Ok(outcome)
            }
            Err(e) => Err(self.enter_fault(&format!("mount {port} failed"), e)),
        }
    }

    async fn mount_sequence(
        &self,
        port: &PortId,
        exchange: Option<&PortId>,
    ) -> anyhow::Result<MountOutcome> {
        let robot = &self.inner.manipulator;

        if let Some(previous) = exchange {
            if self.take_cancel() {
                self.transition_to(MounterState::Mounted);
                return Ok(MountOutcome::Cancelled);
            }
            self.transition_to(MounterState::Dismounting);
            robot.unload_goniometer().await?;
            self.update_store(|store| store.mark_in_transit(previous));
            robot.place(previous).await?;
            self.update_store(|store| store.mark_returned(previous));
        }

        self.transition_to(MounterState::Mounting);
        if self.take_cancel() {
            robot.park().await?;
            self.transition_to(MounterState::Idle);
            return Ok(MountOutcome::Cancelled);
        }

        robot.pick(port).await?;
        self.update_store(|store| store.mark_in_transit(port));
        *self.inner.prefetched.lock() = None;
        if self.take_cancel() {
            warn!(device = %self.name(), %port, "mount cancelled, returning sample");
            robot.place(port).await?;
            self.update_store(|store| store.mark_returned(port));
            robot.park().await?;
            self.transition_to(MounterState::Idle);
            return Ok(MountOutcome::Cancelled);
        }

        robot.load_goniometer().await?;
        self.update_store(|store| store.mark_mounted(port));
        robot.park().await?;
        self.transition_to(MounterState::Mounted);

        Ok(match exchange {
            Some(previous) => MountOutcome::Exchanged {
                returned: previous.clone(),
                mounted: port.clone(),
            },
            None => MountOutcome::Mounted(port.clone()),
        })
    }

    /// Return the mounted sample to its port. Only valid from `mounted`.
    pub async fn dismount(&self) -> AppResult<MountOutcome> {
        let (port, _guard) = {
            self.inner.device.ensure_open()?;
            let _hold = self.emitter().hold();
            let state = self.state();
            if state != MounterState::Mounted {
                return Err(self.reject(state));
            }
            let port = self.mounted_port().ok_or_else(|| BeamlineError::NotReady {
                device: self.name().to_string(),
                state: "no sample mounted".to_string(),
            })?;
            let guard = self.inner.device.begin_operation()?;
            self.inner.cancel.store(false, Ordering::SeqCst);
            self.transition_to(MounterState::Dismounting);
            (port, guard)
        };

        let _arm = self.inner.arm.lock().await;
        info!(device = %self.name(), %port, "dismount started");
        match self.dismount_sequence(&port).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.enter_fault(&format!("dismount {port} failed"), e)),
        }
    }

    async fn dismount_sequence(&self, port: &PortId) -> anyhow::Result<MountOutcome> {
        let robot = &self.inner.manipulator;
        if self.take_cancel() {
            self.transition_to(MounterState::Mounted);
            return Ok(MountOutcome::Cancelled);
        }
        robot.unload_goniometer().await?;
        self.update_store(|store| store.mark_in_transit(port));
        // once the sample is in the gripper, the only safe place for it is its port
        robot.place(port).await?;
        self.update_store(|store| store.mark_returned(port));
        robot.park().await?;
        self.transition_to(MounterState::Idle);
        Ok(MountOutcome::Dismounted(port.clone()))
    }

    /// Pre-position the arm next to `port` without blocking the caller.
    ///
    /// Returns `false` when nothing was started: the port is already prefetched,
    /// or the device is not ready.
    pub fn prefetch(&self, port: &str) -> AppResult<bool> {
        let port = PortId::parse(port)?;
        self.inner.device.ensure_open()?;
        if self.state() == MounterState::Fault {
            return Err(self.reject(MounterState::Fault));
        }
        if !self.state().is_ready() {
            debug!(device = %self.name(), %port, "prefetch skipped, device not ready");
            return Ok(false);
        }
        if self.inner.store.lock().occupancy(&port)? == Occupancy::Empty {
            return Err(BeamlineError::PortEmpty(port.to_string()));
        }
        {
            let mut prefetched = self.inner.prefetched.lock();
            if prefetched.as_ref() == Some(&port) {
                return Ok(false);
            }
            *prefetched = Some(port.clone());
        }

        let mounter = self.clone();
        let handle = tokio::spawn(async move { mounter.prefetch_task(port).await });
        if let Some(previous) = self.inner.prefetch_task.lock().replace(handle) {
            previous.abort();
        }
        Ok(true)
    }

    async fn prefetch_task(&self, port: PortId) {
        let Ok(_arm) = self.inner.arm.try_lock() else {
            debug!(device = %self.name(), %port, "prefetch skipped, arm busy");
            self.forget_prefetch(&port);
            return;
        };
        match self.inner.manipulator.prefetch(&port).await {
            Ok(()) => {
                debug!(device = %self.name(), %port, "prefetched");
                self.inner.device.clear_health("prefetch");
                self.emitter()
                    .emit(Event::Mounter(MounterEvent::Prefetched(port)));
            }
            Err(e) => {
                warn!(device = %self.name(), %port, error = %e, "prefetch failed");
                self.inner.device.set_health(
                    Severity::MINOR,
                    "prefetch",
                    Some(&format!("prefetch {port} failed")),
                );
                self.forget_prefetch(&port);
            }
        }
    }

    fn forget_prefetch(&self, port: &PortId) {
        let mut prefetched = self.inner.prefetched.lock();
        if prefetched.as_ref() == Some(port) {
            *prefetched = None;
        }
    }

    /// Clear `fault` by re-running the homing sequence.
    ///
    /// Homing is retried according to the retry policy. On success the device
    /// settles in `idle` (or `mounted` if a sample is still on the goniometer);
    /// otherwise it stays in `fault` and [`BeamlineError::Fault`] is returned.
    pub async fn recover(&self) -> AppResult<MounterState> {
        let _guard = {
            self.inner.device.ensure_open()?;
            let _hold = self.emitter().hold();
            match self.state() {
                MounterState::Fault => {}
                state if state.is_ready() => return Ok(state),
                state => return Err(self.reject(state)),
            }
            let guard = self.inner.device.begin_operation()?;
            self.transition_to(MounterState::Recovering);
            guard
        };

        let _arm = self.inner.arm.lock().await;
        let robot = Arc::clone(&self.inner.manipulator);
        let name = self.name().to_string();
        let homed = retry_with_policy(&self.inner.retry, "home", |attempt| {
            let robot = Arc::clone(&robot);
            let name = name.clone();
            async move {
                info!(device = %name, attempt, "homing");
                robot.home().await
            }
        })
        .await;

        let probed = match homed {
            Ok(()) => self.inner.manipulator.inventory().await,
            Err(e) => Err(e),
        };
        match probed {
            Ok(slots) => {
                self.update_store(|store| store.refresh(slots));
                let settled = self.settled_state();
                self.transition_to(settled);
                self.inner.device.clear_health("fault");
                self.inner.device.set_message("recovered");
                info!(device = %self.name(), state = %settled, "automounter recovered");
                Ok(settled)
            }
            Err(e) => Err(self.enter_fault("recovery failed", e)),
        }
    }

    /// Request cooperative abort of the current operation.
    ///
    /// Resolves once the arm has reached a safe state (`true`), or `false` if that
    /// did not happen within `timeout`.
    pub async fn cancel(&self, timeout: Duration) -> bool {
        if self.state().is_busy() {
            info!(device = %self.name(), state = %self.state(), "cancel requested");
            self.inner.cancel.store(true, Ordering::SeqCst);
        }
        self.wait(
            "state",
            |value| value.as_mounter_state().map_or(false, |s| !s.is_busy()),
            timeout,
        )
        .await
    }
}

impl Waitable for AutoMounter {
    fn object(&self) -> &Object {
        self.inner.device.object()
    }
}
