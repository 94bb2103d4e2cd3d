//! Mock Hardware Implementations
//!
//! Simulated backends for running the beamline without physical hardware.
//! All mocks use async-safe timing (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockMotor` - positioner that moves at a configurable speed
//! - `MockCounter` - counter returning a noisy rate times the dwell time
//! - `MockManipulator` - sample-exchange robot with per-step fault injection
//!
//! # Performance Characteristics
//!
//! - MockMotor: 100 units/sec by default, position published every 5ms
//! - MockCounter: blocks for exactly the dwell time
//! - MockManipulator: 20ms per mechanical step by default

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::automounter::slots::{PortId, Slot};
use crate::device::{Device, Feature, OptionSpec};
use crate::hardware::capabilities::{Counter, Manipulator, Positioner};

/// Interval between published positions of a moving mock motor.
const MOTION_TICK: Duration = Duration::from_millis(5);

// =============================================================================
// MockMotor - Simulated Positioner
// =============================================================================

/// Mock motor with realistic timing.
///
/// A move runs in its own task, publishing `position` every tick and holding the
/// device `busy` until the target is reached. The `speed` option (units/sec) may
/// be changed through the device configuration.
///
/// # Example
///
/// ```rust,ignore
/// let motor = MockMotor::with_speed("energy", 50.0);
/// motor.move_to(10.0).await?; // returns at once, the move takes ~200ms
/// motor.device().wait_while("busy", &[true.into()], Duration::from_secs(1)).await;
/// ```
pub struct MockMotor {
    device: Device,
    position: Arc<Mutex<f64>>,
    speed: f64,
    motion: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MockMotor {
    /// Create a motor at 0.0 moving at 100 units/sec.
    pub fn new(name: &str) -> Self {
        Self::with_speed(name, 100.0)
    }

    /// Create a motor with a custom speed in units/sec.
    pub fn with_speed(name: &str, speed: f64) -> Self {
        let device = Device::new(name);
        device.add_feature(Feature::Positioner);
        device.object().declare("position", 0.0);
        device.object().declare("target", 0.0);
        if let Err(e) = device.declare_options(vec![OptionSpec::float("speed", 1e-3, 1e6)]) {
            warn!(device = %name, error = %e, "speed option unavailable");
        }

        let motion: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        let pending = Arc::clone(&motion);
        device.on_release(move || {
            if let Some(handle) = pending.lock().take() {
                handle.abort();
            }
            Ok(())
        });
        device.set_active(true);

        Self {
            device,
            position: Arc::new(Mutex::new(0.0)),
            speed,
            motion,
        }
    }

    /// Place the motor at `position` without moving.
    pub fn at(self, position: f64) -> Self {
        *self.position.lock() = position;
        self.device.object().declare("position", position);
        self.device.object().declare("target", position);
        self
    }

    fn speed(&self) -> f64 {
        self.device
            .option("speed")
            .and_then(|v| v.as_f64())
            .unwrap_or(self.speed)
    }

    fn halt(&self) {
        if let Some(handle) = self.motion.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Positioner for MockMotor {
    fn device(&self) -> &Device {
        &self.device
    }

    async fn move_to(&self, target: f64) -> Result<()> {
        self.device.ensure_open()?;
        if !self.device.is_enabled() {
            bail!("{} is disabled", self.device.name());
        }
        if !target.is_finite() {
            bail!("{}: invalid target {}", self.device.name(), target);
        }

        self.halt();
        let guard = self.device.begin_operation()?;
        let step = self.speed() * MOTION_TICK.as_secs_f64();
        self.device.object().set_state("target", target);
        debug!(device = %self.device.name(), target, "move started");

        let device = self.device.clone();
        let position = Arc::clone(&self.position);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            loop {
                let current = *position.lock();
                let remaining = target - current;
                let next = if remaining.abs() <= step {
                    target
                } else {
                    current + step.copysign(remaining)
                };
                *position.lock() = next;
                device.object().set_state("position", next);
                if next == target {
                    break;
                }
                sleep(MOTION_TICK).await;
            }
            debug!(device = %device.name(), target, "move complete");
        });
        *self.motion.lock() = Some(handle);
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.lock())
    }

    async fn stop(&self) -> Result<()> {
        self.halt();
        Ok(())
    }
}

// =============================================================================
// MockCounter - Simulated Counter
// =============================================================================

/// Mock counter returning `rate * dwell` with 1% noise.
pub struct MockCounter {
    device: Device,
    rate: f64,
    failures: AtomicU32,
}

impl MockCounter {
    /// Counter with a rate of 1000 counts/sec.
    pub fn new(name: &str) -> Self {
        Self::with_rate(name, 1000.0)
    }

    /// Counter with a custom rate in counts/sec.
    pub fn with_rate(name: &str, rate: f64) -> Self {
        let device = Device::new(name);
        device.add_feature(Feature::Counter);
        device.object().declare("value", 0.0);
        device.set_active(true);
        Self {
            device,
            rate,
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` readouts fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Counter for MockCounter {
    fn device(&self) -> &Device {
        &self.device
    }

    async fn count(&self, dwell: Duration) -> Result<f64> {
        let _guard = self.device.begin_operation()?;
        sleep(dwell).await;
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("{}: readout failed", self.device.name());
        }
        let noise: f64 = rand::thread_rng().gen_range(-0.01..0.01);
        let value = self.rate * dwell.as_secs_f64() * (1.0 + noise);
        self.device.object().set_state("value", value);
        Ok(value)
    }
}

// =============================================================================
// MockManipulator - Simulated Sample-Exchange Robot
// =============================================================================

/// Mechanical steps of the mock robot, used for fault injection and history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RobotStep {
    /// Homing sequence
    Home,
    /// Port to gripper
    Pick,
    /// Gripper to port
    Place,
    /// Gripper to goniometer
    Load,
    /// Goniometer to gripper
    Unload,
    /// Move to rest position
    Park,
    /// Pre-position next to a port
    Prefetch,
    /// Probe all ports
    Inventory,
}

type Sample = (PortId, Option<String>);

#[derive(Default)]
struct RobotState {
    layout: Vec<PortId>,
    /// Ports currently holding a sample, with its barcode
    samples: BTreeMap<PortId, Option<String>>,
    gripper: Option<Sample>,
    goniometer: Option<Sample>,
    prefetched: Option<PortId>,
    faults: HashMap<RobotStep, u32>,
    history: Vec<RobotStep>,
}

/// Mock sample-exchange robot.
///
/// Tracks where every sample physically is (port, gripper or goniometer) and
/// rejects impossible actions, e.g. picking from an empty port.
pub struct MockManipulator {
    state: Mutex<RobotState>,
    step_delay: Duration,
}

impl MockManipulator {
    /// Robot serving the given ports, all empty.
    pub fn new(layout: impl IntoIterator<Item = PortId>) -> Self {
        Self {
            state: Mutex::new(RobotState {
                layout: layout.into_iter().collect(),
                ..RobotState::default()
            }),
            step_delay: Duration::from_millis(20),
        }
    }

    /// Two pucks `A` and `B` of 16 ports with samples in the odd positions.
    pub fn simulated() -> Self {
        let layout: Vec<PortId> = ["A", "B"]
            .iter()
            .flat_map(|puck| (1..=16).map(move |pos| format!("{puck}{pos}")))
            .filter_map(|text| PortId::parse(&text).ok())
            .collect();
        let robot = Self::new(layout.clone());
        {
            let mut state = robot.state.lock();
            for port in layout.into_iter().filter(|p| p.position() % 2 == 1) {
                let barcode = format!("CLS{}{:02}", port.puck(), port.position());
                state.samples.insert(port, Some(barcode));
            }
        }
        robot
    }

    /// Put a sample in `port`.
    pub fn with_sample(self, port: PortId, barcode: Option<&str>) -> Self {
        self.state
            .lock()
            .samples
            .insert(port, barcode.map(str::to_string));
        self
    }

    /// Duration of every mechanical step.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Make the next `count` executions of `step` fail.
    pub fn inject_fault(&self, step: RobotStep, count: u32) {
        self.state.lock().faults.insert(step, count);
    }

    /// Steps attempted so far, in order.
    pub fn history(&self) -> Vec<RobotStep> {
        self.state.lock().history.clone()
    }

    /// Number of attempts of `step`.
    pub fn attempts(&self, step: RobotStep) -> usize {
        self.state
            .lock()
            .history
            .iter()
            .filter(|s| **s == step)
            .count()
    }

    /// Port of the sample on the goniometer.
    pub fn on_goniometer(&self) -> Option<PortId> {
        self.state.lock().goniometer.as_ref().map(|(p, _)| p.clone())
    }

    /// True if the gripper is empty.
    pub fn gripper_empty(&self) -> bool {
        self.state.lock().gripper.is_none()
    }

    /// True if `port` physically holds a sample.
    pub fn holds_sample(&self, port: &PortId) -> bool {
        self.state.lock().samples.contains_key(port)
    }

    /// Port the arm was last pre-positioned at.
    pub fn prefetched(&self) -> Option<PortId> {
        self.state.lock().prefetched.clone()
    }

    async fn step(&self, step: RobotStep) -> Result<()> {
        sleep(self.step_delay).await;
        let mut state = self.state.lock();
        state.history.push(step);
        if let Some(remaining) = state.faults.get_mut(&step) {
            if *remaining > 0 {
                *remaining -= 1;
                bail!("simulated {step:?} fault");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Manipulator for MockManipulator {
    async fn home(&self) -> Result<()> {
        self.step(RobotStep::Home).await?;
        self.state.lock().prefetched = None;
        Ok(())
    }

    async fn pick(&self, port: &PortId) -> Result<()> {
        self.step(RobotStep::Pick).await?;
        let mut state = self.state.lock();
        if state.gripper.is_some() {
            bail!("gripper already holds a sample");
        }
        let barcode = state
            .samples
            .remove(port)
            .ok_or_else(|| anyhow!("no sample in port {port}"))?;
        state.gripper = Some((port.clone(), barcode));
        state.prefetched = None;
        Ok(())
    }

    async fn place(&self, port: &PortId) -> Result<()> {
        self.step(RobotStep::Place).await?;
        let mut state = self.state.lock();
        if state.samples.contains_key(port) {
            bail!("port {port} is already occupied");
        }
        let (_, barcode) = state
            .gripper
            .take()
            .ok_or_else(|| anyhow!("gripper is empty"))?;
        state.samples.insert(port.clone(), barcode);
        Ok(())
    }

    async fn load_goniometer(&self) -> Result<()> {
        self.step(RobotStep::Load).await?;
        let mut state = self.state.lock();
        if state.goniometer.is_some() {
            bail!("goniometer already holds a sample");
        }
        let sample = state
            .gripper
            .take()
            .ok_or_else(|| anyhow!("gripper is empty"))?;
        state.goniometer = Some(sample);
        Ok(())
    }

    async fn unload_goniometer(&self) -> Result<()> {
        self.step(RobotStep::Unload).await?;
        let mut state = self.state.lock();
        if state.gripper.is_some() {
            bail!("gripper already holds a sample");
        }
        let sample = state
            .goniometer
            .take()
            .ok_or_else(|| anyhow!("goniometer is empty"))?;
        state.gripper = Some(sample);
        Ok(())
    }

    async fn park(&self) -> Result<()> {
        self.step(RobotStep::Park).await
    }

    async fn prefetch(&self, port: &PortId) -> Result<()> {
        self.step(RobotStep::Prefetch).await?;
        self.state.lock().prefetched = Some(port.clone());
        Ok(())
    }

    async fn inventory(&self) -> Result<Vec<Slot>> {
        self.step(RobotStep::Inventory).await?;
        let state = self.state.lock();
        Ok(state
            .layout
            .iter()
            .map(|port| match state.samples.get(port) {
                Some(barcode) => Slot::occupied(port.clone(), barcode.clone()),
                None => Slot::empty(port.clone()),
            })
            .collect())
    }
}
