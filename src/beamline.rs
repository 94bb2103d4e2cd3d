//! Beamline registry
//!
//! A [`Beamline`] owns every device and engine of one experimental station and
//! resolves them by name. It is an explicit context object: build it once (by hand
//! or with [`Beamline::from_config`]), share it, and call [`Beamline::cleanup`] on
//! shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::automounter::{AutoMounter, PortId};
use crate::config::BeamlineConfig;
use crate::core::StateValue;
use crate::device::Device;
use crate::error::{AppResult, BeamlineError};
use crate::hardware::capabilities::{Counter, Positioner};
use crate::hardware::mock::{MockCounter, MockManipulator, MockMotor};
use crate::scan::BasicScan;
use crate::traits::{Configurable, Pausable};

/// Time a running scan gets to reach a checkpoint during cleanup.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A registered component.
#[derive(Clone, Debug)]
pub enum Entry {
    /// Plain device
    Device(Device),
    /// Motor-like device
    Positioner(Arc<dyn Positioner>),
    /// Detector or scaler channel
    Counter(Arc<dyn Counter>),
    /// Sample changer
    AutoMounter(AutoMounter),
    /// Scan engine
    Scan(BasicScan),
}

impl Entry {
    /// Kind name used in lookup errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Entry::Device(_) => "device",
            Entry::Positioner(_) => "positioner",
            Entry::Counter(_) => "counter",
            Entry::AutoMounter(_) => "automounter",
            Entry::Scan(_) => "scan",
        }
    }

    /// Hardware device behind the entry; engines have none.
    pub fn device(&self) -> Option<&Device> {
        match self {
            Entry::Device(device) => Some(device),
            Entry::Positioner(p) => Some(p.device()),
            Entry::Counter(c) => Some(c.device()),
            Entry::AutoMounter(mounter) => Some(mounter.device()),
            Entry::Scan(_) => None,
        }
    }

    fn states(&self) -> BTreeMap<String, StateValue> {
        match self {
            Entry::Scan(scan) => scan.engine().object().snapshot(),
            other => other
                .device()
                .map(|d| d.object().snapshot())
                .unwrap_or_default(),
        }
    }
}

/// Composition root of one station.
pub struct Beamline {
    name: String,
    entries: Vec<(String, Entry)>,
}

impl Beamline {
    /// Empty registry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Build a simulated station from `config`.
    ///
    /// Motors, counters and the automounter are backed by the mock hardware;
    /// scans are bound to them by name and configured with their start-up spec.
    pub fn from_config(config: &BeamlineConfig) -> AppResult<Self> {
        config.validate()?;
        let mut beamline = Self::new(&config.beamline.name);

        for motor in &config.motors {
            let mock = MockMotor::with_speed(&motor.name, motor.speed).at(motor.position);
            mock.device().set_enabled(motor.enabled);
            beamline.register_positioner(Arc::new(mock))?;
        }
        for counter in &config.counters {
            let mock = MockCounter::with_rate(&counter.name, counter.rate);
            mock.device().set_enabled(counter.enabled);
            beamline.register_counter(Arc::new(mock))?;
        }
        if let Some(mounter) = &config.automounter {
            let mut robot = MockManipulator::new(mounter.layout()?).with_step_delay(mounter.step_delay);
            for sample in &mounter.samples {
                let port = PortId::parse(sample)?;
                let barcode = format!("CLS{}{:02}", port.puck(), port.position());
                robot = robot.with_sample(port, Some(&barcode));
            }
            let automounter =
                AutoMounter::with_retry_policy(&mounter.name, Arc::new(robot), mounter.retry_policy());
            beamline.register_automounter(automounter)?;
        }
        for scan in &config.scans {
            let positioners = scan
                .positioners
                .iter()
                .map(|name| beamline.positioner(name))
                .collect::<AppResult<Vec<_>>>()?;
            let counters = scan
                .counters
                .iter()
                .map(|name| beamline.counter(name))
                .collect::<AppResult<Vec<_>>>()?;
            let engine = match &scan.reference {
                Some(reference) => BasicScan::normalized(
                    &scan.name,
                    positioners,
                    counters,
                    beamline.counter(reference)?,
                )?,
                None => BasicScan::new(&scan.name, positioners, counters)?,
            };
            if let Some(spec) = &scan.spec {
                engine.configure(spec.clone())?;
            }
            beamline.register_scan(engine)?;
        }

        beamline.validate()?;
        info!(beamline = %beamline.name, entries = beamline.len(), "beamline built");
        Ok(beamline)
    }

    /// Station name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn register(&mut self, name: &str, entry: Entry) -> AppResult<()> {
        if self.entries.iter().any(|(existing, _)| existing == name) {
            return Err(BeamlineError::Configuration(format!(
                "'{name}' is already registered"
            )));
        }
        info!(beamline = %self.name, name, kind = entry.kind(), "registered");
        self.entries.push((name.to_string(), entry));
        Ok(())
    }

    /// Register a plain device under its own name.
    pub fn register_device(&mut self, device: Device) -> AppResult<()> {
        let name = device.name().to_string();
        self.register(&name, Entry::Device(device))
    }

    /// Register a motor-like backend.
    pub fn register_positioner(&mut self, positioner: Arc<dyn Positioner>) -> AppResult<()> {
        let name = positioner.device().name().to_string();
        self.register(&name, Entry::Positioner(positioner))
    }

    /// Register a detector/counter backend.
    pub fn register_counter(&mut self, counter: Arc<dyn Counter>) -> AppResult<()> {
        let name = counter.device().name().to_string();
        self.register(&name, Entry::Counter(counter))
    }

    /// Register a sample changer.
    pub fn register_automounter(&mut self, automounter: AutoMounter) -> AppResult<()> {
        let name = automounter.name().to_string();
        self.register(&name, Entry::AutoMounter(automounter))
    }

    /// Register a scan engine. Its collaborators should already be registered.
    pub fn register_scan(&mut self, scan: BasicScan) -> AppResult<()> {
        let name = scan.name().to_string();
        self.register(&name, Entry::Scan(scan))
    }

    /// Entry by name, whatever its kind.
    pub fn get(&self, name: &str) -> AppResult<&Entry> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, entry)| entry)
            .ok_or_else(|| BeamlineError::NotFound {
                kind: "entry",
                name: name.to_string(),
            })
    }

    fn lookup<T>(
        &self,
        kind: &'static str,
        name: &str,
        pick: impl FnOnce(&Entry) -> Option<T>,
    ) -> AppResult<T> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .and_then(|(_, entry)| pick(entry))
            .ok_or_else(|| BeamlineError::NotFound {
                kind,
                name: name.to_string(),
            })
    }

    /// Device behind any hardware entry (plain device, positioner, counter or
    /// automounter).
    pub fn device(&self, name: &str) -> AppResult<Device> {
        self.lookup("device", name, |entry| entry.device().cloned())
    }

    /// Positioner registered as `name`.
    pub fn positioner(&self, name: &str) -> AppResult<Arc<dyn Positioner>> {
        self.lookup("positioner", name, |entry| match entry {
            Entry::Positioner(p) => Some(Arc::clone(p)),
            _ => None,
        })
    }

    /// Counter registered as `name`.
    pub fn counter(&self, name: &str) -> AppResult<Arc<dyn Counter>> {
        self.lookup("counter", name, |entry| match entry {
            Entry::Counter(c) => Some(Arc::clone(c)),
            _ => None,
        })
    }

    /// Automounter registered as `name`.
    pub fn automounter(&self, name: &str) -> AppResult<AutoMounter> {
        self.lookup("automounter", name, |entry| match entry {
            Entry::AutoMounter(m) => Some(m.clone()),
            _ => None,
        })
    }

    /// Scan engine registered as `name`.
    pub fn scan(&self, name: &str) -> AppResult<BasicScan> {
        self.lookup("scan", name, |entry| match entry {
            Entry::Scan(s) => Some(s.clone()),
            _ => None,
        })
    }

    /// Check that every device is open and every scan's collaborators are
    /// registered here.
    pub fn validate(&self) -> AppResult<()> {
        for (name, entry) in &self.entries {
            if let Some(device) = entry.device() {
                device.ensure_open()?;
            }
            if let Entry::Scan(scan) = entry {
                for positioner in scan.positioners() {
                    if self.positioner(&positioner).is_err() {
                        return Err(BeamlineError::Configuration(format!(
                            "scan '{name}' drives unregistered positioner '{positioner}'"
                        )));
                    }
                }
                for counter in scan.counters().into_iter().chain(scan.reference()) {
                    if self.counter(&counter).is_err() {
                        return Err(BeamlineError::Configuration(format!(
                            "scan '{name}' reads unregistered counter '{counter}'"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// State snapshot of every entry, keyed by name.
    pub fn status(&self) -> BTreeMap<String, BTreeMap<String, StateValue>> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.states()))
            .collect()
    }

    /// Stop engines and clean up devices in reverse registration order.
    ///
    /// Every entry is visited even if an earlier one fails; all failures are
    /// reported together.
    pub async fn cleanup(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        for (name, entry) in self.entries.iter().rev() {
            match entry {
                Entry::Scan(scan) => {
                    if scan.is_busy() {
                        scan.stop();
                        if !scan.wait_finished(SHUTDOWN_GRACE).await {
                            warn!(scan = %name, "scan did not stop before shutdown");
                        }
                    }
                }
                other => {
                    if let Some(device) = other.device() {
                        if let Err(e) = device.cleanup() {
                            warn!(device = %name, error = %e, "cleanup failed");
                            errors.push(e);
                        }
                    }
                }
            }
        }
        info!(beamline = %self.name, failures = errors.len(), "beamline shut down");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BeamlineError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanSpec;

    fn station() -> Beamline {
        let mut beamline = Beamline::new("test");
        let motor: Arc<dyn Positioner> = Arc::new(MockMotor::new("energy"));
        let counter: Arc<dyn Counter> = Arc::new(MockCounter::new("i0"));
        beamline.register_positioner(Arc::clone(&motor)).unwrap();
        beamline.register_counter(Arc::clone(&counter)).unwrap();
        beamline
            .register_scan(BasicScan::new("energy_scan", vec![motor], vec![counter]).unwrap())
            .unwrap();
        beamline
    }

    #[test]
    fn test_lookup_by_kind() {
        let beamline = station();
        assert_eq!(beamline.names(), vec!["energy", "i0", "energy_scan"]);
        assert!(beamline.positioner("energy").is_ok());
        assert_eq!(beamline.device("i0").unwrap().name(), "i0");
        assert!(matches!(
            beamline.counter("energy"),
            Err(BeamlineError::NotFound { kind: "counter", .. })
        ));
        assert!(matches!(
            beamline.automounter("automounter"),
            Err(BeamlineError::NotFound { .. })
        ));
        assert!(beamline.device("energy_scan").is_err());
        assert_eq!(beamline.get("energy_scan").unwrap().kind(), "scan");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut beamline = station();
        let err = beamline
            .register_device(Device::new("energy"))
            .unwrap_err();
        assert!(matches!(err, BeamlineError::Configuration(_)));
        assert_eq!(beamline.len(), 3);
    }

    #[test]
    fn test_validate_catches_unregistered_collaborator() {
        let mut beamline = Beamline::new("test");
        let motor: Arc<dyn Positioner> = Arc::new(MockMotor::new("stray"));
        beamline
            .register_scan(BasicScan::new("scan", vec![motor], vec![]).unwrap())
            .unwrap();
        assert!(matches!(
            beamline.validate(),
            Err(BeamlineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_closes_devices() {
        let beamline = station();
        let scan = beamline.scan("energy_scan").unwrap();
        scan.configure(ScanSpec::new(0.0, 1.0, 2, Duration::from_millis(1)))
            .unwrap();
        beamline.validate().unwrap();

        beamline.cleanup().await.unwrap();
        assert!(beamline.device("energy").unwrap().is_closed());
        assert!(beamline.device("i0").unwrap().is_closed());
        assert!(matches!(
            beamline.validate(),
            Err(BeamlineError::ClosedDevice(_))
        ));
        // second cleanup is harmless
        beamline.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_reports_release_failures() {
        let mut beamline = Beamline::new("test");
        let flaky = Device::new("shutter");
        flaky.on_release(|| Err(anyhow::anyhow!("interlock stuck")));
        beamline.register_device(flaky).unwrap();
        beamline
            .register_positioner(Arc::new(MockMotor::new("x")))
            .unwrap();

        let err = beamline.cleanup().await.unwrap_err();
        match err {
            BeamlineError::ShutdownFailed(errors) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected error {other}"),
        }
        // the motor registered later was still cleaned up
        assert!(beamline.device("x").unwrap().is_closed());
    }
}
