//! Beamline configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `BEAMLINE_`, `__` separating nested keys
//!
//! ```text
//! BEAMLINE_BEAMLINE__LOG_LEVEL=debug
//! BEAMLINE_STORAGE__OUTPUT_DIR=/data/cmcf
//! ```
//!
//! Durations are written in humantime form (`"20ms"`, `"30s"`).
//!
//! # Example
//!
//! ```toml
//! [beamline]
//! name = "CMCF-BM"
//! log_level = "info"
//!
//! [storage]
//! output_dir = "data"
//!
//! [[motors]]
//! name = "energy"
//! speed = 50.0
//!
//! [[counters]]
//! name = "i0"
//! rate = 12000.0
//!
//! [automounter]
//! pucks = ["A", "B"]
//! ports_per_puck = 16
//! samples = ["A1", "A3", "B2"]
//!
//! [[scans]]
//! name = "energy_scan"
//! positioners = ["energy"]
//! counters = ["i0"]
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::automounter::slots::PortId;
use crate::error::{AppResult, BeamlineError};
use crate::error_recovery::RetryPolicy;
use crate::scan::ScanSpec;

/// Fallback configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/beamline.toml";

/// Top-level beamline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamlineConfig {
    /// Station settings
    pub beamline: BeamlineSettings,
    /// Scan output settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Simulated positioners
    #[serde(default)]
    pub motors: Vec<MotorConfig>,
    /// Simulated counters
    #[serde(default)]
    pub counters: Vec<CounterConfig>,
    /// Simulated sample changer
    #[serde(default)]
    pub automounter: Option<AutoMounterConfig>,
    /// Scan engines and their collaborators
    #[serde(default)]
    pub scans: Vec<ScanConfig>,
}

/// Station-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamlineSettings {
    /// Station name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where scan records go
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for scan records
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

/// Simulated motor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorConfig {
    /// Unique device name
    pub name: String,
    /// Speed in units per second
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Initial position
    #[serde(default)]
    pub position: f64,
    /// Whether the motor accepts moves
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Simulated counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Unique device name
    pub name: String,
    /// Count rate per second
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Whether the counter accepts counts
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Simulated automounter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoMounterConfig {
    /// Device name
    #[serde(default = "default_automounter_name")]
    pub name: String,
    /// Puck letters
    #[serde(default = "default_pucks")]
    pub pucks: Vec<String>,
    /// Ports in each puck
    #[serde(default = "default_ports_per_puck")]
    pub ports_per_puck: u8,
    /// Ports loaded with a sample at start-up
    #[serde(default)]
    pub samples: Vec<String>,
    /// Duration of every mechanical step
    #[serde(default = "default_step_delay", with = "humantime_serde")]
    pub step_delay: Duration,
    /// Attempts of the homing sequence during `recover`
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Pause between recovery attempts
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl AutoMounterConfig {
    /// Every port of every puck, in puck order.
    pub fn layout(&self) -> AppResult<Vec<PortId>> {
        self.pucks
            .iter()
            .flat_map(|puck| (1..=self.ports_per_puck).map(move |pos| format!("{puck}{pos}")))
            .map(|text| PortId::parse(&text))
            .collect()
    }

    /// Recovery policy from the configured attempts and backoff.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            backoff_delay: self.retry_backoff,
        }
    }
}

/// Scan engine definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Engine name
    pub name: String,
    /// Motor names, primary axis first
    pub positioners: Vec<String>,
    /// Counter names
    #[serde(default)]
    pub counters: Vec<String>,
    /// Counter every reading is normalized by
    #[serde(default)]
    pub reference: Option<String>,
    /// Spec applied at start-up
    #[serde(default)]
    pub spec: Option<ScanSpec>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_speed() -> f64 {
    100.0
}

fn default_rate() -> f64 {
    1000.0
}

fn default_enabled() -> bool {
    true
}

fn default_automounter_name() -> String {
    "automounter".to_string()
}

fn default_pucks() -> Vec<String> {
    vec!["A".to_string(), "B".to_string()]
}

fn default_ports_per_puck() -> u8 {
    16
}

fn default_step_delay() -> Duration {
    Duration::from_millis(20)
}

fn default_retry_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}

fn default_retry_backoff() -> Duration {
    RetryPolicy::default().backoff_delay
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl BeamlineConfig {
    /// Load from the per-user config file if it exists, else from
    /// [`DEFAULT_CONFIG_PATH`].
    pub fn load() -> AppResult<Self> {
        let path = Self::user_config_path()
            .filter(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(path)
    }

    /// `<config dir>/rust_beamline/beamline.toml`, e.g.
    /// `~/.config/rust_beamline/beamline.toml` on Linux.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rust_beamline").join("beamline.toml"))
    }

    /// Load a specific file merged with `BEAMLINE_` environment overrides, then
    /// validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Parse TOML text merged with environment overrides, then validate.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        Self::extract(Figment::new().merge(Toml::string(text)))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let config: Self = figment
            .merge(Env::prefixed("BEAMLINE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid
    /// - Device and scan names are unique and non-empty
    /// - Motor speeds and counter rates are positive
    /// - Automounter pucks form valid port ids and samples sit in known ports
    /// - Scans reference configured motors and counters and carry valid specs
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(BeamlineError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.beamline.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.beamline.log_level,
                valid_levels.join(", ")
            ));
        }

        let mut names = HashSet::new();
        let all_names = self
            .motors
            .iter()
            .map(|m| &m.name)
            .chain(self.counters.iter().map(|c| &c.name))
            .chain(self.automounter.iter().map(|a| &a.name))
            .chain(self.scans.iter().map(|s| &s.name));
        for name in all_names {
            if name.trim().is_empty() {
                return invalid("Empty device or scan name".into());
            }
            if !names.insert(name.as_str()) {
                return invalid(format!("Duplicate name: '{name}'"));
            }
        }

        for motor in &self.motors {
            if !(motor.speed.is_finite() && motor.speed > 0.0) {
                return invalid(format!(
                    "Motor '{}': speed {} must be positive",
                    motor.name, motor.speed
                ));
            }
            if !motor.position.is_finite() {
                return invalid(format!("Motor '{}': position is not finite", motor.name));
            }
        }
        for counter in &self.counters {
            if !(counter.rate.is_finite() && counter.rate >= 0.0) {
                return invalid(format!(
                    "Counter '{}': rate {} must not be negative",
                    counter.name, counter.rate
                ));
            }
        }

        if let Some(mounter) = &self.automounter {
            self.validate_automounter(mounter)?;
        }
        for scan in &self.scans {
            self.validate_scan(scan)?;
        }
        Ok(())
    }

    fn validate_automounter(&self, mounter: &AutoMounterConfig) -> AppResult<()> {
        if mounter.pucks.is_empty() || mounter.ports_per_puck == 0 || mounter.ports_per_puck > 99 {
            return Err(BeamlineError::Configuration(format!(
                "Automounter '{}': needs at least one puck and 1-99 ports per puck",
                mounter.name
            )));
        }
        let layout = mounter.layout().map_err(|e| {
            BeamlineError::Configuration(format!("Automounter '{}': {}", mounter.name, e))
        })?;
        for sample in &mounter.samples {
            let known = PortId::parse(sample).map(|port| layout.contains(&port));
            if !matches!(known, Ok(true)) {
                return Err(BeamlineError::Configuration(format!(
                    "Automounter '{}': sample port '{}' is not in the dewar",
                    mounter.name, sample
                )));
            }
        }
        if mounter.retry_attempts == 0 {
            return Err(BeamlineError::Configuration(format!(
                "Automounter '{}': retry_attempts must be at least 1",
                mounter.name
            )));
        }
        Ok(())
    }

    fn validate_scan(&self, scan: &ScanConfig) -> AppResult<()> {
        if scan.positioners.is_empty() {
            return Err(BeamlineError::Configuration(format!(
                "Scan '{}' has no positioners",
                scan.name
            )));
        }
        for positioner in &scan.positioners {
            if !self.motors.iter().any(|m| &m.name == positioner) {
                return Err(BeamlineError::Configuration(format!(
                    "Scan '{}' references unknown motor '{}'",
                    scan.name, positioner
                )));
            }
        }
        for counter in scan.counters.iter().chain(&scan.reference) {
            if !self.counters.iter().any(|c| &c.name == counter) {
                return Err(BeamlineError::Configuration(format!(
                    "Scan '{}' references unknown counter '{}'",
                    scan.name, counter
                )));
            }
        }
        if let Some(spec) = &scan.spec {
            spec.validate().map_err(|e| {
                BeamlineError::Configuration(format!("Scan '{}': {}", scan.name, e))
            })?;
            if spec.axis_count() != scan.positioners.len() {
                return Err(BeamlineError::Configuration(format!(
                    "Scan '{}': {} axes for {} positioners",
                    scan.name,
                    spec.axis_count(),
                    scan.positioners.len()
                )));
            }
        }
        Ok(())
    }
}
