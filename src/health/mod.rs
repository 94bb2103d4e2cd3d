//! Device health tracking
//!
//! Each device keeps a [`HealthManager`] registry of active problems, keyed by a
//! context string. The aggregate severity is the bitwise OR of all registered
//! problems and maps onto the three-level [`Health`] exposed to observers.
//!
//! | Code | Meaning                                         | Health     |
//! |------|-------------------------------------------------|------------|
//! | 0    | no problems                                     | `ok`       |
//! | 1    | MINOR, no impact on functionality               | `degraded` |
//! | 2    | MARGINAL, attention may soon be needed          | `degraded` |
//! | 4    | SERIOUS, functionality impacted, recoverable    | `degraded` |
//! | 8    | CRITICAL, functionality broken                  | `faulted`  |
//! | 16   | DISABLED, manually disabled                     | `faulted`  |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Severity bit code of a single health problem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Severity(u32);

impl Severity {
    /// No problem
    pub const GOOD: Severity = Severity(0);
    /// No impact on functionality
    pub const MINOR: Severity = Severity(1);
    /// No immediate impact, attention may soon be needed
    pub const MARGINAL: Severity = Severity(2);
    /// Functionality impacted but recovery is possible
    pub const SERIOUS: Severity = Severity(4);
    /// Functionality broken, recovery is not possible without intervention
    pub const CRITICAL: Severity = Severity(8);
    /// Manually disabled
    pub const DISABLED: Severity = Severity(16);

    /// Raw bit code.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if any bit of `other` is set.
    pub fn contains(self, other: Severity) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Severity {
    type Output = Severity;

    fn bitor(self, rhs: Severity) -> Severity {
        Severity(self.0 | rhs.0)
    }
}

/// Aggregated health level of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// No registered problems
    #[default]
    Ok,
    /// Working with reduced functionality
    Degraded,
    /// Not usable
    Faulted,
}

impl Health {
    /// Map an aggregate severity onto a health level.
    pub fn from_severity(severity: Severity) -> Self {
        if severity.contains(Severity::CRITICAL | Severity::DISABLED) {
            Health::Faulted
        } else if severity == Severity::GOOD {
            Health::Ok
        } else {
            Health::Degraded
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Health::Ok => "ok",
            Health::Degraded => "degraded",
            Health::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Snapshot of the aggregated health.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// OR of all registered severities
    pub severity: Severity,
    /// Level derived from `severity`
    pub health: Health,
    /// Messages of all registered problems, ordered by context
    pub message: String,
}

/// Registry of active health problems.
///
/// Only one entry per context is kept; registering a context again replaces it.
#[derive(Clone, Debug, Default)]
pub struct HealthManager {
    problems: BTreeMap<String, (Severity, Option<String>)>,
}

impl HealthManager {
    /// Create an empty registry (healthy).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a problem. `Severity::GOOD` clears the context instead.
    pub fn add(&mut self, severity: Severity, context: &str, message: Option<&str>) {
        if severity == Severity::GOOD {
            self.remove(context);
            return;
        }
        self.problems.insert(
            context.to_string(),
            (severity, message.map(str::to_string)),
        );
    }

    /// Remove every problem registered under `context`.
    pub fn remove(&mut self, context: &str) -> bool {
        self.problems.remove(context).is_some()
    }

    /// True if a problem is registered under `context`.
    pub fn contains(&self, context: &str) -> bool {
        self.problems.contains_key(context)
    }

    /// Aggregate all registered problems.
    pub fn report(&self) -> HealthReport {
        let severity = self
            .problems
            .values()
            .fold(Severity::GOOD, |acc, (sev, _)| acc | *sev);
        let message = self
            .problems
            .iter()
            .map(|(context, (_, msg))| msg.clone().unwrap_or_else(|| context.clone()))
            .collect::<Vec<_>>()
            .join(" ");
        HealthReport {
            severity,
            health: Health::from_severity(severity),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_manager_is_ok() {
        let report = HealthManager::new().report();
        assert_eq!(report.health, Health::Ok);
        assert_eq!(report.severity, Severity::GOOD);
        assert!(report.message.is_empty());
    }

    #[test]
    fn test_severity_aggregation() {
        let mut mgr = HealthManager::new();
        mgr.add(Severity::MINOR, "temperature", Some("too warm"));
        assert_eq!(mgr.report().health, Health::Degraded);

        mgr.add(Severity::CRITICAL, "link", None);
        let report = mgr.report();
        assert_eq!(report.health, Health::Faulted);
        assert_eq!(report.severity.bits(), 9);
        assert_eq!(report.message, "link too warm");

        mgr.remove("link");
        assert_eq!(mgr.report().health, Health::Degraded);
        mgr.add(Severity::GOOD, "temperature", None);
        assert_eq!(mgr.report().health, Health::Ok);
    }

    #[test]
    fn test_disabled_is_faulted() {
        assert_eq!(Health::from_severity(Severity::DISABLED), Health::Faulted);
        assert_eq!(Health::from_severity(Severity::SERIOUS), Health::Degraded);
    }
}
