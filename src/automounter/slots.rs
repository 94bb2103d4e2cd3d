//! Sample storage inventory
//!
//! Ports are addressed by puck letter(s) and position, e.g. `A1` or `BC12`. The
//! [`SampleStore`] is the automounter's view of which ports hold samples and which
//! sample currently sits on the goniometer.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{AppResult, BeamlineError};

#[allow(clippy::expect_used)]
static PORT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z]{1,2})(\d{1,2})$").expect("port pattern compiles"));

/// Validated port address.
///
/// Ordering is by puck, then numeric position, so `A2` sorts before `A10`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortId {
    puck: String,
    position: u8,
}

impl PortId {
    /// Parse and validate a port address.
    pub fn parse(text: &str) -> AppResult<Self> {
        let caps = PORT_PATTERN
            .captures(text)
            .ok_or_else(|| BeamlineError::InvalidPort(text.to_string()))?;
        let position = caps[2]
            .parse::<u8>()
            .map_err(|_| BeamlineError::InvalidPort(text.to_string()))?;
        if position == 0 {
            return Err(BeamlineError::InvalidPort(text.to_string()));
        }
        Ok(Self {
            puck: caps[1].to_string(),
            position,
        })
    }

    /// Puck letters.
    pub fn puck(&self) -> &str {
        &self.puck
    }

    /// Position inside the puck, starting at 1.
    pub fn position(&self) -> u8 {
        self.position
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.puck, self.position)
    }
}

impl FromStr for PortId {
    type Err = BeamlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PortId {
    type Error = BeamlineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PortId> for String {
    fn from(value: PortId) -> Self {
        value.to_string()
    }
}

/// Whether a port holds a sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occupancy {
    /// No sample in the port
    Empty,
    /// Sample present
    Occupied,
    /// Not yet probed
    #[default]
    Unknown,
}

/// One storage port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Port address
    pub port: PortId,
    /// Barcode read from the sample holder, if any
    pub barcode: Option<String>,
    /// Port contents
    pub occupancy: Occupancy,
    /// The sample belonging to this port is on the goniometer
    pub on_goniometer: bool,
}

impl Slot {
    /// Port with unknown contents.
    pub fn unknown(port: PortId) -> Self {
        Self {
            port,
            barcode: None,
            occupancy: Occupancy::Unknown,
            on_goniometer: false,
        }
    }

    /// Port holding a sample.
    pub fn occupied(port: PortId, barcode: Option<String>) -> Self {
        Self {
            port,
            barcode,
            occupancy: Occupancy::Occupied,
            on_goniometer: false,
        }
    }

    /// Empty port.
    pub fn empty(port: PortId) -> Self {
        Self {
            port,
            barcode: None,
            occupancy: Occupancy::Empty,
            on_goniometer: false,
        }
    }
}

/// Inventory of all ports known to the automounter.
#[derive(Clone, Debug, Default)]
pub struct SampleStore {
    slots: BTreeMap<PortId, Slot>,
}

impl SampleStore {
    /// Empty inventory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the inventory with a fresh report from the hardware.
    ///
    /// The hardware sees the port of a mounted sample as empty; the goniometer
    /// marker is kept for that port.
    pub fn refresh(&mut self, report: Vec<Slot>) {
        let mounted = self.mounted().map(|slot| slot.port.clone());
        self.slots = report
            .into_iter()
            .map(|mut slot| {
                if mounted.as_ref() == Some(&slot.port) {
                    slot.on_goniometer = true;
                    slot.occupancy = Occupancy::Empty;
                }
                (slot.port.clone(), slot)
            })
            .collect();
    }

    /// Slot by port.
    pub fn get(&self, port: &PortId) -> Option<&Slot> {
        self.slots.get(port)
    }

    /// All slots ordered by port.
    pub fn slots(&self) -> Vec<Slot> {
        self.slots.values().cloned().collect()
    }

    /// Occupancy of a port; unknown ports fail with [`BeamlineError::InvalidPort`].
    pub fn occupancy(&self, port: &PortId) -> AppResult<Occupancy> {
        self.slots
            .get(port)
            .map(|slot| slot.occupancy)
            .ok_or_else(|| BeamlineError::InvalidPort(port.to_string()))
    }

    /// Slot whose sample is on the goniometer.
    pub fn mounted(&self) -> Option<&Slot> {
        self.slots.values().find(|slot| slot.on_goniometer)
    }

    /// Number of slots marked on-goniometer. At most one in a consistent store.
    pub fn mounted_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.on_goniometer).count()
    }

    /// Record that the sample from `port` is now on the goniometer.
    pub fn mark_mounted(&mut self, port: &PortId) {
        for slot in self.slots.values_mut() {
            slot.on_goniometer = false;
        }
        if let Some(slot) = self.slots.get_mut(port) {
            slot.occupancy = Occupancy::Empty;
            slot.on_goniometer = true;
        }
    }

    /// Record that the sample from `port` is held by the arm, neither in its port
    /// nor on the goniometer.
    pub fn mark_in_transit(&mut self, port: &PortId) {
        if let Some(slot) = self.slots.get_mut(port) {
            slot.occupancy = Occupancy::Empty;
            slot.on_goniometer = false;
        }
    }

    /// Record that the sample from `port` is back in its port.
    pub fn mark_returned(&mut self, port: &PortId) {
        if let Some(slot) = self.slots.get_mut(port) {
            slot.occupancy = Occupancy::Occupied;
            slot.on_goniometer = false;
        }
    }

    /// JSON view published in the `ports` state.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .slots
            .values()
            .map(|slot| {
                let state = if slot.on_goniometer {
                    "mounted".to_string()
                } else {
                    serde_json::to_value(slot.occupancy)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default()
                };
                (slot.port.to_string(), serde_json::Value::String(state))
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(text: &str) -> PortId {
        PortId::parse(text).unwrap()
    }

    #[test]
    fn test_port_validation() {
        assert!(PortId::parse("A1").is_ok());
        assert!(PortId::parse("BC12").is_ok());
        assert!(PortId::parse("a1").is_err());
        assert!(PortId::parse("A123").is_err());
        assert!(PortId::parse("A0").is_err());
        assert!(PortId::parse("").is_err());
        assert_eq!(port("MA4").to_string(), "MA4");
    }

    #[test]
    fn test_port_ordering_is_numeric() {
        let mut ports = vec![port("A10"), port("B1"), port("A2")];
        ports.sort();
        let names: Vec<String> = ports.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["A2", "A10", "B1"]);
    }

    #[test]
    fn test_port_serde_as_string() {
        let json = serde_json::to_string(&port("C7")).unwrap();
        assert_eq!(json, "\"C7\"");
        let back: PortId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, port("C7"));
        assert!(serde_json::from_str::<PortId>("\"7C\"").is_err());
    }

    #[test]
    fn test_mount_and_return_preserve_sample() {
        let mut store = SampleStore::new();
        store.refresh(vec![
            Slot::occupied(port("A1"), Some("XTAL-1".into())),
            Slot::empty(port("A2")),
        ]);
        assert_eq!(store.occupancy(&port("A2")).unwrap(), Occupancy::Empty);

        store.mark_mounted(&port("A1"));
        assert_eq!(store.mounted_count(), 1);
        assert_eq!(store.occupancy(&port("A1")).unwrap(), Occupancy::Empty);

        // hardware refresh while mounted keeps the goniometer marker
        store.refresh(vec![Slot::empty(port("A1")), Slot::empty(port("A2"))]);
        assert_eq!(store.mounted().map(|s| s.port.clone()), Some(port("A1")));

        store.mark_returned(&port("A1"));
        assert_eq!(store.mounted_count(), 0);
        assert_eq!(store.occupancy(&port("A1")).unwrap(), Occupancy::Occupied);
    }

    #[test]
    fn test_unknown_port_is_invalid() {
        let store = SampleStore::new();
        assert!(matches!(
            store.occupancy(&port("Z9")),
            Err(BeamlineError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_json_view() {
        let mut store = SampleStore::new();
        store.refresh(vec![
            Slot::occupied(port("A1"), None),
            Slot::unknown(port("A2")),
        ]);
        store.mark_mounted(&port("A1"));
        let json = store.to_json();
        assert_eq!(json["A1"], "mounted");
        assert_eq!(json["A2"], "unknown");
    }
}
