//! In-memory scan artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::spec::ScanSpec;
use crate::engine::RunState;
use crate::error::{AppResult, BeamlineError};

/// Column holding the reference counter reading.
pub const REFERENCE_COLUMN: &str = "I_0";

/// Suffix of the normalized column derived from each counter.
pub const SCALED_SUFFIX: &str = "_scaled";

/// Reject names that cannot stand as a record column or header value.
pub fn check_label(kind: &str, label: &str) -> AppResult<()> {
    if label.trim().is_empty() {
        return Err(BeamlineError::Configuration(format!("{kind} name is empty")));
    }
    if let Some(c) = label.chars().find(|&c| matches!(c, ',' | '\t' | '\n' | '\r')) {
        return Err(BeamlineError::Configuration(format!(
            "{kind} name {label:?} contains {c:?}"
        )));
    }
    Ok(())
}

/// Scan metadata written ahead of the data rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanHeader {
    /// Unique id of this acquisition
    pub uid: String,
    /// Scan name
    pub name: String,
    /// Run state at the last update
    pub status: RunState,
    /// When the first point was requested
    pub start_time: DateTime<Utc>,
    /// When the run ended, if it has
    pub end_time: Option<DateTime<Utc>>,
    /// Parameters of the initial run
    pub spec: ScanSpec,
    /// Specs appended with `extend`, in order
    pub extensions: Vec<ScanSpec>,
    /// Positioner names, one column each
    pub positioners: Vec<String>,
    /// Counter names, one column each
    pub counters: Vec<String>,
    /// Counter every reading is divided by, if the scan is normalized
    #[serde(default)]
    pub reference: Option<String>,
    /// Host that acquired the data
    pub host: String,
}

impl ScanHeader {
    /// Fresh header stamped with a new uid, the current time and host name.
    pub fn new(
        name: impl Into<String>,
        spec: ScanSpec,
        positioners: Vec<String>,
        counters: Vec<String>,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            uid: Uuid::new_v4().to_string(),
            name: name.into(),
            status: RunState::Preparing,
            start_time: Utc::now(),
            end_time: None,
            spec,
            extensions: Vec::new(),
            positioners,
            counters,
            reference: None,
            host,
        }
    }

    /// Normalize readings by the counter named `reference`.
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Column names: positioners then counters, then one scaled column per
    /// counter and the reference when the scan is normalized.
    pub fn columns(&self) -> Vec<String> {
        column_names(&self.positioners, &self.counters, self.reference.is_some())
    }

    /// Check every column name and that no two collide.
    pub fn check_columns(&self) -> AppResult<()> {
        check_columns(
            &self.name,
            &self.positioners,
            &self.counters,
            self.reference.as_deref(),
        )
    }
}

fn column_names(positioners: &[String], counters: &[String], normalized: bool) -> Vec<String> {
    let mut columns: Vec<String> = positioners.iter().chain(counters).cloned().collect();
    if normalized {
        columns.extend(counters.iter().map(|c| format!("{c}{SCALED_SUFFIX}")));
        columns.push(REFERENCE_COLUMN.to_string());
    }
    columns
}

/// Check the names a scan writes into its record and that no two columns collide.
pub fn check_columns(
    scan: &str,
    positioners: &[String],
    counters: &[String],
    reference: Option<&str>,
) -> AppResult<()> {
    check_label("Scan", scan)?;
    for positioner in positioners {
        check_label("Positioner", positioner)?;
    }
    for counter in counters.iter().map(String::as_str).chain(reference) {
        check_label("Counter", counter)?;
    }
    if let Some(reference) = reference.filter(|r| counters.iter().any(|c| c == r)) {
        return Err(BeamlineError::Configuration(format!(
            "Scan '{scan}': reference '{reference}' is also a counter"
        )));
    }
    let columns = column_names(positioners, counters, reference.is_some());
    for (i, column) in columns.iter().enumerate() {
        if columns[..i].contains(column) {
            return Err(BeamlineError::Configuration(format!(
                "Scan '{scan}': column '{column}' appears twice"
            )));
        }
    }
    Ok(())
}

/// One acquired point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanRow {
    /// Measured position of every positioner
    pub positions: Vec<f64>,
    /// Reading of every counter
    pub readings: Vec<f64>,
    /// Reference counter reading of a normalized scan
    #[serde(default)]
    pub reference: Option<f64>,
}

impl ScanRow {
    /// Readings divided by the reference; the raw readings if there is none.
    pub fn scaled(&self) -> Vec<f64> {
        match self.reference {
            Some(i0) => self.readings.iter().map(|y| y / i0).collect(),
            None => self.readings.clone(),
        }
    }

    /// Every value in column order.
    pub fn values(&self) -> Vec<f64> {
        let mut values: Vec<f64> = self
            .positions
            .iter()
            .chain(self.readings.iter())
            .copied()
            .collect();
        if let Some(i0) = self.reference {
            values.extend(self.scaled());
            values.push(i0);
        }
        values
    }
}

/// Header plus the rows acquired so far.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Metadata
    pub header: ScanHeader,
    /// Data rows in acquisition order
    pub rows: Vec<ScanRow>,
}

impl ScanResult {
    /// Empty result for `header`.
    pub fn new(header: ScanHeader) -> Self {
        Self {
            header,
            rows: Vec::new(),
        }
    }

    /// Number of acquired points.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True before the first point lands.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append a point.
    pub fn push(&mut self, positions: Vec<f64>, readings: Vec<f64>) {
        self.push_row(ScanRow {
            positions,
            readings,
            reference: None,
        });
    }

    /// Append a point with its reference reading.
    pub fn push_row(&mut self, row: ScanRow) {
        self.rows.push(row);
    }

    /// Values of one column by name, if it exists.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let header = &self.header;
        if let Some(axis) = header.positioners.iter().position(|p| p == name) {
            return Some(self.rows.iter().map(|r| r.positions[axis]).collect());
        }
        if let Some(channel) = header.counters.iter().position(|c| c == name) {
            return Some(self.rows.iter().map(|r| r.readings[channel]).collect());
        }
        header.reference.as_ref()?;
        if name == REFERENCE_COLUMN {
            return Some(self.rows.iter().map(|r| r.reference.unwrap_or(1.0)).collect());
        }
        let base = name.strip_suffix(SCALED_SUFFIX)?;
        let channel = header.counters.iter().position(|c| c == base)?;
        Some(self.rows.iter().map(|r| r.scaled()[channel]).collect())
    }

    /// Mark the run as ended with `status`.
    pub fn finish(&mut self, status: RunState) {
        self.header.status = status;
        self.header.end_time = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_columns_follow_positioners_then_counters() {
        let header = ScanHeader::new(
            "edge",
            ScanSpec::new(0.0, 1.0, 2, Duration::from_millis(1)),
            vec!["mono".into()],
            vec!["i0".into(), "it".into()],
        );
        assert_eq!(header.columns(), vec!["mono", "i0", "it"]);
        assert_eq!(header.status, RunState::Preparing);
        assert!(Uuid::parse_str(&header.uid).is_ok());

        let mut result = ScanResult::new(header);
        assert!(result.is_empty());
        result.push(vec![0.0], vec![10.0, 5.0]);
        result.push(vec![1.0], vec![11.0, 4.0]);
        assert_eq!(result.column("mono"), Some(vec![0.0, 1.0]));
        assert_eq!(result.column("it"), Some(vec![5.0, 4.0]));
        assert_eq!(result.column("nothing"), None);

        result.finish(RunState::Complete);
        assert_eq!(result.header.status, RunState::Complete);
        assert!(result.header.end_time.is_some());
    }

    #[test]
    fn test_reference_adds_scaled_columns() {
        let header = ScanHeader::new(
            "edge",
            ScanSpec::new(0.0, 1.0, 2, Duration::from_millis(1)),
            vec!["mono".into()],
            vec!["it".into(), "if".into()],
        )
        .with_reference("i0");
        assert_eq!(
            header.columns(),
            vec!["mono", "it", "if", "it_scaled", "if_scaled", "I_0"]
        );

        let mut result = ScanResult::new(header);
        result.push_row(ScanRow {
            positions: vec![0.0],
            readings: vec![50.0, 8.0],
            reference: Some(200.0),
        });
        result.push_row(ScanRow {
            positions: vec![1.0],
            readings: vec![30.0, 6.0],
            reference: Some(100.0),
        });
        assert_eq!(result.column("it_scaled"), Some(vec![0.25, 0.3]));
        assert_eq!(result.column("if_scaled"), Some(vec![0.04, 0.06]));
        assert_eq!(result.column("I_0"), Some(vec![200.0, 100.0]));
        assert_eq!(result.column("i0_scaled"), None);
        assert_eq!(
            result.rows[0].values(),
            vec![0.0, 50.0, 8.0, 0.25, 0.04, 200.0]
        );
    }

    #[test]
    fn test_plain_scan_has_no_scaled_columns() {
        let mut result = ScanResult::new(ScanHeader::new(
            "edge",
            ScanSpec::new(0.0, 1.0, 2, Duration::from_millis(1)),
            vec!["mono".into()],
            vec!["it".into()],
        ));
        result.push(vec![0.0], vec![5.0]);
        assert_eq!(result.column("it_scaled"), None);
        assert_eq!(result.column("I_0"), None);
        assert_eq!(result.rows[0].scaled(), vec![5.0]);
    }

    #[test]
    fn test_column_names_are_checked() {
        let spec = ScanSpec::new(0.0, 1.0, 2, Duration::from_millis(1));
        let header = |positioner: &str, counter: &str| {
            ScanHeader::new("edge", spec.clone(), vec![positioner.into()], vec![counter.into()])
        };
        header("mono", "i0").check_columns().unwrap();
        assert!(matches!(
            header("mono,gap", "i0").check_columns(),
            Err(BeamlineError::Configuration(_))
        ));
        assert!(header("mono", "i0\nit").check_columns().is_err());
        assert!(header("mono", "mono").check_columns().is_err());
        assert!(header("mono", "it_scaled")
            .with_reference("i0")
            .check_columns()
            .is_ok());
        let clash = ScanHeader::new(
            "edge",
            spec.clone(),
            vec!["mono".into()],
            vec!["it".into(), "it_scaled".into()],
        )
        .with_reference("i0");
        assert!(clash.check_columns().is_err());
        assert!(header("mono", "i0").with_reference("i0").check_columns().is_err());
        assert!(check_label("Scan", "edge\r").is_err());
        assert!(check_label("Scan", " ").is_err());
    }
}
