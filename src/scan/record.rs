//! XDI-style scan record.
//!
//! ```text
//! # XDI/1.0 rust_beamline/0.1.0
//! # Scan.uid: 6f1c...
//! # Scan.name: edge
//! # Scan.status: complete
//! # Scan.start_time: 2024-05-01T10:00:00Z
//! # Scan.end_time: 2024-05-01T10:01:00Z
//! # Scan.spec: {"start":0.0,...}
//! # Scan.extension: {"start":10.0,...}
//! # Scan.positioners: mono
//! # Scan.counters: i0,it
//! # Facility.host: bl-ws1
//! # Column.1: mono
//! # Column.2: i0
//! # Column.3: it
//! # ///
//! # ---
//! mono	i0	it
//! 0	1000.5	812.25
//! ```
//!
//! Header lines are `# key: value`. Rows are tab separated and use the shortest
//! representation that parses back to the same `f64`. A normalized scan adds a
//! `# Scan.reference` line and trailing `{counter}_scaled` and `I_0` columns;
//! the scaled values are derived again from `I_0` when read.
//!
//! Names may not contain `,`, tabs or line breaks; [`write`] refuses them.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

use super::result::{ScanHeader, ScanResult, ScanRow};
use crate::error::{AppResult, BeamlineError};

const VERSION_LINE: &str = "# XDI/1.0";
const END_OF_HEADER: &str = "# ///";
const COLUMN_MARKER: &str = "# ---";

/// Write `result` to `path`, replacing any previous file.
///
/// The record is written next to the target and renamed into place, so a reader
/// never observes a half-written file.
pub fn write(path: &Path, result: &ScanResult) -> AppResult<()> {
    result
        .header
        .check_columns()
        .map_err(|e| BeamlineError::Record(e.to_string()))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let staging = path.with_extension("partial");
    {
        let mut file = BufWriter::new(File::create(&staging)?);
        write_header(&mut file, &result.header)?;

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);
        writer.write_record(result.header.columns())?;
        for row in &result.rows {
            writer.write_record(row.values().iter().map(f64::to_string))?;
        }
        writer.flush()?;
    }
    fs::rename(&staging, path)?;
    debug!(path = %path.display(), rows = result.len(), "scan record written");
    Ok(())
}

fn write_header(out: &mut impl Write, header: &ScanHeader) -> AppResult<()> {
    writeln!(out, "{} rust_beamline/{}", VERSION_LINE, env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "# Scan.uid: {}", header.uid)?;
    writeln!(out, "# Scan.name: {}", header.name)?;
    writeln!(out, "# Scan.status: {}", header.status)?;
    writeln!(out, "# Scan.start_time: {}", header.start_time.to_rfc3339())?;
    if let Some(end) = header.end_time {
        writeln!(out, "# Scan.end_time: {}", end.to_rfc3339())?;
    }
    writeln!(out, "# Scan.spec: {}", serde_json::to_string(&header.spec)?)?;
    for extension in &header.extensions {
        writeln!(out, "# Scan.extension: {}", serde_json::to_string(extension)?)?;
    }
    writeln!(out, "# Scan.positioners: {}", header.positioners.join(","))?;
    writeln!(out, "# Scan.counters: {}", header.counters.join(","))?;
    if let Some(reference) = &header.reference {
        writeln!(out, "# Scan.reference: {reference}")?;
    }
    writeln!(out, "# Facility.host: {}", header.host)?;
    for (i, column) in header.columns().iter().enumerate() {
        writeln!(out, "# Column.{}: {}", i + 1, column)?;
    }
    writeln!(out, "{END_OF_HEADER}")?;
    writeln!(out, "{COLUMN_MARKER}")?;
    Ok(())
}

/// Read a record written by [`write`].
pub fn read(path: &Path) -> AppResult<ScanResult> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines();

    match lines.next() {
        Some(first) if first.starts_with(VERSION_LINE) => {}
        _ => {
            return Err(BeamlineError::Record(format!(
                "{} is not an XDI record",
                path.display()
            )))
        }
    }

    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    let mut extensions = Vec::new();
    let mut terminated = false;
    for line in lines.by_ref() {
        if line == COLUMN_MARKER {
            terminated = true;
            break;
        }
        if line == END_OF_HEADER {
            continue;
        }
        let Some((key, value)) = line.strip_prefix("# ").and_then(|l| l.split_once(": ")) else {
            return Err(BeamlineError::Record(format!("malformed header line '{line}'")));
        };
        if key == "Scan.extension" {
            extensions.push(serde_json::from_str(value)?);
        } else {
            fields.insert(key.to_string(), value.to_string());
        }
    }
    if !terminated {
        return Err(BeamlineError::Record("missing column marker".into()));
    }

    let field = |key: &str| {
        fields
            .get(key)
            .cloned()
            .ok_or_else(|| BeamlineError::Record(format!("missing header field {key}")))
    };
    let names = |key: &str| -> AppResult<Vec<String>> {
        Ok(field(key)?
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    };
    let timestamp = |value: &str| -> AppResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| BeamlineError::Record(format!("bad timestamp '{value}': {e}")))
    };

    let status = serde_json::from_value(serde_json::Value::String(field("Scan.status")?))?;
    let end_time = match fields.get("Scan.end_time") {
        Some(value) => Some(timestamp(value)?),
        None => None,
    };
    let header = ScanHeader {
        uid: field("Scan.uid")?,
        name: field("Scan.name")?,
        status,
        start_time: timestamp(&field("Scan.start_time")?)?,
        end_time,
        spec: serde_json::from_str(&field("Scan.spec")?)?,
        extensions,
        positioners: names("Scan.positioners")?,
        counters: names("Scan.counters")?,
        reference: fields.get("Scan.reference").cloned(),
        host: field("Facility.host")?,
    };

    let body = lines.collect::<Vec<_>>().join("\n");
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_reader(body.as_bytes());
    let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if columns != header.columns() {
        return Err(BeamlineError::Record(format!(
            "column line {:?} does not match header {:?}",
            columns,
            header.columns()
        )));
    }

    let axes = header.positioners.len();
    let channels = header.counters.len();
    let mut rows = Vec::new();
    for record in reader.records() {
        let values = record?
            .iter()
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|_| BeamlineError::Record(format!("bad number '{v}'")))
            })
            .collect::<AppResult<Vec<f64>>>()?;
        if values.len() != columns.len() {
            return Err(BeamlineError::Record(format!(
                "row has {} values for {} columns",
                values.len(),
                columns.len()
            )));
        }
        rows.push(ScanRow {
            positions: values[..axes].to_vec(),
            readings: values[axes..axes + channels].to_vec(),
            reference: header.reference.as_ref().and_then(|_| values.last().copied()),
        });
    }

    Ok(ScanResult { header, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunState;
    use crate::scan::spec::ScanSpec;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_result() -> ScanResult {
        let spec = ScanSpec::new(0.0, 1.0, 3, Duration::from_millis(100)).with_axis(5.0, 4.0);
        let mut header = ScanHeader::new(
            "edge",
            spec.clone(),
            vec!["mono".into(), "gap".into()],
            vec!["i0".into()],
        );
        header.extensions.push(ScanSpec::new(1.0, 2.0, 2, Duration::from_millis(50)));
        let mut result = ScanResult::new(header);
        result.push(vec![0.0, 5.0], vec![1000.5]);
        result.push(vec![0.5, 4.5], vec![0.1 + 0.2]);
        result.push(vec![1.0, 4.0], vec![-3.25e-7]);
        result.finish(RunState::Complete);
        result
    }

    #[test]
    fn test_record_reproduces_rows_and_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("edge.xdi");
        let result = sample_result();

        write(&path, &result).unwrap();
        let back = read(&path).unwrap();
        assert_eq!(back.rows, result.rows);
        assert_eq!(back.header.uid, result.header.uid);
        assert_eq!(back.header.spec, result.header.spec);
        assert_eq!(back.header.extensions, result.header.extensions);
        assert_eq!(back.header.status, RunState::Complete);
        // rfc3339 keeps sub-second precision
        assert_eq!(back.header.start_time, result.header.start_time);
        assert_eq!(back.header.end_time, result.header.end_time);
        assert_eq!(back, result);
    }

    #[test]
    fn test_write_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("edge.xdi");
        let mut result = sample_result();
        write(&path, &result).unwrap();
        result.rows.truncate(1);
        write(&path, &result).unwrap();

        assert_eq!(read(&path).unwrap().rows.len(), 1);
        assert!(!path.with_extension("partial").exists());
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# XDI/1.0 rust_beamline/"));
        assert!(text.contains("# Column.3: i0"));
    }

    #[test]
    fn test_partial_record_without_end_time() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("running.xdi");
        let header = ScanHeader::new(
            "running",
            ScanSpec::new(0.0, 1.0, 2, Duration::from_millis(1)),
            vec!["x".into()],
            vec![],
        );
        write(&path, &ScanResult::new(header)).unwrap();
        let back = read(&path).unwrap();
        assert!(back.is_empty());
        assert_eq!(back.header.end_time, None);
        assert!(back.header.counters.is_empty());
    }

    #[test]
    fn test_normalized_record_keeps_reference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("norm.xdi");
        let header = ScanHeader::new(
            "norm",
            ScanSpec::new(0.0, 1.0, 2, Duration::from_millis(1)),
            vec!["mono".into()],
            vec!["it".into()],
        )
        .with_reference("i0");
        let mut result = ScanResult::new(header);
        result.push_row(ScanRow {
            positions: vec![0.0],
            readings: vec![40.0],
            reference: Some(160.0),
        });
        write(&path, &result).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("# Scan.reference: i0"));
        assert!(text.contains("mono\tit\tit_scaled\tI_0"));
        assert!(text.contains("0\t40\t0.25\t160"));
        let back = read(&path).unwrap();
        assert_eq!(back, result);
        assert_eq!(back.column("it_scaled"), Some(vec![0.25]));
    }

    #[test]
    fn test_refuses_names_that_break_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.xdi");
        let header = ScanHeader::new(
            "bad",
            ScanSpec::new(0.0, 1.0, 2, Duration::from_millis(1)),
            vec!["mono".into()],
            vec!["i0,it".into()],
        );
        assert!(matches!(
            write(&path, &ScanResult::new(header)),
            Err(BeamlineError::Record(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_rejects_short_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.xdi");
        write(&path, &sample_result()).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, format!("{text}2\t3\n")).unwrap();
        assert!(matches!(read(&path), Err(BeamlineError::Record(_))));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        fs::write(&path, "a,b\n1,2\n").unwrap();
        assert!(matches!(read(&path), Err(BeamlineError::Record(_))));
    }
}
