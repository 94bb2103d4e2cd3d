//! Station assembly from configuration, registry lookups, shutdown and the
//! observable-state contract every entry relies on.

mod common;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use common::STATION;
use rust_beamline::config::BeamlineConfig;
use rust_beamline::core::{Event, EventKind, StateValue};
use rust_beamline::engine::RunState;
use rust_beamline::observable::Object;
use rust_beamline::{Beamline, BeamlineError};

fn station() -> Beamline {
    let config = BeamlineConfig::from_toml_str(STATION).unwrap();
    Beamline::from_config(&config).unwrap()
}

#[test]
fn test_station_from_config() {
    let beamline = station();
    assert_eq!(beamline.name(), "test-station");
    assert_eq!(
        beamline.names(),
        vec!["energy", "i0", "i1", "automounter", "energy_scan"]
    );

    let scan = assert_ok!(beamline.scan("energy_scan"));
    assert_eq!(scan.positioners(), vec!["energy".to_string()]);
    assert_eq!(scan.counters(), vec!["i0".to_string(), "i1".to_string()]);
    assert_eq!(scan.targets().len(), 6);

    let status = beamline.status();
    assert_eq!(
        status["energy_scan"].get("run_state"),
        Some(&StateValue::from(RunState::Idle))
    );
    assert!(status.contains_key("automounter"));
}

#[test]
fn test_lookups_are_typed() {
    let beamline = station();
    assert_ok!(beamline.positioner("energy"));
    assert_ok!(beamline.counter("i1"));
    assert_ok!(beamline.automounter("automounter"));
    assert_eq!(assert_ok!(beamline.get("i0")).kind(), "counter");
    // any hardware entry exposes its device
    assert_eq!(assert_ok!(beamline.device("energy")).name(), "energy");

    let err = assert_err!(beamline.counter("energy"));
    assert!(matches!(err, BeamlineError::NotFound { kind: "counter", .. }));
    let err = assert_err!(beamline.get("missing"));
    assert!(matches!(err, BeamlineError::NotFound { kind: "entry", .. }));
    assert!(beamline.scan("i0").is_err());
}

#[test]
fn test_scan_referencing_unknown_motor_is_rejected() {
    let text = STATION.replace(r#"positioners = ["energy"]"#, r#"positioners = ["theta"]"#);
    let err = assert_err!(BeamlineConfig::from_toml_str(&text));
    assert!(matches!(err, BeamlineError::Configuration(_)));
}

#[tokio::test]
async fn test_configured_reference_normalizes_scan() {
    let text = STATION.replace(
        r#"counters = ["i0", "i1"]"#,
        "counters = [\"i1\"]\nreference = \"i0\"",
    );
    let config = assert_ok!(BeamlineConfig::from_toml_str(&text));
    let beamline = assert_ok!(Beamline::from_config(&config));
    let scan = beamline.scan("energy_scan").unwrap();
    assert_eq!(scan.reference().as_deref(), Some("i0"));
    assert_eq!(scan.counters(), vec!["i1".to_string()]);

    let result = assert_ok!(scan.scan().await);
    assert_eq!(result.len(), 6);
    assert_eq!(
        result.header.columns(),
        vec!["energy", "i1", "i1_scaled", "I_0"]
    );
    assert!(result.rows.iter().all(|r| r.reference.is_some()));
}

#[tokio::test]
async fn test_configured_scan_runs_and_saves() {
    let beamline = station();
    let scan = beamline.scan("energy_scan").unwrap();
    let result = assert_ok!(scan.scan().await);
    assert_eq!(result.len(), 6);
    assert_eq!(result.header.counters, vec!["i0".to_string(), "i1".to_string()]);

    let dir = tempfile::tempdir().unwrap();
    let path = assert_ok!(scan.save(dir.path()));
    assert!(path.exists());
    assert_ok!(beamline.cleanup().await);
}

#[tokio::test]
async fn test_cleanup_closes_every_device() {
    let beamline = station();
    let mounter = beamline.automounter("automounter").unwrap();
    assert_ok!(mounter.prepare().await);

    assert_ok!(beamline.cleanup().await);
    for name in ["energy", "i0", "i1", "automounter"] {
        assert!(beamline.device(name).unwrap().is_closed(), "{name} still open");
    }
    assert!(matches!(
        mounter.mount("A1").await,
        Err(BeamlineError::ClosedDevice(_))
    ));
    // a second shutdown finds nothing left to release
    assert_ok!(beamline.cleanup().await);
}

#[test]
fn test_object_last_write_wins_with_ordered_notifications() {
    let object = Object::new("probe");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    object.on(EventKind::Changed, move |event| {
        if let Event::Changed { name, value } = event {
            sink.lock().push((name.clone(), value.clone()));
        }
    });

    object.set_state("position", 1.0);
    object.set_state("position", 2.5);
    object.set_state("label", "edge");
    object.set_state("position", 2.5);

    assert_eq!(assert_ok!(object.get_state("position")), StateValue::from(2.5));
    assert_eq!(
        *seen.lock(),
        vec![
            ("position".to_string(), StateValue::from(1.0)),
            ("position".to_string(), StateValue::from(2.5)),
            ("label".to_string(), StateValue::from("edge")),
            ("position".to_string(), StateValue::from(2.5)),
        ]
    );
    assert!(matches!(
        object.get_state("missing"),
        Err(BeamlineError::UnknownState { .. })
    ));
}
