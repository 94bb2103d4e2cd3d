//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use rust_beamline::automounter::{AutoMounter, PortId};
use rust_beamline::core::{Event, EventKind};
use rust_beamline::error_recovery::RetryPolicy;
use rust_beamline::hardware::mock::{MockCounter, MockManipulator, MockMotor};
use rust_beamline::hardware::{Counter, Manipulator, Positioner};
use rust_beamline::scan::{BasicScan, ScanEvent, ScanSpec};
use rust_beamline::traits::Waitable;

/// Minimal station used by the beamline tests.
pub const STATION: &str = r#"
    [beamline]
    name = "test-station"
    log_level = "debug"

    [[motors]]
    name = "energy"
    speed = 1000.0

    [[counters]]
    name = "i0"

    [[counters]]
    name = "i1"
    rate = 50.0

    [automounter]
    pucks = ["A"]
    ports_per_puck = 4
    samples = ["A1", "A2"]
    step_delay = "2ms"
    retry_backoff = "1ms"

    [[scans]]
    name = "energy_scan"
    positioners = ["energy"]
    counters = ["i0", "i1"]

    [scans.spec]
    start = 0.0
    end = 10.0
    steps = 6
    dwell = "2ms"
"#;

pub fn port(text: &str) -> PortId {
    PortId::parse(text).unwrap()
}

/// Puck `A` with four ports, samples in A1 and A3.
pub fn robot(step_delay: Duration) -> Arc<MockManipulator> {
    Arc::new(
        MockManipulator::new((1..=4).map(|i| port(&format!("A{i}"))))
            .with_sample(port("A1"), Some("CLSA01"))
            .with_sample(port("A3"), Some("CLSA03"))
            .with_step_delay(step_delay),
    )
}

/// Automounter with a fast recovery policy, already prepared.
pub async fn ready_mounter(robot: &Arc<MockManipulator>) -> AutoMounter {
    let mounter = AutoMounter::with_retry_policy(
        "automounter",
        Arc::clone(robot) as Arc<dyn Manipulator>,
        RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
        },
    );
    mounter.prepare().await.unwrap();
    mounter
}

/// Fast single-axis scan over `mono` reading `i0`.
pub fn line_scan(name: &str) -> BasicScan {
    let motor: Arc<dyn Positioner> = Arc::new(MockMotor::with_speed("mono", 1000.0));
    let counter: Arc<dyn Counter> = Arc::new(MockCounter::new("i0"));
    BasicScan::new(name, vec![motor], vec![counter]).unwrap()
}

/// Spec with a dwell long enough to interleave pause/stop requests.
pub fn spec(start: f64, end: f64, steps: usize) -> ScanSpec {
    ScanSpec::new(start, end, steps, Duration::from_millis(10))
}

/// Record every scan event emitted by `scan`.
pub fn record_points(scan: &BasicScan) -> Arc<Mutex<Vec<ScanEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    scan.object().on(EventKind::Scan, move |event| {
        if let Event::Scan(e) = event {
            sink.lock().push(e.clone());
        }
    });
    events
}

/// Indices of the `NewPoint` events in `events`.
pub fn point_indices(events: &[ScanEvent]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::NewPoint { index, .. } => Some(*index),
            ScanEvent::Progress(_) => None,
        })
        .collect()
}
