//! BasicScan: multi-point acquisition engine.
//!
//! A [`BasicScan`] drives one or more positioners through the targets of a
//! [`ScanSpec`] and reads every counter at each point. The run is an
//! [`Engine`], so it can be paused, resumed and stopped between points without
//! losing what was already acquired.
//!
//! Per point:
//!
//! 1. Checkpoint (pause blocks here, stop ends the run with the partial result)
//! 2. Command all axes, then wait for each to go idle within the move timeout
//! 3. Check the settled positions against the tolerance
//! 4. Count all counters concurrently for the dwell time
//! 5. Append the row, emit [`ScanEvent::NewPoint`] and [`ScanEvent::Progress`]
//!
//! The row cursor lives in the result, so a run restarted after `extend` picks up
//! at the first point not yet acquired.
//!
//! A grid ([`ScanMode::Grid`]) runs the same loop over the product of two axes.
//! A continuous sweep ([`ScanMode::Continuous`]) settles at the start, commands
//! the end once and counts back to back until the positioner goes idle, recording
//! the position read after each count. Pausing a sweep halts the positioner; resume
//! commands the end again.
//!
//! With a reference counter every row also carries `I_0` and each reading divided
//! by it.

pub mod record;
pub mod result;
pub mod spec;

pub use result::{ScanHeader, ScanResult, ScanRow};
pub use spec::{AxisRange, ScanMode, ScanSpec};

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::{Event, EventKind, StateValue};
use crate::device::Device;
use crate::engine::{Checkpoint, Engine, Flow, Procedure, RunState};
use crate::error::{AppResult, BeamlineError};
use crate::hardware::capabilities::{Counter, Positioner};
use crate::observable::{ListenerId, Object};
use crate::traits::{Configurable, Pausable, Waitable};

/// Acquisition notifications emitted as [`Event::Scan`].
#[derive(Clone, Debug, PartialEq)]
pub enum ScanEvent {
    /// A point was acquired
    NewPoint {
        /// Zero-based point index
        index: usize,
        /// Measured positions, one per positioner
        positions: Vec<f64>,
        /// Readings, one per counter
        readings: Vec<f64>,
        /// Reference reading of a normalized scan
        reference: Option<f64>,
    },
    /// Fraction of planned points acquired, in `0.0..=1.0`
    Progress(f64),
}

/// One planned point with the motion parameters of the spec it came from.
#[derive(Clone, Debug)]
struct ScanPoint {
    targets: Vec<f64>,
    dwell: Duration,
    move_timeout: Duration,
    tolerance: f64,
}

impl ScanPoint {
    fn plan(spec: &ScanSpec) -> Vec<ScanPoint> {
        if spec.mode == ScanMode::Continuous {
            return Vec::new();
        }
        spec.targets()
            .into_iter()
            .map(|targets| ScanPoint {
                targets,
                dwell: spec.dwell,
                move_timeout: spec.move_timeout,
                tolerance: spec.tolerance,
            })
            .collect()
    }
}

#[derive(Default)]
struct Plan {
    spec: Option<ScanSpec>,
    extensions: Vec<ScanSpec>,
    points: Vec<ScanPoint>,
    /// Positions read at prepare for relative scans
    origin: Option<Vec<f64>>,
}

/// The acquisition loop run by the scan engine.
pub struct ScanProcedure {
    name: String,
    positioners: Vec<Arc<dyn Positioner>>,
    counters: Vec<Arc<dyn Counter>>,
    reference: Option<Arc<dyn Counter>>,
    plan: RwLock<Plan>,
    result: Mutex<Option<ScanResult>>,
}

impl ScanProcedure {
    fn devices(&self) -> impl Iterator<Item = &Device> {
        self.positioners
            .iter()
            .map(|p| p.device())
            .chain(self.counters.iter().chain(&self.reference).map(|c| c.device()))
    }

    fn acquired(&self) -> usize {
        self.result.lock().as_ref().map_or(0, ScanResult::len)
    }

    /// Command every axis, then wait for each to settle. Returns measured positions.
    async fn move_all(&self, targets: &[f64], point: &ScanPoint) -> AppResult<Vec<f64>> {
        for (positioner, &target) in self.positioners.iter().zip(targets) {
            positioner.move_to(target).await?;
        }
        let settles = self
            .positioners
            .iter()
            .zip(targets)
            .map(|(positioner, &target)| settle(positioner.as_ref(), target, point));
        try_join_all(settles).await
    }

    /// Count every counter and the reference together. Returns the readings and
    /// the reference reading. Without counters the dwell is still waited out.
    async fn count_all(&self, dwell: Duration) -> AppResult<(Vec<f64>, Option<f64>)> {
        if self.counters.is_empty() && self.reference.is_none() {
            tokio::time::sleep(dwell).await;
            return Ok((Vec::new(), None));
        }
        let channels = self.counters.iter().chain(&self.reference);
        let mut readings = try_join_all(channels.map(|c| c.count(dwell))).await?;
        let reference = match self.reference {
            Some(_) => readings.pop(),
            None => None,
        };
        Ok((readings, reference))
    }

    /// Append a row and announce it.
    fn record(&self, object: &Object, row: ScanRow, fraction: f64) {
        let index = {
            let mut result = self.result.lock();
            let Some(result) = result.as_mut() else {
                return;
            };
            result.push_row(row.clone());
            result.len() - 1
        };
        let ScanRow {
            positions,
            readings,
            reference,
        } = row;
        debug!(scan = %self.name, index, ?positions, ?readings, ?reference, "point acquired");
        object.set_state("acquired", index + 1);
        object.set_state("progress", fraction);
        object.emit(Event::Scan(ScanEvent::NewPoint {
            index,
            positions,
            readings,
            reference,
        }));
        object.emit(Event::Scan(ScanEvent::Progress(fraction)));
    }

    async fn acquire(&self, checkpoint: &Checkpoint) -> AppResult<()> {
        let sweep = {
            let plan = self.plan.read();
            plan.spec
                .clone()
                .filter(|spec| spec.mode == ScanMode::Continuous)
                .map(|spec| (spec, plan.origin.clone()))
        };
        match sweep {
            Some((spec, origin)) => self.sweep(checkpoint, &spec, origin).await,
            None => self.step_through(checkpoint).await,
        }
    }

    async fn step_through(&self, checkpoint: &Checkpoint) -> AppResult<()> {
        let object = checkpoint.object();
        loop {
            let index = self.acquired();
            let (point, origin, total) = {
                let plan = self.plan.read();
                match plan.points.get(index) {
                    Some(point) => (point.clone(), plan.origin.clone(), plan.points.len()),
                    None => break,
                }
            };
            if checkpoint.reached().await == Flow::Stop {
                break;
            }

            let targets: Vec<f64> = match origin {
                Some(origin) => point
                    .targets
                    .iter()
                    .zip(origin)
                    .map(|(offset, base)| base + offset)
                    .collect(),
                None => point.targets.clone(),
            };
            let positions = self.move_all(&targets, &point).await?;
            let (readings, reference) = self.count_all(point.dwell).await?;
            let row = ScanRow {
                positions,
                readings,
                reference,
            };
            self.record(object, row, (index + 1) as f64 / total as f64);
        }
        Ok(())
    }

    /// Count while the primary positioner travels from start to end.
    async fn sweep(
        &self,
        checkpoint: &Checkpoint,
        spec: &ScanSpec,
        origin: Option<Vec<f64>>,
    ) -> AppResult<()> {
        let Some(positioner) = self.positioners.first() else {
            return Ok(());
        };
        let base = origin.and_then(|o| o.first().copied()).unwrap_or(0.0);
        let (start, end) = (base + spec.start, base + spec.end);
        let approach = ScanPoint {
            targets: vec![start],
            dwell: spec.dwell,
            move_timeout: spec.move_timeout,
            tolerance: spec.tolerance,
        };
        if checkpoint.reached().await == Flow::Stop {
            return Ok(());
        }
        self.move_all(&approach.targets, &approach).await?;
        positioner.move_to(end).await?;
        debug!(scan = %self.name, start, end, "sweep started");

        loop {
            if checkpoint.pause_requested() {
                positioner.stop().await?;
                debug!(scan = %self.name, "sweep halted for pause");
                if checkpoint.reached().await == Flow::Stop {
                    break;
                }
                positioner.move_to(end).await?;
            }
            if checkpoint.stop_requested() {
                positioner.stop().await?;
                break;
            }
            let (readings, reference) = self.count_all(spec.dwell).await?;
            // sampled before the position so the last row lands on the end point
            let moving = positioner.device().is_busy();
            let position = positioner.position().await?;
            let row = ScanRow {
                positions: vec![position],
                readings,
                reference,
            };
            let fraction = ((position - start) / (end - start)).clamp(0.0, 1.0);
            self.record(checkpoint.object(), row, fraction);
            if !moving {
                break;
            }
        }
        Ok(())
    }
}

/// Wait for a positioner to go idle and check it is within tolerance of `target`.
async fn settle(positioner: &dyn Positioner, target: f64, point: &ScanPoint) -> AppResult<f64> {
    let device = positioner.device();
    let idle = device
        .object()
        .wait_for("busy", |v| v.as_bool() == Some(false), point.move_timeout)
        .await;
    if !idle {
        if let Err(e) = positioner.stop().await {
            warn!(device = %device.name(), error = %e, "stop after move timeout failed");
        }
        return Err(BeamlineError::MoveTimeout {
            device: device.name().to_string(),
            target,
            reason: format!("still moving after {:?}", point.move_timeout),
        });
    }
    let position = positioner.position().await?;
    if (position - target).abs() > point.tolerance {
        return Err(BeamlineError::MoveTimeout {
            device: device.name().to_string(),
            target,
            reason: format!("settled at {position}, outside tolerance {}", point.tolerance),
        });
    }
    Ok(position)
}

#[async_trait]
impl Procedure for ScanProcedure {
    type Output = ScanResult;

    async fn prepare(&self) -> AppResult<()> {
        let (spec, extensions, needs_origin) = {
            let plan = self.plan.read();
            let spec = plan.spec.clone().ok_or_else(|| {
                BeamlineError::InvalidScanSpec(format!("scan '{}' is not configured", self.name))
            })?;
            let needs_origin = spec.relative && plan.origin.is_none();
            (spec, plan.extensions.clone(), needs_origin)
        };

        for device in self.devices() {
            device.ensure_open()?;
            if !device.is_enabled() {
                return Err(BeamlineError::NotReady {
                    device: device.name().to_string(),
                    state: "disabled".into(),
                });
            }
        }

        if needs_origin {
            let origin = try_join_all(self.positioners.iter().map(|p| p.position())).await?;
            debug!(scan = %self.name, ?origin, "relative scan origin");
            self.plan.write().origin = Some(origin);
        }

        let mut result = self.result.lock();
        match result.as_mut() {
            Some(existing) => {
                existing.header.status = RunState::Running;
                existing.header.end_time = None;
            }
            None => {
                let mut header = ScanHeader::new(
                    self.name.clone(),
                    spec,
                    self.positioners.iter().map(|p| p.device().name().to_string()).collect(),
                    self.counters.iter().map(|c| c.device().name().to_string()).collect(),
                );
                header.reference = self.reference.as_ref().map(|c| c.device().name().to_string());
                header.extensions = extensions;
                header.status = RunState::Running;
                *result = Some(ScanResult::new(header));
            }
        }
        Ok(())
    }

    async fn execute(&self, checkpoint: &Checkpoint) -> AppResult<ScanResult> {
        let outcome = self.acquire(checkpoint).await;
        let status = match &outcome {
            Ok(()) if checkpoint.stop_requested() => RunState::Stopped,
            Ok(()) => RunState::Complete,
            Err(_) => RunState::Failed,
        };
        let snapshot = self.result.lock().as_mut().map(|result| {
            result.finish(status);
            result.clone()
        });
        outcome?;
        info!(scan = %self.name, %status, points = self.acquired(), "scan finished");
        snapshot.ok_or_else(|| BeamlineError::Record(format!("scan '{}' has no result", self.name)))
    }
}

/// Parameterized, pausable line scan over one or more positioners.
#[derive(Clone, Debug)]
pub struct BasicScan {
    engine: Engine<ScanProcedure>,
}

impl BasicScan {
    /// Create an unconfigured scan bound to its collaborators.
    ///
    /// Positioner `k` follows axis `k` of the spec (the primary range first).
    /// Names must be usable as record columns: no `,`, tabs or line breaks.
    pub fn new(
        name: impl Into<String>,
        positioners: Vec<Arc<dyn Positioner>>,
        counters: Vec<Arc<dyn Counter>>,
    ) -> AppResult<Self> {
        Self::build(name.into(), positioners, counters, None)
    }

    /// Like [`BasicScan::new`], dividing every reading by `reference`.
    pub fn normalized(
        name: impl Into<String>,
        positioners: Vec<Arc<dyn Positioner>>,
        counters: Vec<Arc<dyn Counter>>,
        reference: Arc<dyn Counter>,
    ) -> AppResult<Self> {
        Self::build(name.into(), positioners, counters, Some(reference))
    }

    fn build(
        name: String,
        positioners: Vec<Arc<dyn Positioner>>,
        counters: Vec<Arc<dyn Counter>>,
        reference: Option<Arc<dyn Counter>>,
    ) -> AppResult<Self> {
        if positioners.is_empty() {
            return Err(BeamlineError::Configuration(format!(
                "scan '{name}' needs at least one positioner"
            )));
        }
        let axes: Vec<String> = positioners.iter().map(|p| p.device().name().to_string()).collect();
        let channels: Vec<String> = counters.iter().map(|c| c.device().name().to_string()).collect();
        result::check_columns(
            &name,
            &axes,
            &channels,
            reference.as_ref().map(|c| c.device().name()),
        )?;
        let procedure = ScanProcedure {
            name: name.clone(),
            positioners,
            counters,
            reference,
            plan: RwLock::new(Plan::default()),
            result: Mutex::new(None),
        };
        let engine = Engine::new(name, procedure);
        let object = engine.object();
        object.declare("spec", StateValue::Null);
        object.declare("points", 0usize);
        object.declare("acquired", 0usize);
        object.declare("progress", 0.0);
        Ok(Self { engine })
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Engine<ScanProcedure> {
        &self.engine
    }

    /// Scan name, also the engine object name.
    pub fn name(&self) -> &str {
        self.engine.name()
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        self.engine.state()
    }

    /// True from `start` until the run reaches a terminal state.
    pub fn is_busy(&self) -> bool {
        self.engine.is_busy()
    }

    /// True while held at a checkpoint.
    pub fn is_paused(&self) -> bool {
        self.engine.is_paused()
    }

    /// True once a stop was requested or honoured.
    pub fn is_stopped(&self) -> bool {
        self.engine.is_stopped()
    }

    /// Names of the bound positioners.
    pub fn positioners(&self) -> Vec<String> {
        self.engine
            .procedure()
            .positioners
            .iter()
            .map(|p| p.device().name().to_string())
            .collect()
    }

    /// Names of the bound counters.
    pub fn counters(&self) -> Vec<String> {
        self.engine
            .procedure()
            .counters
            .iter()
            .map(|c| c.device().name().to_string())
            .collect()
    }

    /// Name of the reference counter of a normalized scan.
    pub fn reference(&self) -> Option<String> {
        self.engine
            .procedure()
            .reference
            .as_ref()
            .map(|c| c.device().name().to_string())
    }

    /// Spec of the current configuration.
    pub fn spec(&self) -> Option<ScanSpec> {
        self.engine.procedure().plan.read().spec.clone()
    }

    /// Planned targets of every point, including extensions. Relative scans
    /// report offsets.
    pub fn targets(&self) -> Vec<Vec<f64>> {
        self.engine
            .procedure()
            .plan
            .read()
            .points
            .iter()
            .map(|p| p.targets.clone())
            .collect()
    }

    /// Data acquired so far.
    pub fn result(&self) -> Option<ScanResult> {
        self.engine.procedure().result.lock().clone()
    }

    fn reject(&self, action: &'static str) -> BeamlineError {
        BeamlineError::EngineState {
            engine: self.name().to_string(),
            action,
            state: self.state().to_string(),
        }
    }

    fn check_axes(&self, spec: &ScanSpec) -> AppResult<()> {
        let positioners = self.engine.procedure().positioners.len();
        if spec.axis_count() != positioners {
            return Err(BeamlineError::InvalidScanSpec(format!(
                "{} axes for {} positioners",
                spec.axis_count(),
                positioners
            )));
        }
        Ok(())
    }

    fn publish_plan(&self) {
        let procedure = self.engine.procedure();
        let (spec, points) = {
            let plan = procedure.plan.read();
            (plan.spec.clone(), plan.points.len())
        };
        let object = self.engine.object();
        let spec = spec
            .and_then(|s| serde_json::to_value(s).ok())
            .map_or(StateValue::Null, StateValue::Json);
        object.set_state("spec", spec);
        object.set_state("points", points);
        object.set_state("acquired", procedure.acquired());
    }

    /// Start without waiting.
    pub fn start(&self) -> AppResult<()> {
        self.engine.start()
    }

    /// Start and wait for the terminal state.
    pub async fn run(&self) -> AppResult<RunState> {
        self.engine.run().await
    }

    /// Start, wait, and return the acquired data.
    pub async fn scan(&self) -> AppResult<ScanResult> {
        self.engine.execute().await
    }

    /// Wait until the current run ends.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        self.engine.wait_finished(timeout).await
    }

    /// Append the points of `additional` to a finished scan and make it
    /// startable again. Prior rows are kept; the next run acquires only the new
    /// points (and any left over by a stop). Returns the planned point count.
    ///
    /// Only line scans can be extended.
    pub fn extend(&self, additional: ScanSpec) -> AppResult<usize> {
        if !matches!(self.state(), RunState::Complete | RunState::Stopped) {
            return Err(self.reject("extend"));
        }
        additional.validate()?;
        self.check_axes(&additional)?;
        let line = |spec: &ScanSpec| spec.mode == ScanMode::Line;
        if !line(&additional) || !self.spec().as_ref().is_some_and(line) {
            return Err(BeamlineError::InvalidScanSpec(
                "only line scans can be extended".into(),
            ));
        }

        let procedure = self.engine.procedure();
        let total = {
            let mut plan = procedure.plan.write();
            if plan.spec.as_ref().map(|s| s.relative) != Some(additional.relative) {
                return Err(BeamlineError::InvalidScanSpec(
                    "extension must use the same relative mode".into(),
                ));
            }
            plan.points.extend(ScanPoint::plan(&additional));
            plan.extensions.push(additional.clone());
            plan.points.len()
        };
        if let Some(result) = procedure.result.lock().as_mut() {
            result.header.extensions.push(additional);
        }
        self.engine.reset();
        self.publish_plan();
        info!(scan = %self.name(), points = total, "scan extended");
        Ok(total)
    }

    /// Write the result to `directory` using the output template. Safe to repeat;
    /// the file is overwritten. Returns the written path.
    pub fn save(&self, directory: &Path) -> AppResult<PathBuf> {
        let result = self.result().ok_or_else(|| {
            BeamlineError::Record(format!("scan '{}' has no data to save", self.name()))
        })?;
        let template = self
            .spec()
            .map_or_else(|| spec::DEFAULT_TEMPLATE.to_string(), |s| s.output_template);
        let path = directory.join(render_template(&template, &result.header)?);
        record::write(&path, &result)?;
        info!(scan = %self.name(), path = %path.display(), rows = result.len(), "scan saved");
        Ok(path)
    }

    /// Pause the scan whenever the boolean state `state` of `beam` turns false.
    ///
    /// Only a running scan is paused; resuming is left to the caller. Pass the
    /// returned id to [`Object::off`] to detach.
    pub fn pause_on_beam_loss(&self, beam: &Object, state: &str) -> ListenerId {
        let scan = self.clone();
        let watched = state.to_string();
        let source = beam.name().to_string();
        beam.on(EventKind::Changed, move |event| {
            let Event::Changed { name, value } = event else {
                return;
            };
            if *name != watched || value.as_bool() != Some(false) {
                return;
            }
            if scan.state() == RunState::Running && scan.pause() {
                warn!(scan = %scan.name(), beam = %source, "beam lost, scan paused");
            }
        })
    }

    /// Drop the acquired data and return to `idle`, keeping the configuration.
    pub fn finalize(&self) -> AppResult<()> {
        if self.engine.is_busy() {
            return Err(self.reject("finalize"));
        }
        let procedure = self.engine.procedure();
        *procedure.result.lock() = None;
        procedure.plan.write().origin = None;
        self.engine.reset();
        self.engine.object().set_state("progress", 0.0);
        self.publish_plan();
        debug!(scan = %self.name(), "scan finalized");
        Ok(())
    }
}

fn render_template(template: &str, header: &ScanHeader) -> AppResult<String> {
    let vars: HashMap<String, String> = [
        ("name", header.name.clone()),
        ("uid", header.uid.clone()),
        ("date", header.start_time.format("%Y%m%d-%H%M%S").to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    strfmt::strfmt(template, &vars).map_err(|e| BeamlineError::Template(e.to_string()))
}

impl Configurable for BasicScan {
    type Options = ScanSpec;

    /// Validate `spec` and compute the targets. Allowed while not running; a new
    /// spec discards previous data, the same spec is a no-op.
    fn configure(&self, spec: ScanSpec) -> AppResult<()> {
        spec.validate()?;
        self.check_axes(&spec)?;
        if self.engine.is_busy() {
            return Err(self.reject("configure"));
        }

        let procedure = self.engine.procedure();
        {
            let mut plan = procedure.plan.write();
            if plan.spec.as_ref() == Some(&spec) {
                return Ok(());
            }
            *plan = Plan {
                points: ScanPoint::plan(&spec),
                spec: Some(spec),
                ..Plan::default()
            };
        }
        *procedure.result.lock() = None;
        self.engine.reset();
        self.engine.object().set_state("progress", 0.0);
        self.publish_plan();
        info!(scan = %self.name(), points = self.targets().len(), "scan configured");
        Ok(())
    }
}

impl Pausable for BasicScan {
    fn pause(&self) -> bool {
        self.engine.pause()
    }

    fn resume(&self) -> bool {
        self.engine.resume()
    }

    fn stop(&self) -> bool {
        self.engine.stop()
    }
}

impl Waitable for BasicScan {
    fn object(&self) -> &Object {
        self.engine.object()
    }
}
