//! Scan specification and target computation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{AppResult, BeamlineError};

/// Default output file name template.
pub const DEFAULT_TEMPLATE: &str = "{name}_{date}.xdi";

/// Default time allowed for a positioner to reach a target.
pub const DEFAULT_MOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default "reached target" tolerance in positioner units.
pub const DEFAULT_TOLERANCE: f64 = 1e-3;

/// Upper bound on the points a single spec may plan.
pub const MAX_POINTS: usize = 100_000;

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

fn default_move_timeout() -> Duration {
    DEFAULT_MOVE_TIMEOUT
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

/// Range of a secondary axis moved in lockstep with the primary one.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    /// First target
    pub start: f64,
    /// Last target
    pub end: f64,
}

/// How the targets of a spec are laid out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// All axes advance together, one point per step
    #[default]
    Line,
    /// Every primary target at every target of the secondary axis; `steps²` points
    Grid,
    /// One sweep from start to end, counting until the positioner stops
    Continuous,
}

/// Parameters of a scan.
///
/// All axes share `steps`; axis `k` of point `i` is
/// `start_k + i * (end_k - start_k) / (steps - 1)`, or `start_k` for a single step.
/// A grid walks the primary axis fastest. A continuous sweep does not use `steps`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanSpec {
    /// First target of the primary axis
    pub start: f64,
    /// Last target of the primary axis
    pub end: f64,
    /// Number of points
    pub steps: usize,
    /// Counting time per point
    #[serde(with = "humantime_serde")]
    pub dwell: Duration,
    /// Output file name template (`{name}`, `{uid}`, `{date}`)
    #[serde(default = "default_template")]
    pub output_template: String,
    /// Secondary axes, one per extra positioner
    #[serde(default)]
    pub axes: Vec<AxisRange>,
    /// Ranges are offsets from the positions read when the scan starts
    #[serde(default)]
    pub relative: bool,
    /// Time allowed for each move
    #[serde(default = "default_move_timeout", with = "humantime_serde")]
    pub move_timeout: Duration,
    /// Accepted distance from the target after a move
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Target layout
    #[serde(default)]
    pub mode: ScanMode,
}

impl ScanSpec {
    /// Single-axis absolute scan with default template, timeout and tolerance.
    pub fn new(start: f64, end: f64, steps: usize, dwell: Duration) -> Self {
        Self {
            start,
            end,
            steps,
            dwell,
            output_template: default_template(),
            axes: Vec::new(),
            relative: false,
            move_timeout: DEFAULT_MOVE_TIMEOUT,
            tolerance: DEFAULT_TOLERANCE,
            mode: ScanMode::Line,
        }
    }

    /// Cover the plane of the primary axis and one secondary axis.
    pub fn grid(mut self, start: f64, end: f64) -> Self {
        self.axes = vec![AxisRange { start, end }];
        self.mode = ScanMode::Grid;
        self
    }

    /// Sweep the primary axis once and count while it moves.
    pub fn continuous(mut self) -> Self {
        self.mode = ScanMode::Continuous;
        self
    }

    /// Add a secondary axis.
    pub fn with_axis(mut self, start: f64, end: f64) -> Self {
        self.axes.push(AxisRange { start, end });
        self
    }

    /// Interpret ranges relative to the starting positions.
    pub fn relative(mut self) -> Self {
        self.relative = true;
        self
    }

    /// Use a custom output template.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.output_template = template.into();
        self
    }

    /// Override move timeout and tolerance.
    pub fn with_motion(mut self, move_timeout: Duration, tolerance: f64) -> Self {
        self.move_timeout = move_timeout;
        self.tolerance = tolerance;
        self
    }

    /// Number of positioners this spec drives.
    pub fn axis_count(&self) -> usize {
        1 + self.axes.len()
    }

    /// Points planned by this spec; a continuous sweep plans none.
    pub fn point_count(&self) -> usize {
        match self.mode {
            ScanMode::Line => self.steps,
            ScanMode::Grid => self.steps.saturating_mul(self.steps),
            ScanMode::Continuous => 0,
        }
    }

    /// Check ranges, timing and template.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(BeamlineError::InvalidScanSpec(msg));
        if self.steps < 1 {
            return invalid("step count must be at least 1".into());
        }
        if self.point_count() > MAX_POINTS {
            return invalid(format!(
                "{} points exceed the limit of {MAX_POINTS}",
                self.point_count()
            ));
        }
        let bounds = std::iter::once((self.start, self.end))
            .chain(self.axes.iter().map(|a| (a.start, a.end)));
        for (start, end) in bounds {
            if !start.is_finite() || !end.is_finite() {
                return invalid(format!("range {start}..{end} is not finite"));
            }
        }
        if self.steps > 1 && self.start == self.end {
            return invalid(format!(
                "start equals end ({}) with {} steps",
                self.start, self.steps
            ));
        }
        match self.mode {
            ScanMode::Line => {}
            ScanMode::Grid => {
                let [axis] = self.axes.as_slice() else {
                    return invalid(format!(
                        "a grid needs exactly 2 axes, got {}",
                        self.axis_count()
                    ));
                };
                if self.steps > 1 && axis.start == axis.end {
                    return invalid(format!("grid axis start equals end ({})", axis.start));
                }
            }
            ScanMode::Continuous => {
                if !self.axes.is_empty() {
                    return invalid("a continuous sweep drives a single axis".into());
                }
                if self.start == self.end {
                    return invalid(format!("sweep start equals end ({})", self.start));
                }
            }
        }
        if self.dwell.is_zero() {
            return invalid("dwell time must be positive".into());
        }
        if self.move_timeout.is_zero() {
            return invalid("move timeout must be positive".into());
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return invalid(format!("tolerance {} must be positive", self.tolerance));
        }
        let sample: HashMap<String, &str> = [("name", "scan"), ("uid", "0"), ("date", "0")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        if self.output_template.trim().is_empty() {
            return invalid("output template is empty".into());
        }
        if let Err(e) = strfmt::strfmt(&self.output_template, &sample) {
            return invalid(format!("output template '{}': {}", self.output_template, e));
        }
        Ok(())
    }

    /// Target of every axis for every point, in acquisition order.
    ///
    /// A continuous sweep yields its two endpoints.
    pub fn targets(&self) -> Vec<Vec<f64>> {
        match self.mode {
            ScanMode::Line => self.lockstep_targets(),
            ScanMode::Grid => self.grid_targets(),
            ScanMode::Continuous => vec![vec![self.start], vec![self.end]],
        }
    }

    fn grid_targets(&self) -> Vec<Vec<f64>> {
        let Some(slow) = self.axes.first() else {
            return self.lockstep_targets();
        };
        (0..self.steps)
            .flat_map(|j| {
                let outer = interpolate(slow.start, slow.end, self.steps, j);
                (0..self.steps)
                    .map(move |i| vec![interpolate(self.start, self.end, self.steps, i), outer])
            })
            .collect()
    }

    fn lockstep_targets(&self) -> Vec<Vec<f64>> {
        let ranges: Vec<(f64, f64)> = std::iter::once((self.start, self.end))
            .chain(self.axes.iter().map(|a| (a.start, a.end)))
            .collect();
        (0..self.steps)
            .map(|i| {
                ranges
                    .iter()
                    .map(|&(start, end)| interpolate(start, end, self.steps, i))
                    .collect()
            })
            .collect()
    }
}

fn interpolate(start: f64, end: f64, steps: usize, index: usize) -> f64 {
    if steps <= 1 {
        start
    } else {
        start + index as f64 * (end - start) / (steps - 1) as f64
    }
}
