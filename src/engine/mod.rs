//! Engines: controllable long-running tasks.
//!
//! An [`Engine`] drives a [`Procedure`] through the run-state machine:
//!
//! ```text
//! idle --start--> preparing --> running <--pause/resume--> paused
//!                     |            |                          |
//!                     +----stop----+-----------stop-----------+--> stopping --> stopped
//!                                  +--> complete
//! any non-terminal state --error--> failed
//! ```
//!
//! Terminal states (`stopped`, `complete`, `failed`) are sticky until [`Engine::reset`].
//!
//! # Cancellation
//!
//! Pause and stop requests are written to a shared `watch` channel. The procedure
//! observes them only at [`Checkpoint::reached`], which it calls between discrete
//! units of work (one scan point, one mechanical step). While paused, the checkpoint
//! suspends the procedure until `resume` or `stop` arrives.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::core::Event;
use crate::error::{AppResult, BeamlineError};
use crate::observable::Object;
use crate::traits::{Pausable, Waitable};

/// Run state of an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Ready to start
    Idle,
    /// Start accepted, acquiring resources
    Preparing,
    /// Executing
    Running,
    /// Suspended at a checkpoint
    Paused,
    /// Stop requested, waiting for the next checkpoint
    Stopping,
    /// Ended early on request
    Stopped,
    /// Ran to completion
    Complete,
    /// Ended on an unrecoverable error
    Failed,
}

impl RunState {
    /// `stopped`, `complete` or `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Stopped | RunState::Complete | RunState::Failed)
    }

    /// Work is in progress (preparing through stopping).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunState::Preparing | RunState::Running | RunState::Paused | RunState::Stopping
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Preparing => "preparing",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopping => "stopping",
            RunState::Stopped => "stopped",
            RunState::Complete => "complete",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle notifications emitted as [`Event::Engine`].
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// Left `idle`
    Started,
    /// Entered `paused`
    Paused,
    /// Left `paused`
    Resumed,
    /// Entered `stopped`
    Stopped,
    /// Entered `complete`
    Done,
    /// Entered `failed`, with the reason
    Failed(String),
}

/// Decision returned by a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Proceed with the next unit of work
    Continue,
    /// Wind down, keeping what was done so far
    Stop,
}

/// Cooperative cancellation token handed to a running procedure.
#[derive(Clone)]
pub struct Checkpoint {
    control: watch::Receiver<RunState>,
    object: Object,
}

impl Checkpoint {
    /// Observe pending pause/stop requests.
    ///
    /// Returns immediately while running; suspends while paused until the engine
    /// is resumed or stopped.
    pub async fn reached(&self) -> Flow {
        let mut control = self.control.clone();
        let state = match control.wait_for(|state| *state != RunState::Paused).await {
            Ok(state) => *state,
            Err(_) => RunState::Stopping,
        };
        if state == RunState::Running || state == RunState::Preparing {
            Flow::Continue
        } else {
            debug!(engine = %self.object.name(), %state, "checkpoint stop");
            Flow::Stop
        }
    }

    /// True once a stop has been requested. Never blocks.
    pub fn stop_requested(&self) -> bool {
        !matches!(
            *self.control.borrow(),
            RunState::Preparing | RunState::Running | RunState::Paused
        )
    }

    /// True while the engine is paused. Never blocks.
    pub fn pause_requested(&self) -> bool {
        *self.control.borrow() == RunState::Paused
    }

    /// Engine object, for emitting progress events.
    pub fn object(&self) -> &Object {
        &self.object
    }
}

/// Work driven by an [`Engine`].
#[async_trait]
pub trait Procedure: Send + Sync + 'static {
    /// Artifact produced by a run
    type Output: Clone + Send + Sync + 'static;

    /// Acquire resources before running. Called in `preparing`.
    async fn prepare(&self) -> AppResult<()> {
        Ok(())
    }

    /// Perform the work, calling `checkpoint.reached()` between units of work.
    ///
    /// On [`Flow::Stop`] the procedure returns what it has so far.
    async fn execute(&self, checkpoint: &Checkpoint) -> AppResult<Self::Output>;
}

struct EngineInner<P: Procedure> {
    object: Object,
    procedure: Arc<P>,
    control: watch::Sender<RunState>,
    result: Mutex<Option<P::Output>>,
    error: Mutex<Option<BeamlineError>>,
    failure: Mutex<Option<String>>,
}

/// Handle to an engine. Clones share the same run.
pub struct Engine<P: Procedure> {
    inner: Arc<EngineInner<P>>,
}

impl<P: Procedure> Clone for Engine<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Procedure> fmt::Debug for Engine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl<P: Procedure> Engine<P> {
    /// Create an idle engine around `procedure`.
    pub fn new(name: impl Into<String>, procedure: P) -> Self {
        let object = Object::new(name);
        object.declare("run_state", RunState::Idle);
        object.declare("busy", false);
        let (control, _) = watch::channel(RunState::Idle);
        Self {
            inner: Arc::new(EngineInner {
                object,
                procedure: Arc::new(procedure),
                control,
                result: Mutex::new(None),
                error: Mutex::new(None),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Engine name.
    pub fn name(&self) -> &str {
        self.inner.object.name()
    }

    /// Underlying observable object.
    pub fn object(&self) -> &Object {
        &self.inner.object
    }

    /// The driven procedure.
    pub fn procedure(&self) -> &P {
        &self.inner.procedure
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        *self.inner.control.borrow()
    }

    /// Preparing, running, paused or stopping.
    pub fn is_busy(&self) -> bool {
        self.state().is_active()
    }

    /// Suspended at a checkpoint.
    pub fn is_paused(&self) -> bool {
        self.state() == RunState::Paused
    }

    /// Stop requested or completed.
    pub fn is_stopped(&self) -> bool {
        matches!(self.state(), RunState::Stopping | RunState::Stopped)
    }

    /// Artifact of the last run, if it produced one.
    pub fn result(&self) -> Option<P::Output> {
        self.inner.result.lock().clone()
    }

    /// Reason the last run failed. Kept until the next `start` or `reset`.
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().clone()
    }

    /// Apply `next` to the current state atomically. Returns `(from, to)` when a
    /// transition happened; observers see `run_state` change in the same order.
    fn transition<F>(&self, next: F) -> Option<(RunState, RunState)>
    where
        F: FnOnce(RunState) -> Option<RunState>,
    {
        let _hold = self.inner.object.hold();
        let mut moved = None;
        self.inner.control.send_if_modified(|state| match next(*state) {
            Some(to) if to != *state => {
                moved = Some((*state, to));
                *state = to;
                true
            }
            _ => false,
        });
        if let Some((from, to)) = moved {
            info!(engine = %self.name(), %from, %to, "run state");
            self.inner.object.set_state("run_state", to);
            if from.is_active() != to.is_active() {
                self.inner.object.set_state("busy", to.is_active());
            }
        }
        moved
    }

    fn notify(&self, event: EngineEvent) {
        self.inner.object.emit(Event::Engine(event));
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            control: self.inner.control.subscribe(),
            object: self.inner.object.clone(),
        }
    }

    /// Begin a run without waiting for it. Only valid from `idle`.
    pub fn start(&self) -> AppResult<()> {
        if self
            .transition(|state| (state == RunState::Idle).then_some(RunState::Preparing))
            .is_none()
        {
            return Err(BeamlineError::EngineState {
                engine: self.name().to_string(),
                action: "start",
                state: self.state().to_string(),
            });
        }
        *self.inner.result.lock() = None;
        self.clear_failure();
        self.notify(EngineEvent::Started);

        let engine = self.clone();
        tokio::spawn(async move { engine.drive().await });
        Ok(())
    }

    async fn drive(&self) {
        if let Err(e) = self.inner.procedure.prepare().await {
            self.fail(e);
            return;
        }
        let running = self.transition(|state| (state == RunState::Preparing).then_some(RunState::Running));
        if running.is_none() {
            self.finish_stopped();
            return;
        }

        match self.inner.procedure.execute(&self.checkpoint()).await {
            Ok(output) => {
                *self.inner.result.lock() = Some(output);
                if !self.finish_stopped() {
                    let done = self.transition(|state| {
                        matches!(state, RunState::Running | RunState::Paused)
                            .then_some(RunState::Complete)
                    });
                    if done.is_some() {
                        self.notify(EngineEvent::Done);
                    }
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn finish_stopped(&self) -> bool {
        let stopped = self
            .transition(|state| (state == RunState::Stopping).then_some(RunState::Stopped))
            .is_some();
        if stopped {
            self.notify(EngineEvent::Stopped);
        }
        stopped
    }

    fn fail(&self, e: BeamlineError) {
        let reason = e.to_string();
        error!(engine = %self.name(), error = %reason, "engine failed");
        // the cause must be in place before `failed` wakes any waiter
        *self.inner.failure.lock() = Some(reason.clone());
        *self.inner.error.lock() = Some(e);
        if self
            .transition(|state| (!state.is_terminal()).then_some(RunState::Failed))
            .is_some()
        {
            self.notify(EngineEvent::Failed(reason));
        } else {
            self.clear_failure();
        }
    }

    fn clear_failure(&self) {
        *self.inner.error.lock() = None;
        *self.inner.failure.lock() = None;
    }

    /// Leave a terminal state for `idle`. Returns false from any other state.
    pub fn reset(&self) -> bool {
        let reset = self
            .transition(|state| state.is_terminal().then_some(RunState::Idle))
            .is_some();
        if reset {
            self.clear_failure();
        }
        reset
    }

    async fn wait_terminal(&self) -> RunState {
        let mut control = self.inner.control.subscribe();
        let state = match control.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Wait until the current run reaches a terminal state.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_terminal())
            .await
            .is_ok()
    }

    /// Start and wait for the terminal state.
    pub async fn run(&self) -> AppResult<RunState> {
        self.start()?;
        Ok(self.wait_terminal().await)
    }

    /// Start, wait, and return the run's artifact.
    ///
    /// A stopped run still yields its partial artifact; a failed run returns the
    /// error that ended it. The typed error goes to the first caller that asks;
    /// later callers get [`BeamlineError::RunFailed`] with the same reason.
    pub async fn execute(&self) -> AppResult<P::Output> {
        let finished = self.run().await?;
        if finished == RunState::Failed {
            let cause = self.inner.error.lock().take();
            return Err(cause.unwrap_or_else(|| BeamlineError::RunFailed {
                engine: self.name().to_string(),
                reason: self.failure().unwrap_or_default(),
            }));
        }
        self.result().ok_or_else(|| BeamlineError::EngineState {
            engine: self.name().to_string(),
            action: "execute",
            state: finished.to_string(),
        })
    }
}

impl<P: Procedure> Pausable for Engine<P> {
    fn pause(&self) -> bool {
        let paused = self
            .transition(|state| (state == RunState::Running).then_some(RunState::Paused))
            .is_some();
        if paused {
            self.notify(EngineEvent::Paused);
        }
        paused
    }

    fn resume(&self) -> bool {
        let resumed = self
            .transition(|state| (state == RunState::Paused).then_some(RunState::Running))
            .is_some();
        if resumed {
            self.notify(EngineEvent::Resumed);
        }
        resumed
    }

    fn stop(&self) -> bool {
        let moved = self.transition(|state| match state {
            RunState::Idle => Some(RunState::Stopped),
            RunState::Preparing | RunState::Running | RunState::Paused => Some(RunState::Stopping),
            _ => None,
        });
        if let Some((_, RunState::Stopped)) = moved {
            self.notify(EngineEvent::Stopped);
        }
        moved.is_some()
    }
}

impl<P: Procedure> Waitable for Engine<P> {
    fn object(&self) -> &Object {
        &self.inner.object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counts units of work, one checkpoint per unit.
    struct Counting {
        units: usize,
        done: AtomicUsize,
        fail_at: Option<usize>,
        prepare_delay: Duration,
        prepare_fails: bool,
        prepared: AtomicBool,
    }

    impl Counting {
        fn new(units: usize) -> Self {
            Self {
                units,
                done: AtomicUsize::new(0),
                fail_at: None,
                prepare_delay: Duration::ZERO,
                prepare_fails: false,
                prepared: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Procedure for Counting {
        type Output = usize;

        async fn prepare(&self) -> AppResult<()> {
            tokio::time::sleep(self.prepare_delay).await;
            if self.prepare_fails {
                return Err(BeamlineError::NotReady {
                    device: "count".into(),
                    state: "disabled".into(),
                });
            }
            self.prepared.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(&self, checkpoint: &Checkpoint) -> AppResult<usize> {
            while self.done.load(Ordering::SeqCst) < self.units {
                if checkpoint.reached().await == Flow::Stop {
                    break;
                }
                let unit = self.done.load(Ordering::SeqCst);
                if self.fail_at == Some(unit) {
                    return Err(BeamlineError::Hardware(anyhow::anyhow!("unit {unit} broke")));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.done.fetch_add(1, Ordering::SeqCst);
            }
            Ok(self.done.load(Ordering::SeqCst))
        }
    }

    fn record_events<P: Procedure>(engine: &Engine<P>) -> Arc<Mutex<Vec<EngineEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        engine.object().on(EventKind::Engine, move |event| {
            if let Event::Engine(e) = event {
                sink.lock().push(e.clone());
            }
        });
        events
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let engine = Engine::new("count", Counting::new(4));
        let events = record_events(&engine);
        let finished = engine.run().await.unwrap();
        assert_eq!(finished, RunState::Complete);
        assert_eq!(engine.result(), Some(4));
        assert!(engine.procedure().prepared.load(Ordering::SeqCst));
        assert_eq!(*events.lock(), vec![EngineEvent::Started, EngineEvent::Done]);
        assert_eq!(
            engine.object().get_state("run_state").unwrap().as_run_state(),
            Some(RunState::Complete)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_execute_reports_prepare_failure_cause() {
        let mut procedure = Counting::new(3);
        procedure.prepare_fails = true;
        let engine = Engine::new("count", procedure);

        for _ in 0..50 {
            let err = engine.execute().await.unwrap_err();
            assert!(
                matches!(err, BeamlineError::NotReady { .. }),
                "unexpected error: {err}"
            );
            assert_eq!(engine.state(), RunState::Failed);

            // the typed cause went to execute(); the reason stays readable
            let reason = engine.failure().unwrap();
            assert!(reason.contains("disabled"));
            assert!(engine.reset());
            assert_eq!(engine.failure(), None);
        }
    }

    #[tokio::test]
    async fn test_execute_returns_artifact() {
        let engine = Engine::new("count", Counting::new(2));
        assert_eq!(engine.execute().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_start_requires_idle() {
        let engine = Engine::new("count", Counting::new(1));
        engine.run().await.unwrap();
        let err = engine.start().unwrap_err();
        assert!(matches!(err, BeamlineError::EngineState { action: "start", .. }));

        assert!(engine.reset());
        assert_eq!(engine.state(), RunState::Idle);
        assert!(!engine.reset());
    }

    #[tokio::test]
    async fn test_pause_and_resume_from_wrong_state_are_noops() {
        let engine = Engine::new("count", Counting::new(1));
        assert!(!engine.pause());
        assert!(!engine.resume());
        assert_eq!(engine.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let engine = Engine::new("count", Counting::new(1000));
        let events = record_events(&engine);
        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(engine.stop());
        assert!(!engine.stop());
        assert!(engine.wait_finished(Duration::from_secs(2)).await);
        assert_eq!(engine.state(), RunState::Stopped);
        assert!(!engine.stop());

        let partial = engine.result().unwrap();
        assert!(partial > 0 && partial < 1000);
        let stopped = events
            .lock()
            .iter()
            .filter(|e| **e == EngineEvent::Stopped)
            .count();
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn test_stop_from_idle_is_terminal() {
        let engine = Engine::new("count", Counting::new(1));
        assert!(engine.stop());
        assert_eq!(engine.state(), RunState::Stopped);
        assert!(engine.start().is_err());
    }

    #[tokio::test]
    async fn test_stop_while_preparing() {
        let mut procedure = Counting::new(10);
        procedure.prepare_delay = Duration::from_millis(30);
        let engine = Engine::new("count", procedure);
        engine.start().unwrap();
        assert_eq!(engine.state(), RunState::Preparing);
        assert!(engine.stop());
        assert!(engine.wait_finished(Duration::from_secs(2)).await);
        assert_eq!(engine.state(), RunState::Stopped);
        assert_eq!(engine.procedure().done.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pause_holds_at_checkpoint() {
        let engine = Engine::new("count", Counting::new(50));
        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.pause());
        assert!(!engine.pause());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let held = engine.procedure().done.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(engine.procedure().done.load(Ordering::SeqCst), held);
        assert!(engine.is_paused());

        assert!(engine.resume());
        assert!(engine.wait_finished(Duration::from_secs(5)).await);
        assert_eq!(engine.state(), RunState::Complete);
        assert_eq!(engine.result(), Some(50));
    }

    #[tokio::test]
    async fn test_stop_releases_paused_engine() {
        let engine = Engine::new("count", Counting::new(100));
        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(engine.pause());
        assert!(engine.stop());
        assert!(engine.wait_finished(Duration::from_secs(2)).await);
        assert_eq!(engine.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_failure_is_sticky_and_reported() {
        let mut procedure = Counting::new(10);
        procedure.fail_at = Some(3);
        let engine = Engine::new("count", procedure);
        let events = record_events(&engine);

        let err = engine.execute().await.unwrap_err();
        assert!(matches!(err, BeamlineError::Hardware(_)));
        assert_eq!(engine.state(), RunState::Failed);
        assert!(!engine.pause());
        assert!(!engine.stop());
        assert!(events
            .lock()
            .iter()
            .any(|e| matches!(e, EngineEvent::Failed(reason) if reason.contains("unit 3"))));
    }

    #[tokio::test]
    async fn test_zero_timeout_wait_on_terminal_state() {
        let engine = Engine::new("count", Counting::new(1));
        engine.run().await.unwrap();
        assert!(engine.wait_finished(Duration::ZERO).await);
        let done = engine
            .wait_until("run_state", &[RunState::Complete.into()], Duration::ZERO)
            .await;
        assert!(done);
    }
}
