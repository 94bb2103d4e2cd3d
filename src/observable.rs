//! Observable objects
//!
//! [`Object`] is the base of every device and engine: a set of named state slots
//! plus an ordered list of listeners. Writes are observable only through events.
//!
//! # Features
//!
//! - Last-write-wins state slots; reading a name that was never declared or set fails
//!   with [`BeamlineError::UnknownState`]
//! - Synchronous delivery on the emitting context, in registration order
//! - Typed subscriptions keyed by [`EventKind`]
//! - Timeout-bounded waits on a state predicate that suspend only the caller
//!
//! # Threading
//!
//! Emission is serialized per object by a re-entrant lock, so every observer sees
//! `changed` events in the same order the values were stored. A listener may call
//! back into the same object from the delivery context. A slow listener delays all
//! later listeners of that emission; callers needing non-blocking fan-out must hop
//! to their own task. A deployment may designate a single context (e.g., a UI loop)
//! as the only place listeners are registered; this is not enforced here.
//!
//! # Example
//!
//! ```rust,ignore
//! let obj = Object::new("shutter");
//! obj.declare("open", false);
//!
//! let id = obj.on(EventKind::Changed, |event| println!("{event:?}"));
//! obj.set_state("open", true);
//!
//! // Wait for the state to satisfy a predicate, or give up after 5s
//! let opened = obj.wait_for("open", |v| v.as_bool() == Some(true), Duration::from_secs(5)).await;
//! obj.off(id);
//! ```

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::core::{Event, EventKind, StateValue};
use crate::error::{AppResult, BeamlineError};

/// Listener callback type.
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`Object::on`], used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    kind: EventKind,
    callback: Callback,
}

struct ObjectInner {
    name: String,
    states: RwLock<HashMap<String, StateValue>>,
    listeners: RwLock<Vec<Listener>>,
    next_listener: AtomicU64,
    /// Serializes store + delivery so observers see writes in store order
    emission: ReentrantMutex<()>,
    /// Bumped on every state write; waiters subscribe to it
    revision: watch::Sender<u64>,
}

/// Named state slots with ordered event delivery.
///
/// `Object` is a cheap handle: clones share the same states and listeners.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("name", &self.inner.name)
            .field("states", &self.inner.states.read().len())
            .field("listeners", &self.inner.listeners.read().len())
            .finish()
    }
}

impl Object {
    /// Create an object with no states and no listeners.
    pub fn new(name: impl Into<String>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(ObjectInner {
                name: name.into(),
                states: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                emission: ReentrantMutex::new(()),
                revision,
            }),
        }
    }

    /// Object name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Initialise a state slot without emitting. Intended for construction.
    pub fn declare(&self, name: &str, value: impl Into<StateValue>) {
        self.inner
            .states
            .write()
            .insert(name.to_string(), value.into());
    }

    /// Store a value and emit `changed(name, value)` to every `Changed` listener.
    pub fn set_state(&self, name: &str, value: impl Into<StateValue>) {
        let value = value.into();
        let _guard = self.inner.emission.lock();
        trace!(object = %self.inner.name, state = name, value = %value, "set_state");
        self.inner
            .states
            .write()
            .insert(name.to_string(), value.clone());
        self.inner.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
        self.deliver(&Event::Changed {
            name: name.to_string(),
            value,
        });
    }

    /// Current value of a state slot.
    pub fn get_state(&self, name: &str) -> AppResult<StateValue> {
        self.inner
            .states
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BeamlineError::UnknownState {
                object: self.inner.name.clone(),
                name: name.to_string(),
            })
    }

    /// True if the slot was declared or set.
    pub fn has_state(&self, name: &str) -> bool {
        self.inner.states.read().contains_key(name)
    }

    /// Copy of all state slots, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, StateValue> {
        self.inner
            .states
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Emit an event that carries no persisted value.
    pub fn emit(&self, event: Event) {
        let _guard = self.inner.emission.lock();
        self.deliver(&event);
    }

    /// Subscribe to one kind of event. Listeners run in registration order.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push(Listener {
            id,
            kind,
            callback: Arc::new(callback),
        });
        id
    }

    /// Unsubscribe. Returns false if the listener was already removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner
            .listeners
            .read()
            .iter()
            .filter(|l| l.kind == kind)
            .count()
    }

    /// Hold the emission lock across a multi-step update so observers never see
    /// a partially applied transition.
    pub(crate) fn hold(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.emission.lock()
    }

    fn deliver(&self, event: &Event) {
        let kind = event.kind();
        // Snapshot so callbacks may subscribe/unsubscribe while we deliver.
        let targets: Vec<Callback> = self
            .inner
            .listeners
            .read()
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| Arc::clone(&l.callback))
            .collect();
        for callback in targets {
            callback(event);
        }
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Suspend the caller until `name` satisfies `predicate` or `timeout` elapses.
    ///
    /// Returns `true` as soon as the predicate holds (immediately if it already does,
    /// even with a zero timeout) and `false` on timeout. An undeclared state counts
    /// as not satisfied.
    pub async fn wait_for<F>(&self, name: &str, predicate: F, timeout: Duration) -> bool
    where
        F: Fn(&StateValue) -> bool,
    {
        let mut rx = self.inner.revision.subscribe();
        rx.borrow_and_update();
        let satisfied = || {
            self.inner
                .states
                .read()
                .get(name)
                .map(&predicate)
                .unwrap_or(false)
        };
        if satisfied() {
            return true;
        }

        let waiting = async {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if satisfied() {
                    return true;
                }
            }
        };
        match tokio::time::timeout(timeout, waiting).await {
            Ok(attained) => attained,
            Err(_) => {
                debug!(object = %self.inner.name, state = name, ?timeout, "wait timed out");
                false
            }
        }
    }

    /// Wait until `name` equals any of `values`.
    pub async fn wait_until(&self, name: &str, values: &[StateValue], timeout: Duration) -> bool {
        self.wait_for(name, |v| values.contains(v), timeout).await
    }

    /// Wait while `name` equals any of `values`.
    pub async fn wait_while(&self, name: &str, values: &[StateValue], timeout: Duration) -> bool {
        self.wait_for(name, |v| !values.contains(v), timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_last_write_wins_with_one_event_per_call() {
        let obj = Object::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        obj.on(EventKind::Changed, move |event| {
            if let Event::Changed { name, value } = event {
                sink.lock().push((name.clone(), value.clone()));
            }
        });

        for i in 0..5_i64 {
            obj.set_state("counter", i);
        }
        obj.set_state("other", "x");
        obj.set_state("counter", 42_i64);

        assert_eq!(obj.get_state("counter").unwrap(), StateValue::Int(42));
        let seen = seen.lock();
        assert_eq!(seen.len(), 7);
        let counters: Vec<i64> = seen
            .iter()
            .filter(|(n, _)| n == "counter")
            .filter_map(|(_, v)| v.as_f64().map(|f| f as i64))
            .collect();
        assert_eq!(counters, vec![0, 1, 2, 3, 4, 42]);
    }

    #[test]
    fn test_unknown_state_is_an_error() {
        let obj = Object::new("shutter");
        let err = obj.get_state("open").unwrap_err();
        assert!(matches!(err, BeamlineError::UnknownState { .. }));

        obj.declare("open", false);
        assert_eq!(obj.get_state("open").unwrap(), StateValue::Bool(false));
    }

    #[test]
    fn test_declare_does_not_emit() {
        let obj = Object::new("quiet");
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        obj.on(EventKind::Changed, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        obj.declare("x", 1.0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let obj = Object::new("ordered");
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            obj.on(EventKind::Message, move |_| order.lock().push(tag));
        }
        obj.emit(Event::Message("hello".into()));
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_emit_only_reaches_matching_kind() {
        let obj = Object::new("kinds");
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        obj.on(EventKind::Closed, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        obj.emit(Event::Message("ignored".into()));
        obj.set_state("busy", true);
        obj.emit(Event::Closed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // explicit events never persist a value
        assert!(!obj.has_state("closed"));
    }

    #[test]
    fn test_off_is_idempotent() {
        let obj = Object::new("subs");
        let id = obj.on(EventKind::Changed, |_| {});
        assert_eq!(obj.listener_count(EventKind::Changed), 1);
        assert!(obj.off(id));
        assert!(!obj.off(id));
        assert_eq!(obj.listener_count(EventKind::Changed), 0);
    }

    #[test]
    fn test_listener_may_reenter_object() {
        let obj = Object::new("reentrant");
        let handle = obj.clone();
        obj.on(EventKind::Changed, move |event| {
            if let Event::Changed { name, .. } = event {
                if name == "a" {
                    handle.set_state("b", true);
                }
            }
        });
        obj.set_state("a", 1_i64);
        assert_eq!(obj.get_state("b").unwrap(), StateValue::Bool(true));
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_satisfied() {
        let obj = Object::new("ready");
        obj.declare("ready", true);
        let ok = obj
            .wait_for("ready", |v| v.as_bool() == Some(true), Duration::ZERO)
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_wait_times_out_with_false() {
        let obj = Object::new("never");
        obj.declare("ready", false);
        let start = std::time::Instant::now();
        let ok = obj
            .wait_until("ready", &[true.into()], Duration::from_millis(50))
            .await;
        assert!(!ok);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_change() {
        let obj = Object::new("later");
        obj.declare("position", 0.0);
        let writer = obj.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set_state("position", 5.0);
        });
        let ok = obj
            .wait_for(
                "position",
                |v| v.as_f64().map_or(false, |p| p > 4.0),
                Duration::from_secs(2),
            )
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_wait_while() {
        let obj = Object::new("busy");
        obj.declare("busy", true);
        let writer = obj.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.set_state("busy", false);
        });
        assert!(
            obj.wait_while("busy", &[true.into()], Duration::from_secs(2))
                .await
        );
    }
}
