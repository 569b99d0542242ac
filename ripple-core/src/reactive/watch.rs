//! Watchers
//!
//! [`watch`] observes a source and calls back with the new and previous
//! value after it changes. [`watch_effect`] re-runs a function whenever
//! anything it read changes.
//!
//! Watchers are always deferred. A change queues the watcher's job in the
//! batched scheduler, so the callback runs on the next flush and sees every
//! write made before it, once.
//!
//! # Sources
//!
//! | Source | Observed |
//! |--------|----------|
//! | getter | whatever the getter reads |
//! | ref / computed | its value |
//! | proxy | its properties (all levels with `deep`, else the top level) |
//! | anything else | nothing; only `immediate` ever fires |

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::computed::Computed;
use super::context::untracked;
use super::effect::Computation;
use super::proxy::Reactive;
use super::refs::Ref;
use crate::error::ReactiveError;
use crate::scheduler::{cancel_job, queue_job, Job};
use crate::value::Value;

type Getter = Rc<dyn Fn() -> Value>;
type Callback = Box<dyn Fn(&Value, Option<&Value>, &OnCleanup)>;

/// What a watcher observes.
#[derive(Clone)]
pub enum WatchSource {
    Getter(Getter),
    Ref(Ref),
    Computed(Computed),
    Reactive(Reactive),
    Static(Value),
}

impl WatchSource {
    pub fn getter<F, R>(f: F) -> Self
    where
        F: Fn() -> R + 'static,
        R: Into<Value>,
    {
        WatchSource::Getter(Rc::new(move || f().into()))
    }

    fn into_getter(self, deep: bool) -> Getter {
        let depth = if deep { usize::MAX } else { 1 };
        let traverse_result = move |value: Value| {
            if deep {
                traverse(&value, usize::MAX, &mut HashSet::new());
            }
            value
        };

        match self {
            WatchSource::Getter(getter) => Rc::new(move || traverse_result(getter())),
            WatchSource::Ref(r) => Rc::new(move || traverse_result(r.get())),
            WatchSource::Computed(c) => Rc::new(move || traverse_result(c.get())),
            WatchSource::Reactive(proxy) => Rc::new(move || {
                let value = Value::Reactive(proxy.clone());
                traverse(&value, depth, &mut HashSet::new());
                value
            }),
            WatchSource::Static(value) => Rc::new(move || value.clone()),
        }
    }
}

impl From<Value> for WatchSource {
    fn from(value: Value) -> Self {
        match value {
            Value::Reactive(proxy) => WatchSource::Reactive(proxy),
            Value::Ref(r) => WatchSource::Ref(r),
            other => WatchSource::Static(other),
        }
    }
}

impl From<Ref> for WatchSource {
    fn from(r: Ref) -> Self {
        WatchSource::Ref(r)
    }
}

impl From<Computed> for WatchSource {
    fn from(c: Computed) -> Self {
        WatchSource::Computed(c)
    }
}

impl From<Reactive> for WatchSource {
    fn from(proxy: Reactive) -> Self {
        WatchSource::Reactive(proxy)
    }
}

impl fmt::Debug for WatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchSource::Getter(_) => f.write_str("Getter"),
            WatchSource::Ref(r) => f.debug_tuple("Ref").field(r).finish(),
            WatchSource::Computed(c) => f.debug_tuple("Computed").field(c).finish(),
            WatchSource::Reactive(p) => f.debug_tuple("Reactive").field(p).finish(),
            WatchSource::Static(v) => f.debug_tuple("Static").field(v).finish(),
        }
    }
}

/// Watcher options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// Observe nested structures at every level.
    pub deep: bool,
    /// Call back once during setup, with no previous value.
    pub immediate: bool,
    /// Stop after the first callback.
    pub once: bool,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deep(mut self, deep: bool) -> Self {
        self.deep = deep;
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }
}

/// Registers cleanup to run before the watcher's next callback (or re-run)
/// and when it stops.
#[derive(Clone, Default)]
pub struct OnCleanup {
    pending: Rc<RefCell<Option<Box<dyn FnOnce()>>>>,
}

impl OnCleanup {
    /// Replace the pending cleanup with `f`.
    pub fn register(&self, f: impl FnOnce() + 'static) {
        *self.pending.borrow_mut() = Some(Box::new(f));
    }

    pub fn is_pending(&self) -> bool {
        self.pending.borrow().is_some()
    }

    fn run_pending(&self) {
        let pending = self.pending.borrow_mut().take();
        if let Some(cleanup) = pending {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cleanup)) {
                let err = ReactiveError::panicked("watch cleanup", payload);
                error!(error = %err, "watcher cleanup panicked");
            }
        }
    }
}

impl fmt::Debug for OnCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnCleanup")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Read every property of `value` so the active computation depends on all
/// of them.
///
/// Descends `depth` levels into proxies and through refs. `seen` holds the
/// structures already visited, which makes cycles safe.
pub fn traverse(value: &Value, depth: usize, seen: &mut HashSet<usize>) {
    if depth == 0 {
        return;
    }

    match value {
        Value::Reactive(proxy) => {
            if !seen.insert(proxy.raw().addr()) {
                return;
            }
            for key in proxy.keys() {
                traverse(&proxy.get(key), depth - 1, seen);
            }
        }
        Value::Ref(r) => {
            if !seen.insert(r.addr()) {
                return;
            }
            traverse(&r.get(), depth, seen);
        }
        _ => {}
    }
}

struct WatchState {
    computation: Computation,
    callback: Option<Callback>,
    old: RefCell<Option<Value>>,
    cleanup: OnCleanup,
    job: Job,
    /// Call back even when the new value is the old one.
    force: bool,
    once: bool,
}

impl WatchState {
    fn new(
        getter: Getter,
        callback: Option<Callback>,
        cleanup: OnCleanup,
        force: bool,
        once: bool,
    ) -> Rc<Self> {
        let state = Rc::new_cyclic(|weak: &Weak<WatchState>| {
            let weak = weak.clone();
            let job = Job::new(move || {
                if let Some(state) = weak.upgrade() {
                    state.run_job();
                }
            });

            let computation = Computation::new(move || getter(), None);
            computation.set_label(if callback.is_some() {
                "watch"
            } else {
                "watch_effect"
            });

            WatchState {
                computation,
                callback,
                old: RefCell::new(None),
                cleanup,
                job,
                force,
                once,
            }
        });

        // Owned by the computation until it stops.
        let owner = Rc::clone(&state);
        state
            .computation
            .set_scheduler(Some(Rc::new(move |_: &Computation| queue_job(&owner.job))));
        state
    }

    fn run_job(&self) {
        if !self.computation.is_active() || !self.computation.is_dirty() {
            return;
        }

        let Some(callback) = &self.callback else {
            if let Err(err) = self.computation.run() {
                error!(computation = %self.computation.id(), error = %err, "watch effect failed");
            }
            if self.once {
                self.stop();
            }
            return;
        };

        let new = match self.computation.run() {
            Ok(value) => value,
            Err(err) => {
                error!(computation = %self.computation.id(), error = %err, "watch source failed");
                return;
            }
        };

        let changed = self.force || self.old.borrow().as_ref() != Some(&new);
        if !changed {
            return;
        }

        self.cleanup.run_pending();
        let old = self.old.borrow().clone();
        let result = untracked(|| {
            panic::catch_unwind(AssertUnwindSafe(|| {
                callback(&new, old.as_ref(), &self.cleanup)
            }))
        });
        *self.old.borrow_mut() = Some(new);

        if let Err(payload) = result {
            let err = ReactiveError::panicked(&self.computation.label(), payload);
            error!(computation = %self.computation.id(), error = %err, "watch callback panicked");
        }

        if self.once {
            self.stop();
        }
    }

    fn stop(&self) {
        if !self.computation.is_active() {
            return;
        }
        self.computation.stop();
        cancel_job(self.job.id());
        self.cleanup.run_pending();
        debug!(computation = %self.computation.id(), "watcher stopped");
    }
}

/// Stops a watcher. Dropping the handle leaves the watcher running.
#[derive(Clone)]
pub struct WatchHandle {
    state: Rc<WatchState>,
}

impl WatchHandle {
    pub fn stop(&self) {
        self.state.stop();
    }

    pub fn is_active(&self) -> bool {
        self.state.computation.is_active()
    }

    /// The computation evaluating the watched source.
    pub fn computation(&self) -> &Computation {
        &self.state.computation
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("computation", &self.state.computation.id())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Call `callback(new, old, on_cleanup)` after `source` changes.
///
/// `old` is `None` only for the `immediate` call made during setup.
pub fn watch<S, F>(source: S, callback: F, options: WatchOptions) -> WatchHandle
where
    S: Into<WatchSource>,
    F: Fn(&Value, Option<&Value>, &OnCleanup) + 'static,
{
    let source = source.into();
    let force = options.deep || matches!(source, WatchSource::Reactive(_));
    let getter = source.into_getter(options.deep);

    let state = WatchState::new(
        getter,
        Some(Box::new(callback)),
        OnCleanup::default(),
        force,
        options.once,
    );

    if options.immediate {
        state.run_job();
    } else {
        match state.computation.run() {
            Ok(value) => *state.old.borrow_mut() = Some(value),
            Err(err) => error!(
                computation = %state.computation.id(),
                error = %err,
                "watch source failed during setup"
            ),
        }
    }

    WatchHandle { state }
}

/// Run `f` now and again, on the next flush, whenever anything it read
/// changes.
///
/// Cleanup registered through the [`OnCleanup`] argument runs before each
/// re-run and when the watcher stops.
///
/// With `once` the watcher stops after its first re-run. `immediate` has no
/// effect since `f` always runs at setup, and `deep` has no effect since `f`
/// tracks exactly what it reads.
pub fn watch_effect<F, R>(f: F, options: WatchOptions) -> WatchHandle
where
    F: Fn(&OnCleanup) -> R + 'static,
    R: Into<Value>,
{
    let cleanup = OnCleanup::default();
    let on_cleanup = cleanup.clone();
    let getter: Getter = Rc::new(move || {
        on_cleanup.run_pending();
        f(&on_cleanup).into()
    });

    let state = WatchState::new(getter, None, cleanup, false, options.once);
    if let Err(err) = state.computation.run() {
        error!(
            computation = %state.computation.id(),
            error = %err,
            "watch effect failed during setup"
        );
    }

    WatchHandle { state }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
