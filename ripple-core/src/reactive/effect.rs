//! Effect Implementation
//!
//! A [`Computation`] wraps a function and keeps the set of dependency sets
//! that function read during its latest run. Effects, computed values and
//! watchers are all built on it.
//!
//! # How Computations Work
//!
//! 1. A run makes the computation the active one, bumps its track generation
//!    and resets the count of valid subscriptions.
//!
//! 2. Every tracked read during the run fills the next slot of the
//!    subscription list, reusing the slot when the same set was read at the
//!    same position last time.
//!
//! 3. When the run ends (normally or by panic) the slots past the valid
//!    count are unsubscribed, so the list holds exactly what was read.
//!
//! 4. When a dependency changes, the computation is marked dirty and either
//!    handed to its scheduler or, without one, re-run directly. A computation
//!    is never notified while it is running.
//!
//! # Cleanup
//!
//! [`Computation::stop`] unsubscribes everything and deactivates the
//! computation. A stopped computation can still be run; it just no longer
//! tracks anything.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, error};

use super::context::{untracked, ReactiveContext};
use super::dep::{Dep, WeakDep};
use super::runtime::{cleanup_dep_effect, report_failure};
use super::SubscriberId;
use crate::error::{ReactiveError, Result};
use crate::value::Value;

/// Called instead of a direct re-run when a computation's dependencies change.
pub type Scheduler = Rc<dyn Fn(&Computation)>;

/// Whether a computation's last result is still valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyLevel {
    /// No dependency changed since the last run.
    Clean,

    /// A dependency changed; the next read must re-run.
    Dirty,
}

struct ComputationInner {
    id: SubscriberId,
    func: Rc<dyn Fn() -> Value>,
    scheduler: RefCell<Option<Scheduler>>,
    label: RefCell<Option<Rc<str>>>,
    active: Cell<bool>,
    /// Propagates dirtiness during marking instead of waiting to be notified.
    derived: Cell<bool>,
    dirty: Cell<DirtyLevel>,
    track_id: Cell<u64>,
    deps: RefCell<SmallVec<[WeakDep; 4]>>,
    deps_len: Cell<usize>,
    running: Cell<u32>,
}

/// A tracked function.
///
/// Cloning a `Computation` creates a new handle to the same computation.
#[derive(Clone)]
pub struct Computation {
    inner: Rc<ComputationInner>,
}

impl Computation {
    /// Create a computation. It does not run until [`run`](Self::run) is
    /// called.
    pub fn new<F>(func: F, scheduler: Option<Scheduler>) -> Self
    where
        F: Fn() -> Value + 'static,
    {
        Self {
            inner: Rc::new(ComputationInner {
                id: SubscriberId::new(),
                func: Rc::new(func),
                scheduler: RefCell::new(scheduler),
                label: RefCell::new(None),
                active: Cell::new(true),
                derived: Cell::new(false),
                dirty: Cell::new(DirtyLevel::Dirty),
                track_id: Cell::new(0),
                deps: RefCell::new(SmallVec::new()),
                deps_len: Cell::new(0),
                running: Cell::new(0),
            }),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    /// Diagnostic name, used in logs and errors.
    pub fn label(&self) -> String {
        match self.inner.label.borrow().as_deref() {
            Some(label) => format!("{label}{}", self.id()),
            None => format!("computation{}", self.id()),
        }
    }

    pub fn set_label(&self, label: impl Into<Rc<str>>) {
        *self.inner.label.borrow_mut() = Some(label.into());
    }

    pub fn set_scheduler(&self, scheduler: Option<Scheduler>) {
        *self.inner.scheduler.borrow_mut() = scheduler;
    }

    pub fn has_scheduler(&self) -> bool {
        self.inner.scheduler.borrow().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get() > 0
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.get() == DirtyLevel::Dirty
    }

    pub fn dirty_level(&self) -> DirtyLevel {
        self.inner.dirty.get()
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.inner.dirty.set(if dirty {
            DirtyLevel::Dirty
        } else {
            DirtyLevel::Clean
        });
    }

    /// Number of dependency sets this computation is subscribed to.
    pub fn dependency_count(&self) -> usize {
        self.inner
            .deps
            .borrow()
            .iter()
            .filter(|dep| dep.upgrade().is_some())
            .count()
    }

    /// Run the function, re-discovering its dependencies.
    ///
    /// A panic in the function is caught and returned as
    /// [`ReactiveError::Panicked`]; subscription bookkeeping completes either
    /// way.
    pub fn run(&self) -> Result<Value> {
        self.inner.dirty.set(DirtyLevel::Clean);
        let func = Rc::clone(&self.inner.func);

        if !self.is_active() {
            return untracked(|| self.invoke(&*func));
        }

        let _scope = RunScope::enter(self);
        self.invoke(&*func)
    }

    /// Unsubscribe from everything and deactivate.
    pub fn stop(&self) {
        if !self.inner.active.replace(false) {
            return;
        }

        self.pre_clean();
        self.post_clean();
        // The scheduler may own this computation's owner; dropping it breaks
        // the cycle. Callers invoking it hold their own clone.
        let scheduler = self.inner.scheduler.borrow_mut().take();
        drop(scheduler);

        debug!(computation = %self.id(), "computation stopped");
    }

    fn invoke(&self, func: &dyn Fn() -> Value) -> Result<Value> {
        panic::catch_unwind(AssertUnwindSafe(func))
            .map_err(|payload| ReactiveError::panicked(&self.label(), payload))
    }

    pub(crate) fn track_id(&self) -> u64 {
        self.inner.track_id.get()
    }

    pub(crate) fn mark_derived(&self) {
        self.inner.derived.set(true);
    }

    pub(crate) fn is_derived(&self) -> bool {
        self.inner.derived.get()
    }

    pub(crate) fn mark_dirty(&self) {
        self.inner.dirty.set(DirtyLevel::Dirty);
    }

    /// Hand the computation to its scheduler, or re-run it.
    pub(crate) fn notify(&self) {
        let scheduler = self.inner.scheduler.borrow().clone();
        match scheduler {
            Some(scheduler) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| scheduler(self))) {
                    let err = ReactiveError::panicked(&self.label(), payload);
                    error!(computation = %self.id(), error = %err, "scheduler panicked");
                }
            }
            None => {
                if let Err(err) = self.run() {
                    report_failure(self, &err);
                }
            }
        }
    }

    /// Record `dep` in the next subscription slot.
    ///
    /// Returns the set previously in that slot when it was a different one,
    /// so the caller can unsubscribe from it.
    pub(crate) fn record_dep(&self, dep: &Dep) -> Option<Dep> {
        let mut deps = self.inner.deps.borrow_mut();
        let index = self.inner.deps_len.get();
        self.inner.deps_len.set(index + 1);

        match deps.get(index) {
            Some(existing) if existing.points_to(dep) => None,
            Some(_) => std::mem::replace(&mut deps[index], dep.downgrade()).upgrade(),
            None => {
                deps.push(dep.downgrade());
                None
            }
        }
    }

    fn pre_clean(&self) {
        self.inner.track_id.set(self.inner.track_id.get() + 1);
        self.inner.deps_len.set(0);
    }

    fn post_clean(&self) {
        let valid = self.inner.deps_len.get();
        let stale: SmallVec<[WeakDep; 4]> = {
            let mut deps = self.inner.deps.borrow_mut();
            if deps.len() > valid {
                deps.drain(valid..).collect()
            } else {
                SmallVec::new()
            }
        };

        for weak in stale {
            if let Some(dep) = weak.upgrade() {
                cleanup_dep_effect(&dep, self);
            }
        }
    }
}

impl PartialEq for Computation {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Computation {}

impl fmt::Debug for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computation")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .field("dirty", &self.dirty_level())
            .field("running", &self.inner.running.get())
            .field("dependency_count", &self.dependency_count())
            .finish()
    }
}

/// Scope of one tracked run. Dropping it (also during unwinding) finishes
/// the run's bookkeeping before the previous computation is restored.
struct RunScope<'a> {
    computation: &'a Computation,
    _ctx: ReactiveContext,
}

impl<'a> RunScope<'a> {
    fn enter(computation: &'a Computation) -> Self {
        let ctx = ReactiveContext::enter(computation);
        let inner = &computation.inner;
        computation.pre_clean();
        inner.running.set(inner.running.get() + 1);

        Self {
            computation,
            _ctx: ctx,
        }
    }
}

impl Drop for RunScope<'_> {
    fn drop(&mut self) {
        let inner = &self.computation.inner;
        inner.running.set(inner.running.get() - 1);
        self.computation.post_clean();
    }
}

/// Options for [`effect_with`].
#[derive(Clone, Default)]
pub struct EffectOptions {
    /// Called on change instead of re-running directly.
    pub scheduler: Option<Scheduler>,
    /// Skip the initial run.
    pub lazy: bool,
    /// Diagnostic name.
    pub label: Option<String>,
}

impl EffectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduler(mut self, scheduler: impl Fn(&Computation) + 'static) -> Self {
        self.scheduler = Some(Rc::new(scheduler));
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl fmt::Debug for EffectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectOptions")
            .field("scheduler", &self.scheduler.is_some())
            .field("lazy", &self.lazy)
            .field("label", &self.label)
            .finish()
    }
}

/// Handle returned by [`effect`]: re-runs or stops the effect.
#[derive(Clone, Debug)]
pub struct EffectRunner {
    computation: Computation,
}

impl EffectRunner {
    /// Re-run the effect now, re-tracking its dependencies.
    pub fn run(&self) -> Result<Value> {
        self.computation.run()
    }

    pub fn stop(&self) {
        self.computation.stop();
    }

    pub fn is_active(&self) -> bool {
        self.computation.is_active()
    }

    pub fn computation(&self) -> &Computation {
        &self.computation
    }
}

/// Run `f` now and again whenever anything it read changes.
///
/// # Example
///
/// ```rust,ignore
/// let state = reactive(json!({"count": 0}));
/// let state = state.as_reactive().unwrap().clone();
///
/// let s = state.clone();
/// effect(move || println!("count = {:?}", s.get("count")));
///
/// state.set("count", 1); // prints "count = Int(1)"
/// ```
pub fn effect<F, R>(f: F) -> EffectRunner
where
    F: Fn() -> R + 'static,
    R: Into<Value>,
{
    effect_with(f, EffectOptions::default())
}

/// [`effect`] with options.
pub fn effect_with<F, R>(f: F, options: EffectOptions) -> EffectRunner
where
    F: Fn() -> R + 'static,
    R: Into<Value>,
{
    let computation = Computation::new(move || f().into(), options.scheduler);
    computation.set_label(options.label.as_deref().unwrap_or("effect"));

    if !options.lazy {
        if let Err(err) = computation.run() {
            error!(computation = %computation.id(), error = %err, "effect failed on first run");
        }
    }

    EffectRunner { computation }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{reactive, Reactive};
    use serde_json::json;

    fn state(json: serde_json::Value) -> Reactive {
        reactive(json).as_reactive().unwrap().clone()
    }

    #[test]
    fn effect_runs_on_creation() {
        let run_count = Rc::new(Cell::new(0));
        let run_count_clone = run_count.clone();

        let _runner = effect(move || run_count_clone.set(run_count_clone.get() + 1));

        assert_eq!(run_count.get(), 1);
    }

    #[test]
    fn lazy_effect_does_not_run_on_creation() {
        let run_count = Rc::new(Cell::new(0));
        let run_count_clone = run_count.clone();

        let runner = effect_with(
            move || run_count_clone.set(run_count_clone.get() + 1),
            EffectOptions::new().lazy(true),
        );
        assert_eq!(run_count.get(), 0);

        runner.run().unwrap();
        assert_eq!(run_count.get(), 1);
    }

    #[test]
    fn runner_returns_the_function_result() {
        let runner = effect(|| 7);
        assert_eq!(runner.run().unwrap(), Value::Int(7));
    }

    #[test]
    fn custom_scheduler_replaces_direct_rerun() {
        let o = state(json!({"a": 1}));
        let runs = Rc::new(Cell::new(0));
        let scheduled = Rc::new(Cell::new(0));

        let (o2, r2, s2) = (o.clone(), runs.clone(), scheduled.clone());
        let runner = effect_with(
            move || {
                o2.get("a");
                r2.set(r2.get() + 1);
            },
            EffectOptions::new().scheduler(move |_| s2.set(s2.get() + 1)),
        );

        o.set("a", 2);
        assert_eq!(runs.get(), 1);
        assert_eq!(scheduled.get(), 1);

        // Not re-run yet, but every change still reaches the scheduler.
        o.set("a", 3);
        o.set("a", 4);
        assert_eq!(scheduled.get(), 3);
        assert!(runner.computation().is_dirty());
        assert_eq!(runs.get(), 1);

        runner.run().unwrap();
        assert!(!runner.computation().is_dirty());
    }

    #[test]
    fn scheduler_that_skips_a_notice_still_hears_the_next() {
        let o = state(json!({"a": 1}));
        let runs = Rc::new(Cell::new(0));
        let enabled = Rc::new(Cell::new(false));

        let (o2, r2, e2) = (o.clone(), runs.clone(), enabled.clone());
        let _runner = effect_with(
            move || {
                o2.get("a");
                r2.set(r2.get() + 1);
            },
            EffectOptions::new().scheduler(move |c| {
                if e2.get() {
                    let _ = c.run();
                }
            }),
        );

        o.set("a", 2);
        assert_eq!(runs.get(), 1);

        enabled.set(true);
        o.set("a", 3);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn scheduler_receives_the_notified_computation() {
        let o = state(json!({"a": 1}));
        let seen = Rc::new(RefCell::new(None));

        let o2 = o.clone();
        let seen2 = seen.clone();
        let runner = effect_with(
            move || o2.get("a"),
            EffectOptions::new().scheduler(move |c| *seen2.borrow_mut() = Some(c.id())),
        );

        o.set("a", 5);
        assert_eq!(*seen.borrow(), Some(runner.computation().id()));
    }

    #[test]
    fn stopped_effect_runs_without_tracking() {
        let o = state(json!({"a": 1}));
        let runs = Rc::new(Cell::new(0));

        let (o2, r2) = (o.clone(), runs.clone());
        let runner = effect(move || {
            o2.get("a");
            r2.set(r2.get() + 1);
        });

        runner.stop();
        assert!(!runner.is_active());
        assert_eq!(runner.computation().dependency_count(), 0);

        o.set("a", 2);
        assert_eq!(runs.get(), 1);

        runner.run().unwrap();
        assert_eq!(runs.get(), 2);
        assert_eq!(runner.computation().dependency_count(), 0);

        o.set("a", 3);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn panicking_run_still_prunes_and_restores_context() {
        let o = state(json!({"a": 1, "b": 1, "fail": false}));
        let o2 = o.clone();

        let runner = effect(move || {
            o2.get("a");
            if o2.get("fail") == Value::Bool(true) {
                panic!("requested failure");
            }
            o2.get("b");
        });
        assert_eq!(runner.computation().dependency_count(), 3);

        // The re-run triggered by this write panics after reading `a` and `fail`.
        o.set("fail", true);
        assert!(!ReactiveContext::is_active());
        assert_eq!(runner.computation().dependency_count(), 2);
        assert!(!runner.computation().is_running());

        let err = runner.run().unwrap_err();
        assert!(matches!(
            err,
            ReactiveError::Panicked { ref message, .. } if message == "requested failure"
        ));
    }

    #[test]
    fn self_write_does_not_recurse() {
        let o = state(json!({"n": 0}));
        let runs = Rc::new(Cell::new(0));

        let (o2, r2) = (o.clone(), runs.clone());
        let _runner = effect(move || {
            r2.set(r2.get() + 1);
            let n = o2.get("n").as_i64().unwrap_or(0);
            o2.set("n", n + 1);
        });

        assert_eq!(runs.get(), 1);
        assert_eq!(o.get("n"), Value::Int(1));
    }

    #[test]
    fn nested_effects_restore_outer_context() {
        let o = state(json!({"inner": 1, "outer": 1}));
        let outer_runs = Rc::new(Cell::new(0));
        let inner_runs = Rc::new(Cell::new(0));

        let (o2, outer2, inner2) = (o.clone(), outer_runs.clone(), inner_runs.clone());
        let _outer = effect(move || {
            outer2.set(outer2.get() + 1);
            let (o3, inner3) = (o2.clone(), inner2.clone());
            let inner = effect(move || {
                inner3.set(inner3.get() + 1);
                o3.get("inner");
            });
            inner.stop();
            o2.get("outer");
        });

        assert_eq!((outer_runs.get(), inner_runs.get()), (1, 1));

        // `inner` was only read by the (stopped) inner effect.
        o.set("inner", 2);
        assert_eq!(outer_runs.get(), 1);

        o.set("outer", 2);
        assert_eq!(outer_runs.get(), 2);
    }
}
