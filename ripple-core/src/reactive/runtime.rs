//! Reactive Runtime
//!
//! The runtime implements the two core operations that connect observed
//! state to computations:
//!
//! - **track**: the active computation reads a property, so subscribe it to
//!   that property's dependency set.
//! - **trigger**: a property changed, so notify every subscriber.
//!
//! # How It Works
//!
//! 1. The global dependency table maps each observed object to its
//!    per-property dependency sets. Entries are created on the first tracked
//!    read of a `(object, key)` pair.
//!
//! 2. A computation's subscription list is rebuilt on every run. Each run
//!    bumps the computation's track generation; a set already carrying the
//!    current generation is not recorded twice. Entries left over from the
//!    previous run that were not read again are pruned when the run ends.
//!
//! 3. When a set is emptied its cleanup removes it from the table, and the
//!    object's entry goes away with its last set.
//!
//! 4. The table refers to objects weakly. Entries whose object has been
//!    dropped are swept as the table grows, so observing a structure never
//!    keeps it alive.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;

use tracing::{error, trace};

use super::context::ReactiveContext;
use super::dep::Dep;
use super::effect::Computation;
use super::SubscriberId;
use crate::value::{Key, Object, Value, WeakObject};

/// Entries below this count are never swept.
const MIN_SWEEP_THRESHOLD: usize = 64;

/// What a dependency set in the global table is attached to.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) enum TableKey {
    /// A single property.
    Property(Key),
    /// The object's set of keys.
    Iterate,
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKey::Property(key) => write!(f, "{key}"),
            TableKey::Iterate => f.write_str("<iterate>"),
        }
    }
}

struct TargetEntry {
    target: WeakObject,
    deps: HashMap<TableKey, Dep>,
}

struct TargetMap {
    entries: HashMap<usize, TargetEntry>,
    sweep_at: usize,
}

impl TargetMap {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            sweep_at: MIN_SWEEP_THRESHOLD,
        }
    }

    fn dep_for(&mut self, target: &Object, key: TableKey) -> Dep {
        let addr = target.addr();
        if !self.entries.contains_key(&addr) {
            self.sweep();
        }

        let entry = self.entries.entry(addr).or_insert_with(|| TargetEntry {
            target: target.downgrade(),
            deps: HashMap::new(),
        });

        entry
            .deps
            .entry(key.clone())
            .or_insert_with(|| {
                let owned_key = key.clone();
                Dep::new(
                    key.to_string(),
                    Some(Box::new(move |emptied: &Dep| {
                        remove_dep(addr, &owned_key, emptied)
                    })),
                )
            })
            .clone()
    }

    fn get(&self, target: &Object, key: &TableKey) -> Option<Dep> {
        self.entries
            .get(&target.addr())
            .and_then(|entry| entry.deps.get(key))
            .cloned()
    }

    fn sweep(&mut self) {
        if self.entries.len() < self.sweep_at {
            return;
        }
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.target.is_alive());
        self.sweep_at = (self.entries.len() * 2).max(MIN_SWEEP_THRESHOLD);
        trace!(
            swept = before - self.entries.len(),
            remaining = self.entries.len(),
            "swept dependency table"
        );
    }
}

thread_local! {
    static TARGET_MAP: RefCell<TargetMap> = RefCell::new(TargetMap::new());
}

/// Dependency-set cleanup for table-owned sets.
fn remove_dep(addr: usize, key: &TableKey, emptied: &Dep) {
    let removed = TARGET_MAP.try_with(|map| {
        let mut map = map.borrow_mut();
        let entry = map.entries.get_mut(&addr)?;
        if !entry.deps.get(key).is_some_and(|dep| dep.ptr_eq(emptied)) {
            return None;
        }
        let dep = entry.deps.remove(key);
        let target = if entry.deps.is_empty() {
            map.entries.remove(&addr)
        } else {
            None
        };
        Some((dep, target))
    });

    if let Ok(Some(_)) = &removed {
        trace!(dep = %key, "dependency set released");
    }
    // Dropped here, outside the table borrow.
    drop(removed);
}

pub(crate) fn track_key(target: &Object, key: TableKey) {
    let Some(active) = ReactiveContext::current() else {
        return;
    };
    let dep = TARGET_MAP.with(|map| map.borrow_mut().dep_for(target, key));
    track_effect(&active, &dep);
}

pub(crate) fn trigger_key(target: &Object, key: &TableKey) {
    let dep = TARGET_MAP.with(|map| map.borrow().get(target, key));
    if let Some(dep) = dep {
        trigger_effects(&dep);
    }
}

/// Record that `computation` read the slot behind `dep`.
pub(crate) fn track_effect(computation: &Computation, dep: &Dep) {
    if !computation.is_active() {
        return;
    }
    let track_id = computation.track_id();
    if dep.track_id_of(computation.id()) == Some(track_id) {
        return;
    }

    dep.insert(computation, track_id);
    trace!(computation = %computation.id(), dep = dep.name(), "track");

    if let Some(stale) = computation.record_dep(dep) {
        cleanup_dep_effect(&stale, computation);
    }
}

/// Unsubscribe `computation` from `dep` unless it was read in the current run.
pub(crate) fn cleanup_dep_effect(dep: &Dep, computation: &Computation) {
    let Some(track_id) = dep.track_id_of(computation.id()) else {
        return;
    };
    if track_id == computation.track_id() {
        return;
    }

    // The removed handle must outlive the cleanup call below.
    let _removed = dep.remove(computation.id());
    if dep.is_empty() {
        dep.run_cleanup();
    }
}

/// A notification waiting for the outermost trigger to finish marking.
struct PendingNotify {
    computation: Computation,
    dep: Dep,
}

thread_local! {
    static TRIGGER_DEPTH: Cell<u32> = const { Cell::new(0) };
    static PENDING: RefCell<VecDeque<PendingNotify>> = const { RefCell::new(VecDeque::new()) };
}

/// Notify every computation subscribed to `dep` that is not running.
///
/// Marking happens before any notification runs: every subscriber (and,
/// through derived computations, everything downstream of them) is dirty by
/// the time the first re-run starts. Notifications are queued and drained
/// once the outermost trigger is done marking. A computation reached through
/// several paths is queued once.
pub(crate) fn trigger_effects(dep: &Dep) {
    TRIGGER_DEPTH.with(|depth| depth.set(depth.get() + 1));

    for computation in dep.subscribers() {
        // Pruned or stopped while this set was being marked.
        if !dep.contains(computation.id()) {
            continue;
        }

        computation.mark_dirty();

        if computation.is_running() {
            trace!(
                computation = %computation.id(),
                dep = dep.name(),
                "skipped re-entrant trigger"
            );
            continue;
        }

        if computation.is_derived() {
            computation.notify();
        } else {
            PENDING.with(|pending| {
                let mut pending = pending.borrow_mut();
                let id = computation.id();
                if !pending.iter().any(|queued| queued.computation.id() == id) {
                    pending.push_back(PendingNotify {
                        computation,
                        dep: dep.clone(),
                    });
                }
            });
        }
    }

    let depth = TRIGGER_DEPTH.with(|depth| {
        let next = depth.get() - 1;
        depth.set(next);
        next
    });
    if depth == 0 {
        drain_pending();
    }
}

fn drain_pending() {
    while let Some(next) = PENDING.with(|pending| pending.borrow_mut().pop_front()) {
        let PendingNotify { computation, dep } = next;

        // Pruned or stopped by an earlier notification.
        if !dep.contains(computation.id()) {
            continue;
        }

        trace!(computation = %computation.id(), dep = dep.name(), "trigger");
        computation.notify();
    }
}

/// Entry points of the track/trigger protocol.
///
/// Observation proxies call these on every read and write; they are public
/// so that hosts can build their own observable structures on top of
/// [`Object`].
pub struct Runtime;

impl Runtime {
    /// Subscribe the active computation (if any) to `target[key]`.
    pub fn track(target: &Object, key: &Key) {
        track_key(target, TableKey::Property(key.clone()));
    }

    /// Notify subscribers of `target[key]`.
    ///
    /// Callers are expected to have checked that the value actually changed;
    /// `new_value` and `old_value` are only used for diagnostics.
    pub fn trigger(
        target: &Object,
        key: &Key,
        new_value: Option<&Value>,
        old_value: Option<&Value>,
    ) {
        trace!(
            key = %key,
            new = ?new_value.map(|v| v.type_name()),
            old = ?old_value.map(|v| v.type_name()),
            "property changed"
        );
        trigger_key(target, &TableKey::Property(key.clone()));
    }

    /// Number of computations subscribed to `target[key]`.
    pub fn subscriber_count(target: &Object, key: &Key) -> usize {
        TARGET_MAP.with(|map| {
            map.borrow()
                .get(target, &TableKey::Property(key.clone()))
                .map_or(0, |dep| dep.len())
        })
    }

    /// Number of objects that currently have at least one dependency set.
    pub fn tracked_target_count() -> usize {
        TARGET_MAP.with(|map| map.borrow().entries.len())
    }

    /// Get the current subscriber being tracked, if any.
    pub fn current_subscriber() -> Option<SubscriberId> {
        ReactiveContext::current_subscriber()
    }

    /// Check if we're inside a tracked run.
    pub fn is_tracking() -> bool {
        ReactiveContext::is_active()
    }
}

pub(crate) fn report_failure(computation: &Computation, err: &crate::error::ReactiveError) {
    error!(computation = %computation.id(), error = %err, "computation failed during trigger");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn counting_effect(target: &Object, key: &'static str, count: Rc<Cell<u32>>) -> Computation {
        let target = target.clone();
        let computation = Computation::new(
            move || {
                count.set(count.get() + 1);
                Runtime::track(&target, &Key::from(key));
                Value::Null
            },
            None,
        );
        computation.run().unwrap();
        computation
    }

    #[test]
    fn track_is_a_no_op_without_active_computation() {
        let target = Object::new();
        Runtime::track(&target, &Key::from("a"));
        assert_eq!(Runtime::subscriber_count(&target, &Key::from("a")), 0);
    }

    #[test]
    fn trigger_reruns_subscribers() {
        let target = Object::new();
        let count = Rc::new(Cell::new(0));
        let _c = counting_effect(&target, "a", count.clone());

        assert_eq!(count.get(), 1);
        assert_eq!(Runtime::subscriber_count(&target, &Key::from("a")), 1);

        Runtime::trigger(&target, &Key::from("a"), None, None);
        assert_eq!(count.get(), 2);

        // Unrelated key: no dependency set, nothing happens.
        Runtime::trigger(&target, &Key::from("b"), None, None);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn repeated_reads_subscribe_once() {
        let target = Object::new();
        let t = target.clone();
        let c = Computation::new(
            move || {
                Runtime::track(&t, &Key::from("a"));
                Runtime::track(&t, &Key::from("a"));
                Value::Null
            },
            None,
        );
        c.run().unwrap();

        assert_eq!(c.dependency_count(), 1);
        assert_eq!(Runtime::subscriber_count(&target, &Key::from("a")), 1);
    }

    #[test]
    fn stopping_releases_table_entries() {
        let target = Object::new();
        let count = Rc::new(Cell::new(0));
        let c = counting_effect(&target, "a", count);

        assert_eq!(Runtime::tracked_target_count(), 1);
        c.stop();
        assert_eq!(Runtime::tracked_target_count(), 0);
        assert_eq!(Runtime::subscriber_count(&target, &Key::from("a")), 0);
    }

    #[test]
    fn reordered_reads_keep_both_subscriptions() {
        let target = Object::new();
        let flip = Rc::new(Cell::new(false));
        let (t, f) = (target.clone(), flip.clone());
        let c = Computation::new(
            move || {
                let (first, second) = if f.get() { ("b", "a") } else { ("a", "b") };
                Runtime::track(&t, &Key::from(first));
                Runtime::track(&t, &Key::from(second));
                Value::Null
            },
            None,
        );
        c.run().unwrap();
        flip.set(true);
        c.run().unwrap();

        assert_eq!(c.dependency_count(), 2);
        assert_eq!(Runtime::subscriber_count(&target, &Key::from("a")), 1);
        assert_eq!(Runtime::subscriber_count(&target, &Key::from("b")), 1);
    }

    #[test]
    fn dead_targets_are_swept() {
        fn reader(targets: Rc<RefCell<Vec<Object>>>) -> Computation {
            Computation::new(
                move || {
                    for target in targets.borrow().iter() {
                        Runtime::track(target, &Key::from("x"));
                    }
                    Value::Null
                },
                None,
            )
        }

        fn objects(n: usize) -> Rc<RefCell<Vec<Object>>> {
            Rc::new(RefCell::new((0..n).map(|_| Object::new()).collect()))
        }

        let short_lived = objects(100);
        let c = reader(short_lived.clone());
        c.run().unwrap();
        assert_eq!(Runtime::tracked_target_count(), 100);

        // `c` stays subscribed, but nothing keeps the objects alive.
        short_lived.borrow_mut().clear();

        let long_lived = objects(200);
        let d = reader(long_lived.clone());
        d.run().unwrap();

        assert_eq!(Runtime::tracked_target_count(), 200);
        assert!(c.is_active());
    }
}
