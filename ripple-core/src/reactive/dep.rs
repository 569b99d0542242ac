//! Dependency Sets
//!
//! A [`Dep`] is the set of computations subscribed to one observed slot
//! (one property of one object, or the value of one ref or computed).
//!
//! Each subscriber is stored with the track generation at which it last
//! subscribed; a computation reading the same slot twice in one run is
//! recorded once. When the last subscriber leaves, the set's cleanup callback
//! removes it from whatever table owns it.
//!
//! Owners hold their sets strongly. Computations only hold them weakly, so a
//! set disappears with its owner.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::context::ReactiveContext;
use super::effect::Computation;
use super::runtime::{track_effect, trigger_effects};
use super::SubscriberId;

/// Called with the emptied set so the owner can drop it.
pub(crate) type DepCleanup = Box<dyn Fn(&Dep)>;

struct DepInner {
    subscribers: RefCell<IndexMap<SubscriberId, (Computation, u64)>>,
    cleanup: Option<DepCleanup>,
    name: Rc<str>,
}

#[derive(Clone)]
pub(crate) struct Dep(Rc<DepInner>);

impl Dep {
    pub(crate) fn new(name: impl Into<Rc<str>>, cleanup: Option<DepCleanup>) -> Self {
        Self(Rc::new(DepInner {
            subscribers: RefCell::new(IndexMap::new()),
            cleanup,
            name: name.into(),
        }))
    }

    pub(crate) fn name(&self) -> &str {
        &self.0.name
    }

    pub(crate) fn len(&self) -> usize {
        self.0.subscribers.borrow().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The generation at which `id` last subscribed, if it is subscribed.
    pub(crate) fn track_id_of(&self, id: SubscriberId) -> Option<u64> {
        self.0.subscribers.borrow().get(&id).map(|(_, track_id)| *track_id)
    }

    pub(crate) fn contains(&self, id: SubscriberId) -> bool {
        self.0.subscribers.borrow().contains_key(&id)
    }

    /// Subscribe (or refresh) `computation`, keeping its original position.
    pub(crate) fn insert(&self, computation: &Computation, track_id: u64) {
        self.0
            .subscribers
            .borrow_mut()
            .insert(computation.id(), (computation.clone(), track_id));
    }

    pub(crate) fn remove(&self, id: SubscriberId) -> Option<Computation> {
        self.0
            .subscribers
            .borrow_mut()
            .shift_remove(&id)
            .map(|(computation, _)| computation)
    }

    /// Ordered snapshot of the current subscribers.
    pub(crate) fn subscribers(&self) -> Vec<Computation> {
        self.0
            .subscribers
            .borrow()
            .values()
            .map(|(computation, _)| computation.clone())
            .collect()
    }

    pub(crate) fn run_cleanup(&self) {
        if let Some(cleanup) = &self.0.cleanup {
            cleanup(self);
        }
    }

    pub(crate) fn downgrade(&self) -> WeakDep {
        WeakDep(Rc::downgrade(&self.0))
    }

    pub(crate) fn ptr_eq(&self, other: &Dep) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dep")
            .field("name", &self.name())
            .field("subscribers", &self.len())
            .finish()
    }
}

/// A computation's back-reference to a set it is subscribed to.
#[derive(Clone)]
pub(crate) struct WeakDep(Weak<DepInner>);

impl WeakDep {
    pub(crate) fn upgrade(&self) -> Option<Dep> {
        self.0.upgrade().map(Dep)
    }

    pub(crate) fn points_to(&self, dep: &Dep) -> bool {
        std::ptr::eq(self.0.as_ptr(), Rc::as_ptr(&dep.0))
    }
}

/// A lazily created dependency set owned by a single-value container.
///
/// The set is created on the first tracked read and dropped again (the slot
/// returns to empty) when its last subscriber leaves.
#[derive(Default)]
pub(crate) struct DepSlot {
    slot: Rc<RefCell<Option<Dep>>>,
}

impl DepSlot {
    /// Subscribe the active computation, if any.
    pub(crate) fn track(&self, name: &str) {
        let Some(active) = ReactiveContext::current() else {
            return;
        };
        let dep = self.get_or_create(name);
        track_effect(&active, &dep);
    }

    /// Notify every subscriber.
    pub(crate) fn trigger(&self) {
        let dep = self.slot.borrow().clone();
        if let Some(dep) = dep {
            trigger_effects(&dep);
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.slot.borrow().as_ref().map_or(0, Dep::len)
    }

    #[cfg(test)]
    pub(crate) fn is_allocated(&self) -> bool {
        self.slot.borrow().is_some()
    }

    fn get_or_create(&self, name: &str) -> Dep {
        if let Some(dep) = self.slot.borrow().as_ref() {
            return dep.clone();
        }

        let weak_slot = Rc::downgrade(&self.slot);
        let dep = Dep::new(
            name,
            Some(Box::new(move |emptied: &Dep| {
                let Some(slot) = weak_slot.upgrade() else {
                    return;
                };
                let mut slot = slot.borrow_mut();
                if slot.as_ref().is_some_and(|current| current.ptr_eq(emptied)) {
                    *slot = None;
                }
            })),
        );
        *self.slot.borrow_mut() = Some(dep.clone());
        dep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::cell::Cell;

    fn computation() -> Computation {
        Computation::new(|| Value::Null, None)
    }

    #[test]
    fn insert_keeps_first_position() {
        let dep = Dep::new("a", None);
        let first = computation();
        let second = computation();

        dep.insert(&first, 1);
        dep.insert(&second, 1);
        dep.insert(&first, 2);

        let ids: Vec<_> = dep.subscribers().iter().map(Computation::id).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
        assert_eq!(dep.track_id_of(first.id()), Some(2));
    }

    #[test]
    fn cleanup_receives_the_emptied_set() {
        let called = Rc::new(Cell::new(false));
        let called_clone = called.clone();
        let dep = Dep::new(
            "k",
            Some(Box::new(move |d: &Dep| {
                assert_eq!(d.name(), "k");
                called_clone.set(true);
            })),
        );

        dep.run_cleanup();
        assert!(called.get());
    }

    #[test]
    fn weak_dep_identity() {
        let a = Dep::new("a", None);
        let b = Dep::new("b", None);
        let weak = a.downgrade();

        assert!(weak.points_to(&a));
        assert!(!weak.points_to(&b));
        drop(a);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn slot_is_lazy_and_empties_with_last_subscriber() {
        let slot = DepSlot::default();
        assert!(!slot.is_allocated());

        // No active computation: nothing is allocated.
        slot.track("ref");
        assert!(!slot.is_allocated());

        let c = computation();
        {
            let _ctx = ReactiveContext::enter(&c);
            slot.track("ref");
        }
        assert!(slot.is_allocated());
        assert_eq!(slot.subscriber_count(), 1);

        c.stop();
        assert!(!slot.is_allocated());
    }
}
