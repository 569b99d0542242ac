//! Refs
//!
//! A [`Ref`] is a single observable slot. Reading it subscribes the active
//! computation; writing a different value notifies every subscriber.
//!
//! An object stored in a ref is observed as well: [`Ref::get`] returns its
//! proxy, so mutations inside the object are tracked too.
//!
//! A projected ref ([`to_ref`]) has no state of its own. It reads and writes
//! one property of another structure and is exactly as observable as that
//! structure is.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use super::context::untracked;
use super::dep::DepSlot;
use super::proxy::{to_raw, to_reactive};
use crate::value::{Key, Value};

struct CellRef {
    raw: RefCell<Value>,
    value: RefCell<Value>,
    dep: DepSlot,
}

enum RefInner {
    Cell(CellRef),
    Property { target: Value, key: Key },
}

/// An observable value container.
#[derive(Clone)]
pub struct Ref {
    inner: Rc<RefInner>,
}

impl Ref {
    pub fn new(value: impl Into<Value>) -> Self {
        let raw = to_raw(&value.into());
        let value = to_reactive(raw.clone());

        Self {
            inner: Rc::new(RefInner::Cell(CellRef {
                raw: RefCell::new(raw),
                value: RefCell::new(value),
                dep: DepSlot::default(),
            })),
        }
    }

    fn projection(target: Value, key: Key) -> Self {
        Self {
            inner: Rc::new(RefInner::Property { target, key }),
        }
    }

    /// Read the value, subscribing the active computation.
    pub fn get(&self) -> Value {
        match &*self.inner {
            RefInner::Cell(cell) => {
                cell.dep.track("ref");
                cell.value.borrow().clone()
            }
            RefInner::Property { target, key } => read_property(target, key),
        }
    }

    /// Write the value. Returns whether it changed; subscribers are only
    /// notified when it did.
    pub fn set(&self, value: impl Into<Value>) -> bool {
        match &*self.inner {
            RefInner::Cell(cell) => {
                let raw = to_raw(&value.into());
                if *cell.raw.borrow() == raw {
                    return false;
                }
                *cell.value.borrow_mut() = to_reactive(raw.clone());
                *cell.raw.borrow_mut() = raw;
                cell.dep.trigger();
                true
            }
            RefInner::Property { target, key } => write_property(target, key, value.into()),
        }
    }

    /// Whether this ref reads through to a property of another structure.
    pub fn is_projection(&self) -> bool {
        matches!(&*self.inner, RefInner::Property { .. })
    }

    /// Number of computations subscribed to this ref's own dependency set.
    ///
    /// Always zero for projections, whose subscribers live on the target.
    pub fn subscriber_count(&self) -> usize {
        match &*self.inner {
            RefInner::Cell(cell) => cell.dep.subscriber_count(),
            RefInner::Property { .. } => 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn has_dep(&self) -> bool {
        match &*self.inner {
            RefInner::Cell(cell) => cell.dep.is_allocated(),
            RefInner::Property { .. } => false,
        }
    }

    pub fn ptr_eq(&self, other: &Ref) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            RefInner::Cell(cell) => f.debug_tuple("Ref").field(&*cell.raw.borrow()).finish(),
            RefInner::Property { key, .. } => f.debug_struct("Ref").field("key", key).finish(),
        }
    }
}

fn read_property(target: &Value, key: &Key) -> Value {
    match target {
        Value::Reactive(proxy) => proxy.get(key),
        Value::Object(object) => object.get(key.as_str()).unwrap_or_default(),
        _ => Value::Null,
    }
}

fn write_property(target: &Value, key: &Key, value: Value) -> bool {
    match target {
        Value::Reactive(proxy) => proxy.set(key, value),
        Value::Object(object) => {
            let value = to_raw(&value);
            if object.get(key.as_str()).as_ref() == Some(&value) {
                return false;
            }
            object.insert(key, value);
            true
        }
        _ => false,
    }
}

/// The raw value of `target[key]`, without tracking.
fn peek_property(target: &Value, key: &Key) -> Option<Value> {
    match target {
        Value::Reactive(proxy) => proxy.raw().get(key.as_str()),
        Value::Object(object) => object.get(key.as_str()),
        _ => None,
    }
}

/// Create a ref holding `value`.
pub fn ref_value(value: impl Into<Value>) -> Ref {
    Ref::new(value)
}

/// A ref bound to `target[key]`.
///
/// If the property already holds a ref, that ref is returned.
pub fn to_ref(target: &Value, key: impl Into<Key>) -> Ref {
    let key = key.into();
    if let Some(Value::Ref(existing)) = peek_property(target, &key) {
        return existing;
    }
    Ref::projection(target.clone(), key)
}

/// One projected ref per property of `target`, in key order.
pub fn to_refs(target: &Value) -> IndexMap<Key, Ref> {
    let keys = match target {
        Value::Reactive(proxy) => proxy.raw().keys(),
        Value::Object(object) => object.keys(),
        _ => Vec::new(),
    };

    keys.into_iter()
        .map(|key| {
            let r = to_ref(target, key.clone());
            (key, r)
        })
        .collect()
}

pub fn is_ref(value: &Value) -> bool {
    matches!(value, Value::Ref(_))
}

/// The value of a ref, or the value itself.
pub fn unref(value: &Value) -> Value {
    match value {
        Value::Ref(r) => r.get(),
        other => other.clone(),
    }
}

/// A view that unwraps the refs stored in a structure.
#[derive(Clone, Debug)]
pub struct ProxyRefs {
    target: Value,
}

impl ProxyRefs {
    /// Read `key`, returning a ref's value instead of the ref.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        unref(&read_property(&self.target, &key.into()))
    }

    /// Write `key`: through the stored ref if there is one, plainly otherwise.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> bool {
        let key = key.into();
        let value = value.into();

        let existing = untracked(|| peek_property(&self.target, &key));
        match existing {
            Some(Value::Ref(r)) if !is_ref(&value) => r.set(value),
            _ => write_property(&self.target, &key, value),
        }
    }

    pub fn target(&self) -> &Value {
        &self.target
    }
}

/// Wrap `target` so that stored refs read and write as plain values.
pub fn proxy_refs(target: impl Into<Value>) -> ProxyRefs {
    ProxyRefs {
        target: target.into(),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{effect, is_reactive, reactive};
    use crate::value::Object;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn ref_notifies_on_change_only() {
        let count = ref_value(0);
        let runs = Rc::new(Cell::new(0));

        let (c, r) = (count.clone(), runs.clone());
        let _runner = effect(move || {
            r.set(r.get() + 1);
            c.get()
        });

        assert!(count.set(1));
        assert_eq!(runs.get(), 2);
        assert!(!count.set(1));
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn dep_is_lazy_and_released() {
        let r = ref_value("x");
        assert!(!r.has_dep());

        // Untracked reads allocate nothing.
        assert_eq!(r.get(), Value::from("x"));
        assert!(!r.has_dep());

        let r2 = r.clone();
        let runner = effect(move || r2.get());
        assert!(r.has_dep());
        assert_eq!(r.subscriber_count(), 1);

        runner.stop();
        assert!(!r.has_dep());
    }

    #[test]
    fn objects_are_observed_through_the_ref() {
        let r = ref_value(json!({"n": 1}));
        let value = r.get();
        assert!(is_reactive(&value));
        // Same proxy on every read.
        assert_eq!(value, r.get());

        let runs = Rc::new(Cell::new(0));
        let (r2, runs2) = (r.clone(), runs.clone());
        let _runner = effect(move || {
            runs2.set(runs2.get() + 1);
            r2.get().as_reactive().map(|p| p.get("n"))
        });

        value.as_reactive().unwrap().set("n", 2);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn setting_the_proxy_of_the_held_object_is_not_a_change() {
        let raw = Object::new();
        let r = ref_value(raw.clone());
        assert!(!r.set(reactive(raw)));
    }

    #[test]
    fn projection_reads_and_writes_the_target() {
        let state = reactive(json!({"a": 1, "b": 2}));
        let a = to_ref(&state, "a");
        assert!(a.is_projection());
        assert_eq!(a.get(), Value::Int(1));

        let runs = Rc::new(Cell::new(0));
        let (a2, runs2) = (a.clone(), runs.clone());
        let _runner = effect(move || {
            runs2.set(runs2.get() + 1);
            a2.get()
        });

        state.as_reactive().unwrap().set("a", 10);
        assert_eq!(runs.get(), 2);
        assert_eq!(a.get(), Value::Int(10));

        a.set(11);
        assert_eq!(runs.get(), 3);
        assert_eq!(state.as_reactive().unwrap().get("a"), Value::Int(11));
    }

    #[test]
    fn projection_over_plain_object_is_untracked() {
        let plain = Value::from(json!({"a": 1}));
        let a = to_ref(&plain, "a");
        let runs = Rc::new(Cell::new(0));

        let (a2, runs2) = (a.clone(), runs.clone());
        let _runner = effect(move || {
            runs2.set(runs2.get() + 1);
            a2.get()
        });

        assert!(a.set(5));
        assert_eq!(runs.get(), 1);
        assert_eq!(plain.as_object().unwrap().get("a"), Some(Value::Int(5)));
    }

    #[test]
    fn to_refs_covers_every_key_in_order() {
        let state = reactive(json!({"x": 1, "y": 2}));
        let refs = to_refs(&state);

        let keys: Vec<_> = refs.keys().map(Key::as_str).collect();
        assert_eq!(keys, ["x", "y"]);
        assert_eq!(refs["y"].get(), Value::Int(2));
    }

    #[test]
    fn to_ref_returns_stored_refs() {
        let inner = ref_value(1);
        let holder = Value::from(Object::from_entries([("r", inner.clone())]));
        assert!(to_ref(&holder, "r").ptr_eq(&inner));
    }

    #[test]
    fn proxy_refs_unwraps_and_writes_through() {
        let count = ref_value(1);
        let holder = proxy_refs(Object::from_entries([
            ("count", Value::from(count.clone())),
            ("plain", Value::Int(2)),
        ]));

        assert_eq!(holder.get("count"), Value::Int(1));
        assert_eq!(holder.get("plain"), Value::Int(2));

        holder.set("count", 5);
        assert_eq!(count.get(), Value::Int(5));

        holder.set("plain", 3);
        assert_eq!(holder.get("plain"), Value::Int(3));

        // Assigning a ref replaces the stored ref.
        let other = ref_value(9);
        holder.set("count", other.clone());
        assert_eq!(holder.get("count"), Value::Int(9));
        assert_eq!(count.get(), Value::Int(5));
    }

    #[test]
    fn unref_passes_plain_values_through() {
        assert_eq!(unref(&Value::from(ref_value(3))), Value::Int(3));
        assert_eq!(unref(&Value::Int(4)), Value::Int(4));
        assert!(!is_ref(&Value::Int(4)));
    }
}
