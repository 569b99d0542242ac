//! Observation Proxies
//!
//! A [`Reactive`] wraps one raw [`Object`] and routes every access through
//! the track/trigger protocol. Reads subscribe the active computation; writes
//! that change a property notify its subscribers.
//!
//! There is at most one live proxy per object: wrapping the same object again
//! returns the same proxy, so `reactive(x) == reactive(x)`. Nested objects are
//! wrapped lazily as they are read.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::trace;

use super::runtime::{track_key, trigger_key, Runtime, TableKey};
use crate::value::{Key, Object, Value};

/// Entries below this count are never swept.
const MIN_SWEEP_THRESHOLD: usize = 64;

struct ProxyInner {
    target: Object,
}

struct ProxyMap {
    proxies: HashMap<usize, Weak<ProxyInner>>,
    sweep_at: usize,
}

impl ProxyMap {
    fn new() -> Self {
        Self {
            proxies: HashMap::new(),
            sweep_at: MIN_SWEEP_THRESHOLD,
        }
    }

    fn get_or_wrap(&mut self, target: &Object) -> Rc<ProxyInner> {
        let addr = target.addr();
        // A live proxy keeps its target alive, so a hit is always for `target`.
        if let Some(existing) = self.proxies.get(&addr).and_then(Weak::upgrade) {
            return existing;
        }

        self.sweep();
        let inner = Rc::new(ProxyInner {
            target: target.clone(),
        });
        self.proxies.insert(addr, Rc::downgrade(&inner));
        inner
    }

    fn sweep(&mut self) {
        if self.proxies.len() < self.sweep_at {
            return;
        }
        let before = self.proxies.len();
        self.proxies.retain(|_, proxy| proxy.strong_count() > 0);
        self.sweep_at = (self.proxies.len() * 2).max(MIN_SWEEP_THRESHOLD);
        trace!(
            swept = before - self.proxies.len(),
            remaining = self.proxies.len(),
            "swept proxy table"
        );
    }
}

thread_local! {
    static PROXY_MAP: RefCell<ProxyMap> = RefCell::new(ProxyMap::new());
}

/// An observed view of an [`Object`].
#[derive(Clone)]
pub struct Reactive {
    inner: Rc<ProxyInner>,
}

impl Reactive {
    /// The proxy for `target`, created on first use.
    pub fn wrap(target: &Object) -> Self {
        let inner = PROXY_MAP.with(|map| map.borrow_mut().get_or_wrap(target));
        Self { inner }
    }

    fn target(&self) -> &Object {
        &self.inner.target
    }

    /// Read a property.
    ///
    /// Returns `Null` for an absent key. Object values come back wrapped.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        let key = key.into();
        Runtime::track(self.target(), &key);

        match self.target().get(key.as_str()) {
            Some(Value::Object(nested)) => Value::Reactive(Reactive::wrap(&nested)),
            Some(value) => value,
            None => Value::Null,
        }
    }

    /// Write a property, notifying subscribers when the stored value changed.
    ///
    /// Proxies are stored as their raw target. Returns whether anything
    /// changed; adding a key always counts as a change.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> bool {
        let key = key.into();
        let value = to_raw(&value.into());

        let old = self.target().get(key.as_str());
        if old.as_ref() == Some(&value) {
            return false;
        }

        let added = old.is_none();
        self.target().insert(key.clone(), value.clone());
        Runtime::trigger(self.target(), &key, Some(&value), old.as_ref());
        if added {
            trigger_key(self.target(), &TableKey::Iterate);
        }
        true
    }

    /// Whether `key` is present. Tracks the key, so adding or removing it
    /// notifies the reader.
    pub fn has(&self, key: impl Into<Key>) -> bool {
        let key = key.into();
        Runtime::track(self.target(), &key);
        self.target().contains_key(key.as_str())
    }

    /// The property names, in insertion order. Tracks the key set.
    pub fn keys(&self) -> Vec<Key> {
        track_key(self.target(), TableKey::Iterate);
        self.target().keys()
    }

    /// Number of properties. Tracks the key set.
    pub fn len(&self) -> usize {
        track_key(self.target(), TableKey::Iterate);
        self.target().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a property, notifying readers of the key and of the key set.
    pub fn remove(&self, key: impl Into<Key>) -> Option<Value> {
        let key = key.into();
        let old = self.target().remove(key.as_str())?;

        Runtime::trigger(self.target(), &key, None, Some(&old));
        trigger_key(self.target(), &TableKey::Iterate);
        Some(old)
    }

    /// Append under the next index key.
    pub fn push(&self, value: impl Into<Value>) {
        let index = self.target().len();
        self.set(index, value);
    }

    /// The wrapped object. Accesses through it are not observed.
    pub fn raw(&self) -> Object {
        self.target().clone()
    }

    pub fn ptr_eq(&self, other: &Reactive) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Reactive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reactive").field(self.target()).finish()
    }
}

/// Observe `value`.
///
/// Objects are wrapped in their (memoised) proxy; proxies and everything
/// else are returned unchanged.
pub fn reactive(value: impl Into<Value>) -> Value {
    match value.into() {
        Value::Object(target) => Value::Reactive(Reactive::wrap(&target)),
        other => other,
    }
}

pub fn is_reactive(value: &Value) -> bool {
    matches!(value, Value::Reactive(_))
}

/// The raw object behind a proxy; other values unchanged.
pub fn to_raw(value: &Value) -> Value {
    match value {
        Value::Reactive(proxy) => Value::Object(proxy.raw()),
        other => other.clone(),
    }
}

/// Wrap `value` if it is an object.
pub fn to_reactive(value: Value) -> Value {
    reactive(value)
}

/// Number of proxies in the memo table that are still alive.
#[doc(hidden)]
pub fn live_proxy_count() -> usize {
    PROXY_MAP.with(|map| {
        map.borrow()
            .proxies
            .values()
            .filter(|proxy| proxy.strong_count() > 0)
            .count()
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
