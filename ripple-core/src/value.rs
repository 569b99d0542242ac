//! Dynamic Values
//!
//! Observed state is expressed through a small dynamic value model. Scalars
//! are plain data; structures are [`Object`]s, which have shared identity so
//! that the engine can attach dependency data to them and memoize one proxy
//! per structure.
//!
//! # Equality
//!
//! `Value` equality is strict identity comparison: scalars compare by value,
//! strings by content, and objects, proxies and refs by pointer. A write is
//! only a change when the old and new values are not equal under this
//! comparison.

use std::borrow::Borrow;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::reactive::{untracked, Reactive, Ref};

/// A property name on an [`Object`].
///
/// Array elements use their decimal index as the key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Rc<str>);

impl Key {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(Rc::from(s))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(Rc::from(s))
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Self(Rc::from(index.to_string()))
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether an object behaves as a keyed map or an index-keyed array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Map,
    Array,
}

pub(crate) struct ObjectInner {
    kind: ObjectKind,
    props: RefCell<IndexMap<Key, Value>>,
}

/// A raw, unobserved structure.
///
/// Reads and writes on an `Object` are never tracked. Wrap it with
/// [`reactive`](crate::reactive::reactive) to observe it.
#[derive(Clone)]
pub struct Object(Rc<ObjectInner>);

impl Object {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::with_kind(ObjectKind::Map)
    }

    /// Create an empty array.
    pub fn array() -> Self {
        Self::with_kind(ObjectKind::Array)
    }

    fn with_kind(kind: ObjectKind) -> Self {
        Self(Rc::new(ObjectInner {
            kind,
            props: RefCell::new(IndexMap::new()),
        }))
    }

    /// Build a map from key/value pairs, keeping their order.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Key>,
        V: Into<Value>,
    {
        let object = Self::new();
        {
            let mut props = object.0.props.borrow_mut();
            for (key, value) in entries {
                props.insert(key.into(), value.into());
            }
        }
        object
    }

    /// Build an array from items.
    pub fn from_items<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let object = Self::array();
        for item in items {
            object.push(item);
        }
        object
    }

    pub fn kind(&self) -> ObjectKind {
        self.0.kind
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.props.borrow().get(key).cloned()
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&self, key: impl Into<Key>, value: impl Into<Value>) -> Option<Value> {
        self.0.props.borrow_mut().insert(key.into(), value.into())
    }

    /// Append to an array (or to a map, under the next index key).
    pub fn push(&self, value: impl Into<Value>) {
        let mut props = self.0.props.borrow_mut();
        let key = Key::from(props.len());
        props.insert(key, value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.props.borrow_mut().shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.props.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<Key> {
        self.0.props.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.props.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Stable address used to key the engine's side tables.
    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub(crate) fn downgrade(&self) -> WeakObject {
        WeakObject(Rc::downgrade(&self.0))
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Contents are omitted: objects may contain themselves.
        f.debug_struct("Object")
            .field("kind", &self.kind())
            .field("len", &self.len())
            .finish()
    }
}

/// Weak handle to an object, used by side tables that must not keep it alive.
#[derive(Clone)]
pub(crate) struct WeakObject(Weak<ObjectInner>);

impl WeakObject {
    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// A dynamically typed value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    /// A raw structure.
    Object(Object),
    /// An observation proxy over a structure.
    Reactive(Reactive),
    /// A single-value container.
    Ref(Ref),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for values that [`reactive`](crate::reactive::reactive) can wrap.
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_reactive(&self) -> Option<&Reactive> {
        match self {
            Value::Reactive(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_ref_handle(&self) -> Option<&Ref> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Reactive(_) => "reactive",
            Value::Ref(_) => "ref",
        }
    }

    /// Snapshot the value as JSON without tracking anything.
    ///
    /// Proxies serialize as their target, refs as their current value.
    /// A structure that contains itself is cut off with `null`.
    pub fn to_json(&self) -> serde_json::Value {
        untracked(|| to_json_inner(self, &mut HashSet::new()))
    }
}

fn to_json_inner(value: &Value, seen: &mut HashSet<usize>) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::from(*n),
        Value::Float(n) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Str(s) => Json::String(s.to_string()),
        Value::Reactive(p) => to_json_inner(&Value::Object(p.raw()), seen),
        Value::Ref(r) => to_json_inner(&r.get(), seen),
        Value::Object(o) => {
            if !seen.insert(o.addr()) {
                return Json::Null;
            }
            let entries: Vec<(Key, Value)> = o
                .0
                .props
                .borrow()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let json = match o.kind() {
                ObjectKind::Array => Json::Array(
                    entries
                        .iter()
                        .map(|(_, v)| to_json_inner(v, seen))
                        .collect(),
                ),
                ObjectKind::Map => Json::Object(
                    entries
                        .iter()
                        .map(|(k, v)| (k.to_string(), to_json_inner(v, seen)))
                        .collect(),
                ),
            };
            seen.remove(&o.addr());
            json
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Reactive(a), Value::Reactive(b)) => a.ptr_eq(b),
            (Value::Ref(a), Value::Ref(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Float(n) => write!(f, "Float({n})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Object(o) => fmt::Debug::fmt(o, f),
            Value::Reactive(p) => fmt::Debug::fmt(p, f),
            Value::Ref(r) => fmt::Debug::fmt(r, f),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::Str(Rc::from(s)),
            Json::Array(items) => Value::Object(Object::from_items(items)),
            Json::Object(entries) => Value::Object(Object::from_entries(entries)),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Value::Int(n as i64)
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! impl_from_wide_int {
    ($($t:ty),*) => {
        $(
            /// Values beyond the `i64` range become floats.
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    match i64::try_from(n) {
                        Ok(n) => Value::Int(n),
                        Err(_) => Value::Float(n as f64),
                    }
                }
            }
        )*
    };
}

impl_from_wide_int!(u64, usize);

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl From<Reactive> for Value {
    fn from(p: Reactive) -> Self {
        Value::Reactive(p)
    }
}

impl From<Ref> for Value {
    fn from(r: Ref) -> Self {
        Value::Ref(r)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_equality_uses_identity_for_objects() {
        let a = Object::new();
        let b = Object::new();

        assert_eq!(Value::from(a.clone()), Value::from(a.clone()));
        assert_ne!(Value::from(a), Value::from(b));
        assert_eq!(Value::from("x"), Value::from(String::from("x")));
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Float(f64::NAN), Value::Float(f64::NAN));
    }

    #[test]
    fn json_conversion_keeps_shape_and_order() {
        let value = Value::from(json!({"b": 1, "a": [true, "x", 2.5], "c": null}));
        let object = value.as_object().unwrap();

        assert_eq!(object.keys(), vec![Key::from("b"), Key::from("a"), Key::from("c")]);
        let list = object.get("a").unwrap();
        assert_eq!(list.as_object().unwrap().kind(), ObjectKind::Array);
        assert_eq!(list.as_object().unwrap().get("1"), Some(Value::from("x")));

        assert_eq!(value.to_json(), json!({"b": 1, "a": [true, "x", 2.5], "c": null}));
    }

    #[test]
    fn self_referencing_object_snapshots_without_looping() {
        let object = Object::new();
        object.insert("me", object.clone());
        object.insert("n", 1);

        assert_eq!(Value::from(object).to_json(), json!({"me": null, "n": 1}));
    }

    #[test]
    fn push_uses_index_keys() {
        let list = Object::array();
        list.push(10);
        list.push(20);

        assert_eq!(list.get("1"), Some(Value::Int(20)));
        assert_eq!(list.keys(), vec![Key::from(0usize), Key::from(1usize)]);
    }

    #[test]
    fn wide_integers_out_of_range_become_floats() {
        assert_eq!(Value::from(7usize), Value::Int(7));
        assert_eq!(Value::from(u64::MAX), Value::Float(u64::MAX as f64));
    }
}
