//! Computed Values
//!
//! A [`Computed`] is a cached value derived from other observed state.
//!
//! Computeds are lazy. The getter only runs when the value is read while
//! dirty. When a dependency changes, the computed does not re-run; it marks
//! itself dirty and notifies its own readers, which pull the fresh value on
//! their next read.
//!
//! # Example
//!
//! ```rust,ignore
//! let count = ref_value(2);
//! let c = count.clone();
//! let doubled = computed(move || c.get().as_i64().unwrap_or(0) * 2);
//!
//! assert_eq!(doubled.get(), Value::Int(4));
//! count.set(5);
//! assert_eq!(doubled.get(), Value::Int(10));
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{error, warn};

use super::dep::DepSlot;
use super::effect::{Computation, Scheduler};
use crate::error::Result;
use crate::value::Value;

type Setter = Box<dyn Fn(Value)>;

struct ComputedInner {
    computation: Computation,
    value: RefCell<Value>,
    dep: DepSlot,
    setter: Option<Setter>,
}

/// A lazily evaluated, cached derived value.
#[derive(Clone)]
pub struct Computed {
    inner: Rc<ComputedInner>,
}

impl Computed {
    fn build<G, R>(getter: G, setter: Option<Setter>) -> Self
    where
        G: Fn() -> R + 'static,
        R: Into<Value>,
    {
        let inner = Rc::new_cyclic(|weak: &Weak<ComputedInner>| {
            let weak = weak.clone();
            let scheduler: Scheduler = Rc::new(move |_: &Computation| {
                if let Some(inner) = weak.upgrade() {
                    inner.dep.trigger();
                }
            });

            let computation = Computation::new(move || getter().into(), Some(scheduler));
            computation.mark_derived();
            computation.set_label("computed");

            ComputedInner {
                computation,
                value: RefCell::new(Value::Null),
                dep: DepSlot::default(),
                setter,
            }
        });

        Self { inner }
    }

    /// Read the value, re-evaluating it first if it is dirty.
    ///
    /// If the getter panics the error is logged and the previous value is
    /// returned; the computed stays dirty and retries on the next read.
    pub fn get(&self) -> Value {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => {
                error!(
                    computation = %self.inner.computation.id(),
                    error = %err,
                    "computed getter failed, returning stale value"
                );
                self.inner.value.borrow().clone()
            }
        }
    }

    /// Read the value, surfacing a panicking getter as an error.
    pub fn try_get(&self) -> Result<Value> {
        let inner = &self.inner;

        let result = if inner.computation.is_dirty() {
            match inner.computation.run() {
                Ok(value) => {
                    *inner.value.borrow_mut() = value;
                    Ok(())
                }
                Err(err) => {
                    inner.computation.set_dirty(true);
                    Err(err)
                }
            }
        } else {
            Ok(())
        };

        inner.dep.track("computed");
        result.map(|()| inner.value.borrow().clone())
    }

    /// Write through the setter. Computeds without one ignore the write.
    pub fn set(&self, value: impl Into<Value>) {
        match &self.inner.setter {
            Some(setter) => setter(value.into()),
            None => warn!(
                computation = %self.inner.computation.id(),
                "write to a computed without a setter ignored"
            ),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.computation.is_dirty()
    }

    pub fn is_writable(&self) -> bool {
        self.inner.setter.is_some()
    }

    /// Number of computations reading this computed.
    pub fn subscriber_count(&self) -> usize {
        self.inner.dep.subscriber_count()
    }

    /// The computation evaluating the getter.
    pub fn computation(&self) -> &Computation {
        &self.inner.computation
    }

    pub fn ptr_eq(&self, other: &Computed) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("dirty", &self.is_dirty())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// A read-only computed value.
pub fn computed<G, R>(getter: G) -> Computed
where
    G: Fn() -> R + 'static,
    R: Into<Value>,
{
    Computed::build(getter, None)
}

/// A computed value with a setter.
pub fn computed_with_setter<G, R, S>(getter: G, setter: S) -> Computed
where
    G: Fn() -> R + 'static,
    R: Into<Value>,
    S: Fn(Value) + 'static,
{
    Computed::build(getter, Some(Box::new(setter)))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
