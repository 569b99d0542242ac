//! Reactive Primitives
//!
//! This module implements the core reactive system: observed structures,
//! refs, computed values, effects and watchers. All of them share one
//! dependency graph that is discovered automatically as code runs.
//!
//! # Concepts
//!
//! ## Observed State
//!
//! [`reactive`] wraps an object in a proxy. Every property read through the
//! proxy is recorded against the computation that is running, and every
//! write that changes a property notifies the computations that read it.
//! A [`Ref`] does the same for a single value.
//!
//! ## Computed Values
//!
//! A [`Computed`] caches a value derived from observed state. It re-evaluates
//! only when read after one of its inputs changed.
//!
//! ## Effects
//!
//! An effect runs immediately and again whenever anything it read changes.
//! Watchers ([`watch`], [`watch_effect`]) do the same through the batched
//! scheduler, so their callbacks run once per flush.
//!
//! # Implementation Notes
//!
//! The active computation lives on a thread-local stack. Each run rebuilds
//! the computation's subscription list; whatever was not read again is
//! unsubscribed when the run ends. The engine is single-threaded: none of
//! its handles are `Send`.

mod computed;
mod context;
mod dep;
mod effect;
mod proxy;
mod refs;
mod runtime;
mod subscriber;
mod watch;

pub use computed::{computed, computed_with_setter, Computed};
pub use context::{untracked, ReactiveContext};
pub use effect::{
    effect, effect_with, Computation, DirtyLevel, EffectOptions, EffectRunner, Scheduler,
};
pub use proxy::{is_reactive, live_proxy_count, reactive, to_raw, to_reactive, Reactive};
pub use refs::{is_ref, proxy_refs, ref_value, to_ref, to_refs, unref, ProxyRefs, Ref};
pub use runtime::Runtime;
pub use subscriber::SubscriberId;
pub use watch::{
    traverse, watch, watch_effect, OnCleanup, WatchHandle, WatchOptions, WatchSource,
};
