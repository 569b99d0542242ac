//! Ripple Core
//!
//! This crate provides a fine-grained reactive engine: state that records
//! who reads it and notifies them when it changes.
//! It implements:
//!
//! - Observed structures and refs with automatic dependency tracking
//! - Lazily cached computed values
//! - Effects and watchers
//! - A batched job scheduler that coalesces re-runs
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `value`: the dynamic value model observed state is made of
//! - `reactive`: dependency tracking and the reactive primitives
//! - `scheduler`: the deferred job queue and its host integration
//! - `error`: errors surfaced at user-code boundaries
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::reactive::{computed, effect, reactive};
//! use serde_json::json;
//!
//! // Observe a structure
//! let state = reactive(json!({"count": 1}));
//! let state = state.as_reactive().unwrap().clone();
//!
//! // Create a derived value
//! let s = state.clone();
//! let doubled = computed(move || s.get("count").as_i64().unwrap_or(0) * 2);
//!
//! // Create an effect
//! let d = doubled.clone();
//! effect(move || println!("doubled: {:?}", d.get()));
//!
//! // Update the state
//! state.set("count", 5);
//! // Effect automatically runs, prints: "doubled: Int(10)"
//! ```

pub mod error;
pub mod reactive;
pub mod scheduler;
pub mod value;

pub use error::{ReactiveError, Result};
pub use reactive::{
    computed, effect, reactive, ref_value, watch, watch_effect, Computed, Reactive, Ref,
    WatchOptions,
};
pub use value::{Key, Object, ObjectKind, Value};
