//! Error types for user-code boundaries.
//!
//! Tracking and triggering never fail. Errors only surface where the engine
//! calls into user code (effect bodies, getters, watch callbacks, queued
//! jobs) or where the host drives the scheduler.

use std::any::Any;

#[doc(hidden)]
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReactiveError {
    /// A user-supplied function panicked while the engine was running it.
    ///
    /// The panic is caught at the computation boundary so the dependency
    /// graph stays consistent.
    #[error("computation `{label}` panicked: {message}")]
    Panicked { label: String, message: String },

    /// `run_until_idle` gave up because jobs kept re-queueing themselves.
    #[error("scheduler did not settle after {passes} flush passes")]
    FlushLimitExceeded { passes: usize },
}

impl ReactiveError {
    pub(crate) fn panicked(label: &str, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };

        Self::Panicked {
            label: label.to_string(),
            message,
        }
    }
}
