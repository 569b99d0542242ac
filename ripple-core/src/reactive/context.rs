//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when observed state is read,
//! the current computation is subscribed to it.
//!
//! # Implementation
//!
//! We use a thread-local stack. Entering a computation's run pushes it;
//! the guard returned by [`ReactiveContext::enter`] pops it on drop, which
//! restores the previous computation even when the run unwinds.
//!
//! An entry may also be empty: [`untracked`] pushes one so that reads inside
//! it are attributed to nobody.

use std::cell::RefCell;

use super::effect::Computation;
use super::SubscriberId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Option<Computation>>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the context when dropped.
pub struct ReactiveContext {
    subscriber_id: Option<SubscriberId>,
}

impl ReactiveContext {
    /// Make `computation` the active computation until the guard drops.
    pub fn enter(computation: &Computation) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(Some(computation.clone()));
        });

        Self {
            subscriber_id: Some(computation.id()),
        }
    }

    /// Pause tracking until the guard drops.
    pub fn pause() -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(None);
        });

        Self {
            subscriber_id: None,
        }
    }

    /// Check if there is an active computation.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| matches!(stack.borrow().last(), Some(Some(_))))
    }

    /// Get the active computation, if any.
    pub fn current() -> Option<Computation> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().cloned().flatten())
    }

    /// Get the active computation's subscriber ID, if any.
    pub fn current_subscriber() -> Option<SubscriberId> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .and_then(|entry| entry.as_ref().map(Computation::id))
        })
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        // The popped handle is dropped outside the borrow.
        let popped = CONTEXT_STACK
            .try_with(|stack| stack.borrow_mut().pop())
            .ok()
            .flatten();

        if let Some(entry) = popped {
            debug_assert_eq!(
                entry.as_ref().map(Computation::id),
                self.subscriber_id,
                "ReactiveContext mismatch"
            );
        }
    }
}

/// Run `f` without attributing its reads to the active computation.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _ctx = ReactiveContext::pause();
    f()
}
