//! Host Integration
//!
//! The queue never flushes by itself. When the first job of a batch arrives
//! it hands a flush task to the host through the installed flush hook, and
//! the host runs that task once the current synchronous work is done.
//!
//! Without a hook, flushing is manual: call [`flush_jobs`] or
//! [`run_until_idle`](super::run_until_idle) at a point of your choosing.
//!
//! # Example
//!
//! ```rust,ignore
//! let local = tokio::task::LocalSet::new();
//! local
//!     .run_until(async {
//!         install_tokio_local_hook();
//!         state.set("count", 1);
//!         next_tick().await; // watchers have run
//!     })
//!     .await;
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use super::queue::{flush_count, flush_jobs, is_flush_scheduled};

/// The deferred flush handed to the host.
pub type FlushTask = Box<dyn FnOnce()>;

type FlushHook = Rc<dyn Fn(FlushTask)>;

thread_local! {
    static FLUSH_HOOK: RefCell<Option<FlushHook>> = const { RefCell::new(None) };
}

/// Install the function that schedules flushes on this thread.
///
/// The hook receives a task and must run it later, outside the current call
/// stack (the host's equivalent of a microtask).
pub fn set_flush_hook<F>(hook: F)
where
    F: Fn(FlushTask) + 'static,
{
    FLUSH_HOOK.with(|slot| *slot.borrow_mut() = Some(Rc::new(hook)));
}

pub fn clear_flush_hook() {
    FLUSH_HOOK.with(|slot| slot.borrow_mut().take());
}

pub fn has_flush_hook() -> bool {
    FLUSH_HOOK.with(|slot| slot.borrow().is_some())
}

/// Flush on the tokio `LocalSet` the caller is running on.
///
/// Must be called from inside a `LocalSet`; the hook spawns with
/// [`tokio::task::spawn_local`].
pub fn install_tokio_local_hook() {
    set_flush_hook(|task| {
        tokio::task::spawn_local(async move { task() });
    });
}

/// Hand a flush task to the host, if one is installed.
pub(crate) fn request_flush() {
    let hook = FLUSH_HOOK.with(|slot| slot.borrow().clone());
    match hook {
        Some(hook) => {
            trace!("flush requested");
            hook(Box::new(|| {
                flush_jobs();
            }));
        }
        None => trace!("flush requested without a hook; waiting for a manual flush"),
    }
}

/// Wait until the flush scheduled at the time of the call has run.
///
/// Without a flush hook the pending jobs are flushed directly after
/// yielding once.
pub async fn next_tick() {
    let started = flush_count();
    let waiting = is_flush_scheduled();
    tokio::task::yield_now().await;

    if !waiting {
        return;
    }
    if !has_flush_hook() {
        if flush_count() == started {
            flush_jobs();
        }
        return;
    }
    while flush_count() == started && has_flush_hook() {
        tokio::task::yield_now().await;
    }
}
