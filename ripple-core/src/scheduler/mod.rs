//! Batched Scheduler
//!
//! Watchers do not re-run inside the write that invalidated them. Their jobs
//! go into a per-thread queue that is flushed once the current synchronous
//! work is finished, so several writes in a row cost one re-run per job.
//!
//! # Concepts
//!
//! ## Jobs
//!
//! A [`Job`] is a callback with a stable identity. Queueing the same job
//! again before the flush does nothing; the job keeps the position of its
//! first enqueue.
//!
//! ## Flushing
//!
//! The first job of a batch asks the host for a flush through the flush hook
//! (see [`set_flush_hook`] and [`install_tokio_local_hook`]). Hosts without
//! an event loop flush by hand with [`flush_jobs`] or [`run_until_idle`].

mod host;
mod queue;

use std::cell::Cell;

use serde::{Deserialize, Serialize};

pub use host::{
    clear_flush_hook, has_flush_hook, install_tokio_local_hook, next_tick, set_flush_hook,
    FlushTask,
};
pub use queue::{
    cancel_job, flush_jobs, has_pending_jobs, is_flush_scheduled, is_flushing, pending_job_count,
    queue_job, run_until_idle, Job, JobId,
};

/// Scheduler settings for the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Passes [`run_until_idle`] makes before reporting that the queue does
    /// not settle.
    pub max_flush_passes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_flush_passes: 100,
        }
    }
}

thread_local! {
    static CONFIG: Cell<SchedulerConfig> = Cell::new(SchedulerConfig::default());
}

pub fn configure_scheduler(config: SchedulerConfig) {
    CONFIG.with(|current| current.set(config));
}

pub fn scheduler_config() -> SchedulerConfig {
    CONFIG.with(Cell::get)
}
