//! Job Queue
//!
//! Pending jobs are kept in first-enqueue order with duplicates collapsed,
//! so a job queued several times before a flush runs once, at the position
//! of its first enqueue.
//!
//! A flush takes the whole queue and runs it. Jobs queued while a flush is
//! running wait for the next flush, which is requested from the host as
//! soon as they arrive.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use tracing::{debug, error, warn};

use super::host::request_flush;
use super::scheduler_config;
use crate::error::{ReactiveError, Result};

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// A unit of deferred work.
///
/// Clones share the same identity, so queueing a clone of a pending job is
/// a no-op.
#[derive(Clone)]
pub struct Job {
    id: JobId,
    run: Rc<dyn Fn()>,
}

impl Job {
    pub fn new(run: impl Fn() + 'static) -> Self {
        Self {
            id: JobId::new(),
            run: Rc::new(run),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Run the job now, outside of any flush.
    pub fn run(&self) {
        (self.run)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish()
    }
}

#[derive(Default)]
struct JobQueue {
    pending: RefCell<IndexMap<JobId, Job>>,
    flush_scheduled: Cell<bool>,
    flushing: Cell<bool>,
    flushes: Cell<u64>,
}

thread_local! {
    static QUEUE: JobQueue = JobQueue::default();
}

/// Add `job` to the queue and make sure a flush is on its way.
pub fn queue_job(job: &Job) {
    let schedule = QUEUE.with(|queue| {
        queue
            .pending
            .borrow_mut()
            .entry(job.id())
            .or_insert_with(|| job.clone());
        !queue.flush_scheduled.replace(true)
    });

    if schedule {
        request_flush();
    }
}

/// Remove a pending job. Returns whether it was queued.
pub fn cancel_job(id: JobId) -> bool {
    QUEUE.with(|queue| queue.pending.borrow_mut().shift_remove(&id).is_some())
}

pub fn has_pending_jobs() -> bool {
    QUEUE.with(|queue| !queue.pending.borrow().is_empty())
}

pub fn pending_job_count() -> usize {
    QUEUE.with(|queue| queue.pending.borrow().len())
}

/// Whether a flush has been requested and has not started yet.
pub fn is_flush_scheduled() -> bool {
    QUEUE.with(|queue| queue.flush_scheduled.get())
}

pub fn is_flushing() -> bool {
    QUEUE.with(|queue| queue.flushing.get())
}

/// Number of flush passes started on this thread.
pub(crate) fn flush_count() -> u64 {
    QUEUE.with(|queue| queue.flushes.get())
}

/// Run every pending job once, in first-enqueue order.
///
/// Returns the number of jobs run. Calling this from inside a job does
/// nothing.
pub fn flush_jobs() -> usize {
    let jobs = QUEUE.with(|queue| {
        if queue.flushing.get() {
            return None;
        }
        queue.flushing.set(true);
        queue.flush_scheduled.set(false);
        queue.flushes.set(queue.flushes.get() + 1);
        Some(std::mem::take(&mut *queue.pending.borrow_mut()))
    });

    let Some(jobs) = jobs else {
        debug!("nested flush ignored");
        return 0;
    };

    let _guard = FlushingGuard;
    let count = jobs.len();
    debug!(jobs = count, "flushing job queue");

    for (id, job) in jobs {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
            let err = ReactiveError::panicked(&id.to_string(), payload);
            error!(job = %id, error = %err, "job panicked during flush");
        }
    }

    count
}

/// Flush until the queue stays empty.
///
/// Gives up after [`SchedulerConfig::max_flush_passes`](super::SchedulerConfig)
/// passes, which happens when jobs keep re-queueing each other.
pub fn run_until_idle() -> Result<usize> {
    let max_passes = scheduler_config().max_flush_passes;
    let mut passes = 0;
    let mut total = 0;

    while has_pending_jobs() {
        if passes == max_passes {
            warn!(passes, pending = pending_job_count(), "job queue did not settle");
            return Err(ReactiveError::FlushLimitExceeded { passes });
        }
        total += flush_jobs();
        passes += 1;
    }

    Ok(total)
}

struct FlushingGuard;

impl Drop for FlushingGuard {
    fn drop(&mut self) {
        let _ = QUEUE.try_with(|queue| queue.flushing.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{configure_scheduler, SchedulerConfig};

    fn recording_job(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str) -> Job {
        let log = log.clone();
        Job::new(move || log.borrow_mut().push(name))
    }

    #[test]
    fn duplicates_run_once_in_first_enqueue_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = recording_job(&log, "a");
        let b = recording_job(&log, "b");

        queue_job(&a);
        queue_job(&b);
        queue_job(&a);
        assert_eq!(pending_job_count(), 2);
        assert!(is_flush_scheduled());

        assert_eq!(flush_jobs(), 2);
        assert_eq!(*log.borrow(), ["a", "b"]);
        assert!(!is_flush_scheduled());
        assert!(!has_pending_jobs());
    }

    #[test]
    fn jobs_queued_during_a_flush_wait_for_the_next_one() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let later = recording_job(&log, "later");

        let (log2, later2) = (log.clone(), later.clone());
        let first = Job::new(move || {
            log2.borrow_mut().push("first");
            queue_job(&later2);
            assert!(is_flushing());
        });

        queue_job(&first);
        assert_eq!(flush_jobs(), 1);
        assert_eq!(*log.borrow(), ["first"]);
        assert!(is_flush_scheduled());

        assert_eq!(flush_jobs(), 1);
        assert_eq!(*log.borrow(), ["first", "later"]);
    }

    #[test]
    fn cancelled_jobs_do_not_run() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = recording_job(&log, "a");

        queue_job(&a);
        assert!(cancel_job(a.id()));
        assert!(!cancel_job(a.id()));
        flush_jobs();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn panicking_job_does_not_stop_the_flush() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let bad = Job::new(|| panic!("job failure"));
        let good = recording_job(&log, "good");

        queue_job(&bad);
        queue_job(&good);
        assert_eq!(flush_jobs(), 2);
        assert_eq!(*log.borrow(), ["good"]);
        assert!(!is_flushing());
    }

    #[test]
    fn run_until_idle_drains_follow_up_jobs() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let second = recording_job(&log, "second");

        let second2 = second.clone();
        let first = Job::new(move || queue_job(&second2));

        queue_job(&first);
        assert_eq!(run_until_idle(), Ok(2));
        assert_eq!(*log.borrow(), ["second"]);
    }

    #[test]
    fn run_until_idle_gives_up_on_self_requeueing_jobs() {
        configure_scheduler(SchedulerConfig { max_flush_passes: 5 });

        let slot: Rc<RefCell<Option<Job>>> = Rc::new(RefCell::new(None));
        let slot2 = slot.clone();
        let looping = Job::new(move || {
            if let Some(job) = slot2.borrow().as_ref() {
                queue_job(job);
            }
        });
        *slot.borrow_mut() = Some(looping.clone());

        queue_job(&looping);
        assert_eq!(
            run_until_idle(),
            Err(ReactiveError::FlushLimitExceeded { passes: 5 })
        );

        // Break the cycle so the queue can drain.
        slot.borrow_mut().take();
        assert_eq!(run_until_idle(), Ok(1));
    }
}
