//! A job system that schedules fibers over a fixed pool of worker threads.
//!
//! Submitted jobs become fibers on a single MPMC queue shared by all
//! workers, with a counting semaphore tracking how many entries are ready.
//! A job that waits on child jobs suspends its fiber instead of blocking a
//! worker: the fiber re-publishes itself together with a wait counter, the
//! workers poll that counter, and whichever worker observes it hit zero
//! resumes the fiber, not necessarily on the thread it started on.
//!
//! The scheduler state lives behind an `Arc` so the bootstrap path (a wait
//! issued from a thread that is not a fiber, e.g. the main thread) can wrap
//! the whole wait in a fire-and-forget job that re-enters the scheduler
//! from a worker.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use fiber::{Fiber, Job, JobPanic, RunOutcome, WaitCounter};
use log::{debug, error, info};

use crate::concurrent_queue::ConcurrentQueue;
use crate::error::Error;
use crate::job_system::JobSystem;
use crate::semaphore::Semaphore;
use crate::thread::Thread;

/// A fiber published to the worker queue.
struct FiberPtr(*mut Fiber);

// Fibers are designed to move between threads; the queue hand-off plus the
// safe flag and the wait counter serialise every access to the pointee, so
// sending the pointer itself is sound.
unsafe impl Send for FiberPtr {}

/// What workers pull off the shared queue. A present wait counter marks a
/// suspended fiber waiting for that counter to drain; `None` marks a fresh
/// fiber that has never run.
type QueueEntry = (FiberPtr, Option<Arc<WaitCounter>>);

/// Scheduler state shared between the owning system, its workers and any
/// bootstrap jobs.
struct Shared {
    /// Fibers ready to be started, resumed or re-checked.
    fibers: ConcurrentQueue<QueueEntry>,

    /// Counts queue entries; the only place workers block long-term.
    jobs_semaphore: Semaphore,

    /// Cleared once, at shutdown.
    running: AtomicBool,
}

/// Job system backend that multiplexes fibers over a fixed worker pool.
pub struct FiberJobSystem {
    shared: Arc<Shared>,
    workers: Vec<Thread>,
}

impl FiberJobSystem {
    /// Create a job system with one worker per available core, minus one
    /// for the thread the rest of the application runs on.
    pub fn new() -> Result<FiberJobSystem, Error> {
        let parallelism = thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(2);

        FiberJobSystem::with_workers(parallelism.saturating_sub(1))
    }

    /// Create a job system with an explicit worker count. The pool size is
    /// fixed for the lifetime of the system; a count of zero is clamped to
    /// one.
    pub fn with_workers(count: usize) -> Result<FiberJobSystem, Error> {
        let count = count.max(1);

        let shared = Arc::new(Shared {
            fibers: ConcurrentQueue::new(),
            jobs_semaphore: Semaphore::new(0),
            running: AtomicBool::new(true),
        });

        info!("creating {} worker threads", count);

        let mut workers = Vec::with_capacity(count);

        for id in 1..=count {
            let worker_shared = Arc::clone(&shared);

            match Thread::spawn(move || job_thread(id, worker_shared)) {
                Ok(worker) => workers.push(worker),
                Err(error) => {
                    // Partial construction; wind down whatever got started.
                    shutdown(&shared, &mut workers);
                    return Err(error);
                }
            }
        }

        Ok(FiberJobSystem { shared, workers })
    }

    /// Submit fire-and-forget jobs. See [`JobSystem::add_jobs`].
    pub fn add_jobs(&self, jobs: Vec<Job>) -> Result<(), Error> {
        // Build every fiber before publishing any, so an allocation failure
        // rejects the remainder of the batch without having accepted it.
        let fibers = jobs
            .into_iter()
            .map(|job| Fiber::new(job, None).map(Box::into_raw))
            .collect::<Result<Vec<_>, _>>()?;

        for fiber in fibers {
            // The worker that completes the fiber frees it.
            self.shared.fibers.enqueue((FiberPtr(fiber), None));
            self.shared.jobs_semaphore.release();
        }

        Ok(())
    }

    /// Submit jobs and block until they have all completed. See
    /// [`JobSystem::wait_for_jobs`].
    pub fn wait_for_jobs(&self, jobs: Vec<Job>) -> Result<(), Error> {
        if jobs.is_empty() {
            return Ok(());
        }

        if fiber::this_fiber().is_null() {
            // Nothing to suspend; wrap the wait so it runs inside a fiber.
            self.bootstrap_first_job(jobs)
        } else {
            wait_on_fiber(&self.shared, jobs)
        }
    }

    /// Run a wait issued from a non-fiber thread.
    ///
    /// The whole wait is wrapped in one fire-and-forget job, and the caller
    /// blocks on a condvar until that job reports back. The wrapping job
    /// never touches a wait counter itself; only the inner `wait_for_jobs`,
    /// by then running inside a fiber, does.
    fn bootstrap_first_job(&self, jobs: Vec<Job>) -> Result<(), Error> {
        struct Outcome {
            done: bool,
            panic: Option<JobPanic>,
            error: Option<Error>,
        }

        let signal = Arc::new((
            Mutex::new(Outcome {
                done: false,
                panic: None,
                error: None,
            }),
            Condvar::new(),
        ));

        let shared = Arc::clone(&self.shared);
        let job_signal = Arc::clone(&signal);

        let wrapper = Box::new(move || {
            debug!("bootstrap wait started");

            let result = panic::catch_unwind(AssertUnwindSafe(|| wait_on_fiber(&shared, jobs)));

            let (outcome, finished) = &*job_signal;
            let mut outcome = outcome.lock().unwrap();

            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => outcome.error = Some(error),
                Err(payload) => outcome.panic = Some(payload),
            }

            outcome.done = true;
            finished.notify_one();
        }) as Job;

        self.add_jobs(vec![wrapper])?;

        let (outcome, finished) = &*signal;
        let mut outcome = outcome.lock().unwrap();

        while !outcome.done {
            outcome = finished.wait(outcome).unwrap();
        }

        debug!("non-fiber wait complete");

        if let Some(payload) = outcome.panic.take() {
            panic::resume_unwind(payload);
        }

        if let Some(error) = outcome.error.take() {
            return Err(error);
        }

        Ok(())
    }
}

impl JobSystem for FiberJobSystem {
    fn add_jobs(&self, jobs: Vec<Job>) -> Result<(), Error> {
        FiberJobSystem::add_jobs(self, jobs)
    }

    fn wait_for_jobs(&self, jobs: Vec<Job>) -> Result<(), Error> {
        FiberJobSystem::wait_for_jobs(self, jobs)
    }
}

impl Drop for FiberJobSystem {
    fn drop(&mut self) {
        // Fibers still queued (or suspended waiting on them) are abandoned,
        // not freed; shutdown is process-terminal.
        shutdown(&self.shared, &mut self.workers);
    }
}

/// Stop consuming the queue and join the given workers.
fn shutdown(shared: &Shared, workers: &mut Vec<Thread>) {
    shared.running.store(false, Ordering::Release);

    // One release per worker unblocks the pool, plus one spare in case a
    // release is consumed by a worker that was already holding work.
    for _ in 0..workers.len() + 1 {
        shared.jobs_semaphore.release();
    }

    for worker in workers.drain(..) {
        worker.join();
    }
}

/// The wait protocol, run from inside a fiber.
fn wait_on_fiber(shared: &Shared, jobs: Vec<Job>) -> Result<(), Error> {
    let current = fiber::this_fiber();
    debug_assert!(!current.is_null(), "wait_on_fiber outside a fiber");

    let counter = Arc::new(WaitCounter::new(jobs.len()));

    // Build every child before publishing any. Children run against this
    // frame's counter as soon as they are enqueued, so a later allocation
    // failure must not be able to abandon the batch half-submitted.
    let mut children = jobs
        .into_iter()
        .map(|job| Fiber::new(job, Some(Arc::clone(&counter))))
        .collect::<Result<Vec<_>, _>>()?;

    for child in &mut children {
        shared.fibers.enqueue((FiberPtr(&raw mut **child), None));
        shared.jobs_semaphore.release();
    }

    unsafe {
        // Unsafe until the suspension below has durably saved this fiber's
        // context; a worker that picks the entry up early spins on the flag.
        (*current).set_unsafe();
        shared
            .fibers
            .enqueue((FiberPtr(current), Some(Arc::clone(&counter))));
        shared.jobs_semaphore.release();

        Fiber::suspend(current);
    }

    // Only reached once a worker observed the counter at zero: every child
    // has completed, and this frame owns their corpses. Surface the first
    // latched panic, first come first served.
    let first_panic = children.iter_mut().find_map(|child| child.take_panic());

    drop(children);
    drop(counter);

    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }

    Ok(())
}

/// Main function for the worker threads: take fibers off the queue, run
/// them and do the ownership bookkeeping.
fn job_thread(id: usize, shared: Arc<Shared>) {
    fiber::thread_to_fiber().expect("could not adopt worker thread as a fiber");

    debug!("worker {} started", id);

    while shared.running.load(Ordering::Acquire) {
        // Wait for an entry to exist, then take it. The semaphore absorbs
        // almost all of the waiting, so the dequeue sees low contention.
        shared.jobs_semaphore.acquire();

        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let (fiber, wait_counter) = shared.fibers.dequeue();
        let fiber = fiber.0;

        unsafe {
            // A fiber is unsafe only for the instant between being published
            // and its suspending thread finishing the context save.
            while !(*fiber).is_safe() {
                std::hint::spin_loop();
            }

            match wait_counter {
                // First appearance of this fiber: run its job.
                None => finish(fiber, Fiber::start(fiber)),

                Some(counter) => {
                    if counter.value() == 0 {
                        // Every child completed; pick the wait back up.
                        finish(fiber, Fiber::resume(fiber));
                    } else {
                        // Still waiting on at least one child. Put the entry
                        // back without touching the fiber.
                        shared.fibers.enqueue((FiberPtr(fiber), Some(counter)));
                        shared.jobs_semaphore.release();
                    }
                }
            }
        }
    }

    debug!("worker {} stopped", id);

    // Safety: the loop always exits holding the adopted identity installed
    // at the top of this function.
    unsafe { fiber::fiber_to_thread() };
}

/// Ownership bookkeeping after a fiber gave control back to a worker.
///
/// # Safety
///
/// `fiber` must be the fiber the outcome came from, heap-allocated by this
/// scheduler.
unsafe fn finish(fiber: *mut Fiber, outcome: RunOutcome) {
    match outcome {
        // The fiber re-published itself before suspending; it will come
        // back through the queue.
        RunOutcome::Suspended => {}

        // A waiting fiber owns this one and frees it with the wait frame.
        RunOutcome::Completed { waited_on: true } => {}

        // Fire-and-forget: the fiber is ours to clean up, along with any
        // panic nobody is around to observe.
        RunOutcome::Completed { waited_on: false } => {
            let mut fiber = Box::from_raw(fiber);

            if let Some(payload) = fiber.take_panic() {
                error!(
                    "dropping panic from fire-and-forget job: {}",
                    panic_message(&payload)
                );
            }
        }
    }
}

/// Best-effort rendering of a panic payload for the log.
fn panic_message(payload: &JobPanic) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}
