//! A library for creating and managing fibers in a cross-platform manner.
//!
//! Fibers are threads that must be manually scheduled by the client
//! application, as opposed to OS threads which are scheduled preemptively by
//! the kernel. Each fiber has its own stack and saved machine state, and can
//! yield its time on the hosting thread at a single, explicit suspension
//! point. A suspended fiber can later be resumed on any thread, which is
//! what makes fibers useful as the unit of scheduling in a job system: a job
//! that needs to wait for other jobs parks its whole call stack instead of
//! parking a worker thread.
//!
//! # Fibers and threads
//!
//! A fiber runs on top of exactly one OS thread at a time. Before a thread
//! may execute fibers it has to be adopted with [`thread_to_fiber`], which
//! installs a landing context for fibers entered from that thread. The
//! fiber currently executing on a thread is available through
//! [`this_fiber`].
//!
//! The suspend/resume hand-off between threads is guarded by each fiber's
//! `safe` flag: a fiber about to suspend is unsafe from the moment it is
//! published to the scheduler until the moment its machine context has been
//! durably saved, and a scheduler must not resume a fiber it cannot observe
//! as safe.
//!
//! # Unsafety
//!
//! Unlike almost anything else in Rust, code running in a fiber can be
//! suspended on one thread and resumed on another, pulling its stack along
//! with it. A `!Send` value that lives across a suspension point therefore
//! has its thread affinity silently violated. The scheduler driving these
//! fibers must guarantee that jobs only hold `Send` data across a wait, and
//! the entry points that move fibers between threads are `unsafe fn` for
//! that reason.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::error;

mod counter;
mod platform;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod stack;
        pub use self::stack::StackRegion;
    }
}

pub use self::counter::WaitCounter;

/// A unit of work to run on a fiber: a callable with no parameters and no
/// return value. A job reports failure by panicking; the panic payload is
/// latched on the fiber and re-raised at the matching wait site.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Payload of a panic that escaped a job.
pub type JobPanic = Box<dyn Any + Send + 'static>;

/// What happened inside a fiber while a call to [`Fiber::start`] or
/// [`Fiber::resume`] had control.
#[derive(Debug)]
pub enum RunOutcome {
    /// The fiber suspended itself and is parked until its wait completes.
    /// It has already re-enqueued itself with the scheduler; the caller must
    /// not touch it again.
    Suspended,

    /// The fiber's job ran to completion (normally or with a panic).
    Completed {
        /// True if a wait counter was attached, in which case the waiting
        /// fiber owns this one and the caller must not free it.
        waited_on: bool,
    },
}

/// Errors from acquiring the resources a fiber needs.
#[derive(Debug, thiserror::Error)]
pub enum FiberError {
    /// Mapping or protecting the stack region failed.
    #[cfg(unix)]
    #[error("failed to allocate fiber stack: {0}")]
    StackAllocation(#[from] rustix::io::Errno),

    /// The platform fiber object could not be created.
    #[cfg(windows)]
    #[error("failed to create fiber: {0}")]
    Create(#[source] std::io::Error),
}

thread_local! {
    /// The fiber currently executing on this thread, or null if the thread
    /// is not running fibers.
    static CURRENT_FIBER: Cell<*mut Fiber> = const { Cell::new(ptr::null_mut()) };
}

/// Returns the fiber currently executing on the calling thread, or null if
/// the thread has not been adopted.
// Never inlined: a fiber migrates between OS threads across a suspension
// point, so every query must go back to the executing thread's own slot
// rather than reuse an address cached before the switch.
#[inline(never)]
pub fn this_fiber() -> *mut Fiber {
    CURRENT_FIBER.with(|current| current.get())
}

// Same inlining constraint as this_fiber.
#[inline(never)]
fn set_this_fiber(fiber: *mut Fiber) {
    CURRENT_FIBER.with(|current| current.set(fiber));
}

/// Adopts the calling thread as a fiber.
///
/// This must be called once on each thread that wants to execute fibers;
/// the adopted fiber is the landing context that started fibers return to.
/// Release it again with [`fiber_to_thread`] before the thread exits.
///
/// # Panics
///
/// Panics if the thread has already been adopted. Doing so would orphan the
/// existing landing context, so it is treated as an unrecoverable misuse.
pub fn thread_to_fiber() -> Result<(), FiberError> {
    if !this_fiber().is_null() {
        panic!("thread is already a fiber");
    }

    let fiber = Box::new(Fiber {
        job: None,
        counter: None,
        parent: ptr::null_mut(),
        panic: None,
        safe: AtomicBool::new(true),
        inner: platform::Inner::adopt()?,
    });

    set_this_fiber(Box::into_raw(fiber));
    Ok(())
}

/// Releases the fiber identity installed by [`thread_to_fiber`].
///
/// # Panics
///
/// Panics if the calling thread is not currently a fiber.
///
/// # Safety
///
/// The current fiber must be the adopted landing context, not a job fiber
/// entered from one.
pub unsafe fn fiber_to_thread() {
    let current = this_fiber();
    if current.is_null() {
        panic!("thread is not a fiber");
    }

    set_this_fiber(ptr::null_mut());
    drop(Box::from_raw(current));
}

/// A fiber: a job plus the stack and saved machine state needed to run it,
/// suspend it and resume it somewhere else.
///
/// Fibers are created by a scheduler, handed between its worker threads as
/// raw pointers, and freed by whichever side the [`RunOutcome`] assigns
/// ownership to. The inherent methods that transfer control are associated
/// functions over raw pointers: from the moment a fiber is published to a
/// scheduler, holding a Rust reference across a switch would alias the
/// thread that picks it up.
pub struct Fiber {
    /// Work to run; taken by the entry trampoline, so `None` once started.
    job: Option<Job>,

    /// Wait counter of the parent fiber waiting on this one. `None` means
    /// fire-and-forget.
    counter: Option<Arc<WaitCounter>>,

    /// The fiber that was current on the hosting thread when this one was
    /// entered. Only used to restore that thread's identity when this fiber
    /// completes or suspends; refreshed on every start/resume.
    parent: *mut Fiber,

    /// Panic payload that escaped the job, latched first-come-first-served.
    panic: Option<JobPanic>,

    /// False during the window where the fiber is published for resumption
    /// but its machine context has not been fully saved yet.
    safe: AtomicBool,

    /// Platform stack/context state.
    inner: platform::Inner,
}

impl Fiber {
    /// Creates a fiber that will run `job`, optionally decrementing
    /// `counter` when the job completes.
    pub fn new(job: Job, counter: Option<Arc<WaitCounter>>) -> Result<Box<Fiber>, FiberError> {
        let fiber = Box::new(Fiber {
            job: Some(job),
            counter,
            parent: ptr::null_mut(),
            panic: None,
            safe: AtomicBool::new(true),
            inner: platform::Inner::new()?,
        });

        #[cfg(windows)]
        {
            let mut fiber = fiber;
            // The kernel object captures the fiber's address, so it can only
            // be created once the box has pinned it.
            unsafe { platform::attach(&mut *fiber)? };
            return Ok(fiber);
        }

        #[cfg(not(windows))]
        Ok(fiber)
    }

    /// Starts the fiber, running its job on the fiber's own stack.
    ///
    /// Returns when the job completes or the fiber suspends; the outcome
    /// says which, and who owns the fiber afterwards. On the completion
    /// path the wait counter (if any) has been decremented, and a waiting
    /// fiber may free this one at any point after that, so the caller must
    /// not touch `fiber` again unless the outcome hands it ownership.
    ///
    /// # Safety
    ///
    /// `fiber` must be live, never started before, and observed safe. The
    /// calling thread must have been adopted with [`thread_to_fiber`].
    pub unsafe fn start(fiber: *mut Fiber) -> RunOutcome {
        (*fiber).parent = this_fiber();
        set_this_fiber(fiber);

        platform::begin(fiber);

        Fiber::leave(fiber)
    }

    /// Resumes a suspended fiber from its saved mid-job state.
    ///
    /// Same contract and ownership rules as [`Fiber::start`].
    ///
    /// # Safety
    ///
    /// `fiber` must be suspended (its wait counter at zero) and observed
    /// safe. The calling thread must have been adopted.
    pub unsafe fn resume(fiber: *mut Fiber) -> RunOutcome {
        (*fiber).parent = this_fiber();
        set_this_fiber(fiber);

        platform::resume(fiber);

        Fiber::leave(fiber)
    }

    /// Suspends the fiber, returning control to wherever it was started or
    /// last resumed.
    ///
    /// The call returns once the fiber is resumed, possibly on a different
    /// OS thread. If a panic payload was latched on the fiber in the
    /// meantime it is re-raised here, so the error propagates out of the
    /// wait that suspended.
    ///
    /// # Safety
    ///
    /// Must be called from code running on `fiber`'s own stack, i.e.
    /// `fiber == this_fiber()`, after the fiber has been marked unsafe and
    /// re-published to its scheduler.
    pub unsafe fn suspend(fiber: *mut Fiber) {
        debug_assert_eq!(fiber, this_fiber(), "a fiber may only suspend itself");

        set_this_fiber((*fiber).parent);

        platform::suspend(fiber);

        // Only reached on resumption.
        if let Some(payload) = (*fiber).panic.take() {
            panic::resume_unwind(payload);
        }
    }

    /// Shared tail of start/resume: decide what the switch back meant.
    ///
    /// # Safety
    ///
    /// `fiber` must be the fiber the calling thread just switched out of.
    unsafe fn leave(fiber: *mut Fiber) -> RunOutcome {
        if !(*fiber).safe.load(Ordering::Acquire) {
            // The fiber suspended. Its context is durably saved now that
            // control is back here, so publish that it may be picked up.
            (*fiber).safe.store(true, Ordering::Release);
            return RunOutcome::Suspended;
        }

        // The job completed. Pull everything out of the fiber before the
        // counter decrement: that decrement releases the waiting fiber,
        // which owns this one and may free it at any moment afterwards.
        let counter = (*fiber).counter.take();
        let waited_on = counter.is_some();

        if let Some(counter) = counter {
            counter.decrement();
        }

        RunOutcome::Completed { waited_on }
    }

    /// Whether the fiber's machine context is fully saved, making it
    /// eligible to be started or resumed.
    pub fn is_safe(&self) -> bool {
        self.safe.load(Ordering::Acquire)
    }

    /// Marks the fiber unsafe ahead of publishing it to a scheduler. The
    /// flag flips back once the suspending thread has saved the context.
    pub fn set_unsafe(&self) {
        self.safe.store(false, Ordering::Release);
    }

    /// True if a parent fiber is waiting on this one to finish.
    pub fn is_being_waited_on(&self) -> bool {
        self.counter.is_some()
    }

    /// Takes the panic payload latched on this fiber, if any.
    pub fn take_panic(&mut self) -> Option<JobPanic> {
        self.panic.take()
    }
}

/// Runs a fiber's job and restores the hosting thread's identity.
///
/// This is the body of the entry trampoline on every platform. It must not
/// unwind: a panic that crossed the context switch would unwind into
/// hand-written frames, so the job runs under `catch_unwind` and the payload
/// is latched on the fiber instead.
pub(crate) unsafe fn run_job(fiber: *mut Fiber) {
    let job = (*fiber)
        .job
        .take()
        .expect("fiber entered with no job to run");

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        if (*fiber).panic.is_none() {
            (*fiber).panic = Some(payload);
        } else {
            // First come first served; a second failure has nowhere to go.
            error!("fiber already holds a panic, dropping a second one");
        }
    }

    set_this_fiber((*fiber).parent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    /// Runs `body` on a fresh adopted thread, so tests never collide over a
    /// test harness thread's fiber identity.
    fn on_fiber_thread(body: impl FnOnce() + Send + 'static) {
        thread::spawn(move || {
            thread_to_fiber().unwrap();
            body();
            unsafe { fiber_to_thread() };
        })
        .join()
        .unwrap();
    }

    #[test]
    fn start_runs_job_to_completion() {
        on_fiber_thread(|| {
            let ran = Arc::new(AtomicU32::new(0));
            let observed = ran.clone();

            let fiber = Fiber::new(
                Box::new(move || {
                    observed.fetch_add(1, Ordering::SeqCst);
                }),
                None,
            )
            .unwrap();

            let fiber = Box::into_raw(fiber);
            let outcome = unsafe { Fiber::start(fiber) };

            assert!(matches!(
                outcome,
                RunOutcome::Completed { waited_on: false }
            ));
            assert_eq!(ran.load(Ordering::SeqCst), 1);

            drop(unsafe { Box::from_raw(fiber) });
        });
    }

    #[test]
    fn completion_decrements_wait_counter() {
        on_fiber_thread(|| {
            let counter = Arc::new(WaitCounter::new(1));

            let fiber = Fiber::new(Box::new(|| {}), Some(counter.clone())).unwrap();
            assert!(fiber.is_being_waited_on());

            let fiber = Box::into_raw(fiber);

            let outcome = unsafe { Fiber::start(fiber) };

            assert!(matches!(outcome, RunOutcome::Completed { waited_on: true }));
            assert_eq!(counter.value(), 0);

            drop(unsafe { Box::from_raw(fiber) });
        });
    }

    #[test]
    fn suspend_and_resume_round_trip() {
        on_fiber_thread(|| {
            let step = Arc::new(AtomicU32::new(0));
            let steps = step.clone();

            let fiber = Fiber::new(
                Box::new(move || {
                    steps.store(1, Ordering::SeqCst);

                    let current = this_fiber();
                    unsafe {
                        (*current).set_unsafe();
                        Fiber::suspend(current);
                    }

                    steps.store(2, Ordering::SeqCst);
                }),
                None,
            )
            .unwrap();

            let fiber = Box::into_raw(fiber);

            let outcome = unsafe { Fiber::start(fiber) };
            assert!(matches!(outcome, RunOutcome::Suspended));
            assert_eq!(step.load(Ordering::SeqCst), 1);
            assert!(unsafe { (*fiber).is_safe() });

            let outcome = unsafe { Fiber::resume(fiber) };
            assert!(matches!(
                outcome,
                RunOutcome::Completed { waited_on: false }
            ));
            assert_eq!(step.load(Ordering::SeqCst), 2);

            drop(unsafe { Box::from_raw(fiber) });
        });
    }

    #[test]
    fn stack_values_survive_suspension() {
        on_fiber_thread(|| {
            let seen = Arc::new(AtomicU32::new(0));
            let out = seen.clone();

            let fiber = Fiber::new(
                Box::new(move || {
                    // Locals live on the fiber stack across the suspension.
                    let before = 41_u32;

                    let current = this_fiber();
                    unsafe {
                        (*current).set_unsafe();
                        Fiber::suspend(current);
                    }

                    out.store(before + 1, Ordering::SeqCst);
                }),
                None,
            )
            .unwrap();

            let fiber = Box::into_raw(fiber);

            unsafe {
                Fiber::start(fiber);
                Fiber::resume(fiber);
            }

            assert_eq!(seen.load(Ordering::SeqCst), 42);

            drop(unsafe { Box::from_raw(fiber) });
        });
    }

    #[test]
    fn panic_is_latched_not_propagated() {
        on_fiber_thread(|| {
            let fiber = Fiber::new(
                Box::new(|| {
                    panic!("job failed");
                }),
                None,
            )
            .unwrap();

            let fiber = Box::into_raw(fiber);
            let outcome = unsafe { Fiber::start(fiber) };

            assert!(matches!(
                outcome,
                RunOutcome::Completed { waited_on: false }
            ));

            let mut fiber = unsafe { Box::from_raw(fiber) };
            let payload = fiber.take_panic().expect("panic should be latched");
            assert_eq!(*payload.downcast::<&str>().unwrap(), "job failed");
        });
    }

    #[test]
    fn double_adoption_panics() {
        let result = thread::spawn(|| {
            thread_to_fiber().unwrap();
            let second = panic::catch_unwind(thread_to_fiber);
            unsafe { fiber_to_thread() };
            second
        })
        .join()
        .unwrap();

        assert!(result.is_err());
    }
}
