//! The public contract of a job system and the factory for its backends.

use std::sync::Arc;

use crate::error::Error;
use crate::fiber_job_system::FiberJobSystem;
use crate::job::Job;
use crate::thread_job_system::ThreadJobSystem;

/// A scheduler of opaque work units.
///
/// The two implementations differ only in mechanism: the fiber backend
/// multiplexes jobs over a fixed worker pool with cooperative suspension,
/// the thread backend gives every job an OS thread. The semantics visible
/// through this trait are identical.
pub trait JobSystem: Send + Sync {
    /// Add a collection of jobs. Once accepted these execute in a
    /// fire-and-forget manner; there is no way to wait on them or to know
    /// when they have run. A panic in such a job is logged and dropped.
    fn add_jobs(&self, jobs: Vec<Job>) -> Result<(), Error>;

    /// Add a collection of jobs and block until all of them have finished
    /// executing.
    ///
    /// If any job panicked, the first panic (in submission order of
    /// discovery) is resumed on the caller once every job in the batch has
    /// completed.
    fn wait_for_jobs(&self, jobs: Vec<Job>) -> Result<(), Error>;
}

/// Which scheduler implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Fibers over a fixed worker pool; supports nested waits without
    /// blocking workers.
    Fiber,

    /// One OS thread per job; trivial, useful as a comparison baseline and
    /// on hosts where fibers are unavailable.
    Thread,
}

/// Construct a job system with the requested backend.
///
/// The choice is a startup-time configuration switch; callers only ever see
/// the [`JobSystem`] contract.
pub fn create_job_system(backend: Backend) -> Result<Arc<dyn JobSystem>, Error> {
    match backend {
        Backend::Fiber => Ok(Arc::new(FiberJobSystem::new()?)),
        Backend::Thread => Ok(Arc::new(ThreadJobSystem::new())),
    }
}
