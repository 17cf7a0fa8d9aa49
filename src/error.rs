//! Error types for the job system.
//!
//! Only resource acquisition surfaces as an `Err`: stacks that cannot be
//! mapped and worker threads that cannot be spawned. A panic inside a job is
//! not an `Error`: it is latched on the fiber that ran the job and resumed
//! at the matching wait site, so it reaches the caller the same way any
//! other panic does. API misuse (adopting a thread as a fiber twice,
//! resuming a fiber that is not suspended) panics at the misuse site; the
//! scheduler cannot reason about its own state after such a violation.

use std::io;

/// Resource failures from constructing a job system or accepting work.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The fiber primitive could not acquire its resources.
    #[error(transparent)]
    Fiber(#[from] fiber::FiberError),

    /// A worker (or job) thread could not be spawned.
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[source] io::Error),
}
