//! Work scheduling support for game engines.
//!
//! The centrepiece is a fiber-based job system: user-supplied jobs are
//! scheduled across a fixed pool of worker threads, and a job that needs
//! the results of child jobs suspends its fiber (parking its whole call
//! stack) instead of blocking the worker under it. A thread-per-job
//! backend implements the same contract for comparison and as a fallback.
//!
//! ```no_run
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! use gantry::FiberJobSystem;
//!
//! let system = FiberJobSystem::new()?;
//! let counter = Arc::new(AtomicU32::new(0));
//!
//! let jobs = (0..4)
//!     .map(|_| {
//!         let counter = counter.clone();
//!         Box::new(move || {
//!             counter.fetch_add(1, Ordering::SeqCst);
//!         }) as gantry::Job
//!     })
//!     .collect();
//!
//! system.wait_for_jobs(jobs)?;
//! assert_eq!(counter.load(Ordering::SeqCst), 4);
//! # Ok::<(), gantry::Error>(())
//! ```
//!
//! The crate also carries the supporting pieces the schedulers are built
//! from (a thread-safe FIFO queue, a counting semaphore, a thread wrapper
//! with core-affinity binding) and the fixed/variable timestep loop driver
//! that ties scheduling into a frame loop.

pub mod concurrent_queue;
pub mod error;
pub mod fiber_job_system;
pub mod job;
pub mod job_system;
pub mod looper;
pub mod semaphore;
pub mod thread;
pub mod thread_job_system;

pub use self::concurrent_queue::ConcurrentQueue;
pub use self::error::Error;
pub use self::fiber_job_system::FiberJobSystem;
pub use self::job::Job;
pub use self::job_system::{create_job_system, Backend, JobSystem};
pub use self::looper::{LoopFunction, Looper};
pub use self::semaphore::Semaphore;
pub use self::thread::Thread;
pub use self::thread_job_system::ThreadJobSystem;
