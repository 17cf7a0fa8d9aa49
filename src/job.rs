//! The unit of work accepted by a job system.

/// An opaque work unit: a callable with no parameters and no return value.
///
/// A job reports failure by panicking. For a batch submitted through
/// `wait_for_jobs` the first panic is re-raised at the wait site; for
/// fire-and-forget batches it is logged and dropped.
pub use fiber::Job;

/// Builds a `Vec<Job>` from closures, boxing each one.
///
/// ```
/// use gantry::jobs;
///
/// let batch = jobs![|| println!("a"), || println!("b")];
/// assert_eq!(batch.len(), 2);
/// ```
#[macro_export]
macro_rules! jobs {
    ($($job:expr),* $(,)?) => {
        vec![$(Box::new($job) as $crate::Job),*]
    };
}
