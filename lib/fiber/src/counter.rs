//! Atomic counter used to track how many child fibers a waiting fiber is
//! still blocked on.

use std::sync::atomic::{AtomicIsize, Ordering};

/// Counts down as the jobs in a wait batch complete.
///
/// A `WaitCounter` is created with the size of the batch. Each child fiber
/// decrements it exactly once when its job finishes (normally or with a
/// panic), and the scheduler resumes the waiting fiber only once it reads
/// zero. The release on the decrement pairs with the acquire on the read, so
/// everything a child job wrote is visible to the parent when it resumes.
#[derive(Debug)]
pub struct WaitCounter(AtomicIsize);

impl WaitCounter {
    /// Create a counter for a batch of `count` jobs.
    pub fn new(count: usize) -> WaitCounter {
        WaitCounter(AtomicIsize::new(count as isize))
    }

    /// Decrement the counter by one, returning the previous value.
    pub fn decrement(&self) -> isize {
        self.0.fetch_sub(1, Ordering::AcqRel)
    }

    /// Read the current value.
    pub fn value(&self) -> isize {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn constructor() {
        let counter = WaitCounter::new(3);
        assert_eq!(counter.value(), 3);
    }

    #[test]
    fn decrement() {
        let counter = WaitCounter::new(3);
        assert_eq!(counter.decrement(), 3);
        assert_eq!(counter.value(), 2);
    }

    #[test]
    fn thread_safe() {
        const VALUE: usize = 10_000;

        let counter = Arc::new(WaitCounter::new(VALUE));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..VALUE / 4 {
                        counter.decrement();
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(counter.value(), 0);
    }
}
