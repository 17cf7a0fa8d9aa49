//! A counting semaphore.

use std::sync::{Condvar, Mutex};

/// A synchronisation primitive holding a counter that any thread may
/// increment (`release`) or decrement (`acquire`). Acquiring when the
/// counter is zero blocks the calling thread until another releases.
///
/// Waiters are woken one per release through the condvar's queue, so a
/// steady stream of releases cannot starve a blocked thread indefinitely.
#[derive(Debug)]
pub struct Semaphore {
    /// Current counter value; never negative.
    count: Mutex<usize>,

    /// Signalled once per release.
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore with an initial counter value.
    pub fn new(initial: usize) -> Semaphore {
        Semaphore {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Increment the counter and wake one waiting thread.
    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;

        self.available.notify_one();
    }

    /// Decrement the counter, blocking until it is possible.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();

        while *count == 0 {
            count = self.available.wait(count).unwrap();
        }

        *count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_consumes_initial_count() {
        let semaphore = Semaphore::new(2);

        semaphore.acquire();
        semaphore.acquire();
        // A third acquire would block; release first.
        semaphore.release();
        semaphore.acquire();
    }

    #[test]
    fn release_unblocks_waiter() {
        let semaphore = Arc::new(Semaphore::new(0));
        let acquired = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let semaphore = semaphore.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                semaphore.acquire();
                acquired.fetch_add(1, Ordering::SeqCst);
            })
        };

        // Give the waiter time to block before releasing.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(acquired.load(Ordering::SeqCst), 0);

        semaphore.release();
        waiter.join().unwrap();

        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_release_admits_one_acquire() {
        const ROUNDS: usize = 1_000;

        let semaphore = Arc::new(Semaphore::new(0));
        let admitted = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let semaphore = semaphore.clone();
                let admitted = admitted.clone();
                thread::spawn(move || {
                    for _ in 0..ROUNDS / 4 {
                        semaphore.acquire();
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for _ in 0..ROUNDS {
            semaphore.release();
        }

        for waiter in waiters {
            waiter.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), ROUNDS);
    }
}
