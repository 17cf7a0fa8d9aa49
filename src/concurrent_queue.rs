//! A thread-safe FIFO queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// A multi-producer multi-consumer FIFO queue.
///
/// Elements are moved in and out, so `T` does not need to be `Clone`.
/// Ordering is FIFO per producer; enqueues from different producers
/// interleave in whatever order their locks are granted.
///
/// `empty` is tracked in an atomic alongside the locked container so that
/// consumers polling for work can check it without touching the lock.
#[derive(Debug)]
pub struct ConcurrentQueue<T> {
    /// Queue container.
    container: Mutex<VecDeque<T>>,

    /// Signalled on every enqueue for consumers blocked in `dequeue`.
    available: Condvar,

    /// Snapshot of whether the container is empty.
    empty: AtomicBool,
}

impl<T> ConcurrentQueue<T> {
    /// Construct an empty queue.
    pub fn new() -> ConcurrentQueue<T> {
        ConcurrentQueue {
            container: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            empty: AtomicBool::new(true),
        }
    }

    /// Check if the queue is empty. This is a snapshot; another thread may
    /// have changed the answer by the time the caller acts on it.
    pub fn empty(&self) -> bool {
        self.empty.load(Ordering::Acquire)
    }

    /// Add an item to the tail of the queue.
    pub fn enqueue(&self, value: T) {
        let mut container = self.container.lock().unwrap();

        container.push_back(value);
        self.empty.store(false, Ordering::Release);

        self.available.notify_one();
    }

    /// Try to pop the item at the head of the queue without waiting.
    ///
    /// Returns `None` if the queue is empty or the lock is contended; the
    /// caller is expected to come back around rather than block here.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut container = self.container.try_lock().ok()?;

        let value = container.pop_front();
        self.empty.store(container.is_empty(), Ordering::Release);

        value
    }

    /// Pop the item at the head of the queue, blocking until one is
    /// available.
    pub fn dequeue(&self) -> T {
        let mut container = self.container.lock().unwrap();

        loop {
            if let Some(value) = container.pop_front() {
                self.empty.store(container.is_empty(), Ordering::Release);
                return value;
            }

            container = self.available.wait(container).unwrap();
        }
    }
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> ConcurrentQueue<T> {
        ConcurrentQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn constructor() {
        let queue = ConcurrentQueue::<i32>::new();
        assert!(queue.empty());
    }

    #[test]
    fn enqueue() {
        let queue = ConcurrentQueue::new();
        queue.enqueue(1);

        assert!(!queue.empty());
    }

    #[test]
    fn try_dequeue() {
        let queue = ConcurrentQueue::new();
        queue.enqueue(1);

        assert_eq!(queue.try_dequeue(), Some(1));
        assert!(queue.empty());
        assert_eq!(queue.try_dequeue(), None);
    }

    #[test]
    fn dequeue_blocks_until_available() {
        let queue = Arc::new(ConcurrentQueue::new());

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.dequeue())
        };

        queue.enqueue(7);
        assert_eq!(consumer.join().unwrap(), 7);
    }

    #[test]
    fn moves_non_clone_values() {
        struct Token(#[allow(dead_code)] String);

        let queue = ConcurrentQueue::new();
        queue.enqueue(Token("payload".into()));

        assert!(queue.try_dequeue().is_some());
    }

    #[test]
    fn fifo_per_producer() {
        const VALUES_PER_PRODUCER: i32 = 2_500;

        let queue = Arc::new(ConcurrentQueue::new());

        let producers: Vec<_> = (0..4)
            .map(|id| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..VALUES_PER_PRODUCER {
                        queue.enqueue((id, i));
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        // Values from each producer must come out in the order they went in,
        // whatever the interleaving across producers.
        let mut last_seen = [-1; 4];
        let mut popped = 0;

        while let Some((id, i)) = queue.try_dequeue() {
            assert!(last_seen[id as usize] < i, "producer {} out of order", id);
            last_seen[id as usize] = i;
            popped += 1;
        }

        assert_eq!(popped, 4 * VALUES_PER_PRODUCER);
    }
}
