//! A bounded, single-producer / single-consumer ring of ready-to-dispatch batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::Backoff;

use crate::running::Running;

/// Default ring capacity
pub const DEFAULT_PREFETCH_CAPACITY: usize = 128;

/// The bounded ring between the disk-reader thread and the coordinator's dispatch loop.
///
/// Ordering is strict FIFO; the single producer and single consumer never contend on
/// anything but the ring's head/tail, which `ArrayQueue` maintains with atomic
/// compare-and-swap rather than a lock.
#[derive(Clone)]
pub struct PrefetchQueue<T> {
    ring: Arc<ArrayQueue<T>>,
    producer_done: Arc<AtomicBool>,
}

impl<T> PrefetchQueue<T> {
    /// Allocates a new queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(ArrayQueue::new(capacity.max(1))),
            producer_done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Non-blocking push. Returns the batch back on failure (ring full).
    ///
    /// Only the producer (the prefetcher thread) should call this.
    pub fn try_push(&self, batch: T) -> Result<(), T> {
        self.ring.push(batch)
    }

    /// Non-blocking pop. Returns `None` immediately if the ring is empty.
    pub fn try_pop(&self) -> Option<T> {
        self.ring.pop()
    }

    /// Pushes `batch`, spinning with backoff while the ring is full.
    ///
    /// Returns `Err(batch)` if `running` is cleared before the push succeeds, so the
    /// caller can destroy the batch it would otherwise have enqueued.
    pub fn push_with_backoff(&self, mut batch: T, running: &Running) -> Result<(), T> {
        let backoff = Backoff::new();
        loop {
            match self.ring.push(batch) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    batch = returned;
                    if !running.is_set() {
                        return Err(batch);
                    }
                    if backoff.is_completed() {
                        std::thread::yield_now();
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    /// Marks that the producer will push no further batches (iterator exhausted or
    /// cancellation observed).
    pub fn mark_producer_done(&self) {
        self.producer_done.store(true, Ordering::Release);
    }

    /// Whether the producer has finished (and, transitively, whether a drained queue
    /// means end-of-stream rather than a transient gap).
    pub fn producer_done(&self) -> bool {
        self.producer_done.load(Ordering::Acquire)
    }

    /// Whether the ring currently holds no batches.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Number of batches currently resident in the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}
