//! A bounded, single-producer / multi-consumer ring of batches awaiting a worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::Backoff;

use crate::Buzzer;

/// Default ring capacity
pub const DEFAULT_WORK_QUEUE_CAPACITY: usize = 256;

/// How many backoff spins `pop` tolerates before conceding the ring is genuinely dry and
/// parking instead of continuing to spin.
const POP_SPIN_BUDGET: u32 = 6;

/// Bound on how long a parked `pop` sleeps before re-checking on its own, in case a
/// `buzz()` is missed (registered just after the last drain-and-buzz, before a push).
const PARK_TIMEOUT: Duration = Duration::from_micros(200);

/// The bounded ring the coordinator fills and every `WorkerSphere` drains.
///
/// `total_pushed` and `total_popped` are monotonic counters; `pushed == popped` together
/// with `epoch_done` is the system's only barrier — it is how workers learn that the
/// current epoch's dispatch is complete and gradient segments are ready for reduction.
pub struct WorkQueue<T> {
    ring: ArrayQueue<T>,
    total_pushed: AtomicU64,
    total_popped: AtomicU64,
    epoch_done: AtomicBool,
    /// Idle workers parked waiting for the next push, woken (and removed) one push at a
    /// time rather than all at once, since only one of them will find a batch anyway.
    waiters: Mutex<Vec<Buzzer>>,
}

impl<T> WorkQueue<T> {
    /// Allocates a new queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
            total_pushed: AtomicU64::new(0),
            total_popped: AtomicU64::new(0),
            epoch_done: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Wakes one parked waiter, if any, so it re-checks the ring.
    fn buzz_one(&self) {
        if let Some(buzzer) = self.waiters.lock().unwrap().pop() {
            buzzer.buzz();
        }
    }

    /// Non-blocking push from the coordinator. Returns the batch back on failure.
    pub fn try_push(&self, batch: T) -> Result<(), T> {
        match self.ring.push(batch) {
            Ok(()) => {
                self.total_pushed.fetch_add(1, Ordering::AcqRel);
                self.buzz_one();
                Ok(())
            }
            Err(returned) => Err(returned),
        }
    }

    /// Pushes `batch`, spinning with backoff while the ring is full.
    pub fn push_with_backoff(&self, mut batch: T, running: &crate::running::Running) -> Result<(), T> {
        let backoff = Backoff::new();
        loop {
            match self.try_push(batch) {
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

    /// Claims the next batch for a worker, tolerating transient emptiness during
    /// late-epoch drain.
    ///
    /// Returns `None` only once the ring is empty *and* `epoch_done` has been observed,
    /// a worker must not conclude the epoch is over just because the ring
    /// looked momentarily empty while the coordinator was mid-push.
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut spins_after_completed = 0u32;
        loop {
            if let Some(item) = self.ring.pop() {
                self.total_popped.fetch_add(1, Ordering::AcqRel);
                return Some(item);
            }
            if self.epoch_done.load(Ordering::Acquire) && self.ring.is_empty() {
                return None;
            }
            if backoff.is_completed() {
                spins_after_completed += 1;
                if spins_after_completed > POP_SPIN_BUDGET {
                    if self.epoch_done.load(Ordering::Acquire) {
                        return None;
                    }
                    self.waiters.lock().unwrap().push(Buzzer::default());
                    std::thread::park_timeout(PARK_TIMEOUT);
                } else {
                    std::thread::yield_now();
                }
            } else {
                backoff.snooze();
            }
        }
    }

    /// Signals that the iterator has been exhausted and no further batches will be
    /// pushed this epoch, and wakes every parked worker so they observe it without
    /// waiting out their park timeout.
    pub fn signal_epoch_done(&self) {
        self.epoch_done.store(true, Ordering::Release);
        for buzzer in self.waiters.lock().unwrap().drain(..) {
            buzzer.buzz();
        }
    }

    /// Resets the epoch-done flag and counters for the next epoch's dispatch.
    pub fn reset_epoch(&self) {
        self.epoch_done.store(false, Ordering::Release);
        self.total_pushed.store(0, Ordering::Release);
        self.total_popped.store(0, Ordering::Release);
    }

    /// Whether this epoch's dispatch has fully drained: every pushed batch has been
    /// popped, and the iterator signalled completion.
    pub fn epoch_drained(&self) -> bool {
        self.epoch_done.load(Ordering::Acquire) && self.pushed() == self.popped()
    }

    /// Total batches pushed since the last `reset_epoch`.
    pub fn pushed(&self) -> u64 {
        self.total_pushed.load(Ordering::Acquire)
    }

    /// Total batches popped since the last `reset_epoch`.
    pub fn popped(&self) -> u64 {
        self.total_popped.load(Ordering::Acquire)
    }

    /// Whether the ring is currently empty.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// A cheaply-cloned handle to a shared `WorkQueue`.
pub type SharedWorkQueue<T> = Arc<WorkQueue<T>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::running::Running;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pop_waits_for_epoch_done_on_empty_ring() {
        let q: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(4));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(std::time::Duration::from_millis(20));
        q.signal_epoch_done();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn conservation_pushed_equals_popped_plus_in_flight() {
        let q: WorkQueue<u32> = WorkQueue::new(8);
        for i in 0..5 {
            q.try_push(i).unwrap();
        }
        for _ in 0..3 {
            q.pop();
        }
        assert_eq!(q.pushed(), 5);
        assert_eq!(q.popped(), 3);
        assert_eq!(q.pushed() - q.popped(), 2);
        assert!(!q.is_empty());
    }

    #[test]
    fn reset_epoch_clears_counters_and_flag() {
        let q: WorkQueue<u32> = WorkQueue::new(4);
        q.try_push(1).unwrap();
        q.pop();
        q.signal_epoch_done();
        assert!(q.epoch_drained());
        q.reset_epoch();
        assert_eq!(q.pushed(), 0);
        assert_eq!(q.popped(), 0);
        assert!(!q.epoch_drained());
    }

    #[test]
    fn parked_pop_wakes_on_a_late_push() {
        let q: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(4));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());
        // Long enough for the worker to exhaust its spin budget and park.
        thread::sleep(std::time::Duration::from_millis(5));
        q.try_push(7).unwrap();
        assert_eq!(handle.join().unwrap(), Some(7));
    }

    #[test]
    fn push_with_backoff_destroys_item_on_cancellation() {
        let q: WorkQueue<u32> = WorkQueue::new(1);
        q.try_push(0).unwrap();
        let running = Running::default();
        running.stop();
        assert_eq!(q.push_with_backoff(1, &running), Err(1));
    }
}
