//! `WorkerSphere`: a worker's private scratch plus its lifecycle state.
//!
//! A sphere's gradient segment is *not* owned by this type. Because `N` spheres must hold
//! simultaneous, disjoint `&mut [f32]` views into one `GradientBuffer` for the duration of
//! an epoch, the segment is handed in as a borrow scoped to that epoch (via
//! `std::thread::scope` in [`crate::execute`]) rather than stored here — independent
//! worker allocators would never need this kind of shared mutable splitting, so
//! `split_at_mut` plus a scoped thread is the safe-Rust answer to the disjoint-segment
//! invariant instead.

use std::sync::Mutex;

use crate::data::Batch;
use crate::gradient::Segment;
use crate::metrics::WorkerStats;
use crate::ops::{ModelDims, SphereScratch, TransformerOps};
use cllm_queues::{Running, WorkQueue};

/// A worker's position in the INIT → IDLE → WORKING → IDLE → … → TERMINATED lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SphereState {
    Init,
    Idle,
    Working,
    Terminated,
}

struct StatsInner {
    state: SphereState,
    batches_processed: u64,
    total_loss: f64,
    samples: u64,
}

/// The cross-thread-visible half of a sphere: its identity and a mutex-guarded stats
/// block the coordinator samples when building a [`crate::metrics::Metrics`] snapshot.
///
/// A mutex is appropriate here (unlike the work/prefetch queues): stats updates happen
/// once per batch completion, not on the hot per-element path, and only the owning
/// worker ever writes — the lock only ever arbitrates against coordinator reads.
pub struct SphereHandle {
    pub sphere_id: usize,
    stats: Mutex<StatsInner>,
}

impl SphereHandle {
    pub fn new(sphere_id: usize) -> Self {
        Self {
            sphere_id,
            stats: Mutex::new(StatsInner {
                state: SphereState::Init,
                batches_processed: 0,
                total_loss: 0.0,
                samples: 0,
            }),
        }
    }

    pub fn set_state(&self, state: SphereState) {
        self.stats.lock().unwrap().state = state;
    }

    pub fn state(&self) -> SphereState {
        self.stats.lock().unwrap().state
    }

    fn record_batch(&self, loss: f32, samples: usize) {
        let mut inner = self.stats.lock().unwrap();
        inner.batches_processed += 1;
        inner.total_loss += loss as f64;
        inner.samples += samples as u64;
    }

    /// A snapshot suitable for inclusion in a [`crate::metrics::Metrics`] publish.
    pub fn worker_stats(&self) -> WorkerStats {
        let inner = self.stats.lock().unwrap();
        let avg_loss = if inner.batches_processed > 0 {
            (inner.total_loss / inner.batches_processed as f64) as f32
        } else {
            0.0
        };
        WorkerStats {
            sphere_id: self.sphere_id,
            state: inner.state,
            batches_processed: inner.batches_processed,
            avg_loss,
            tokens_processed: inner.samples,
        }
    }
}

/// A leaf worker: private scratch plus the handle observers read from.
pub struct WorkerSphere {
    pub handle: SphereHandle,
    pub scratch: SphereScratch,
}

impl WorkerSphere {
    /// Allocates scratch for `sphere_id` (INIT → IDLE, ) under the given
    /// architecture and batch-shape bounds.
    pub fn new(sphere_id: usize, dims: ModelDims, max_batch_size: usize, max_seq_len: usize) -> Self {
        let handle = SphereHandle::new(sphere_id);
        handle.set_state(SphereState::Idle);
        Self { handle, scratch: SphereScratch::allocate(dims, max_batch_size, max_seq_len) }
    }

    /// Drains `work_queue` for one epoch: zeros `grad_segment`, then repeatedly pops a
    /// batch, runs forward+backward, folds stats, and destroys the batch, until `pop`
    /// reports epoch-drained or `running` is cleared. Consumes and returns `self` so the
    /// caller can hand the same (already-allocated) scratch into the next epoch.
    pub fn run_epoch(
        mut self,
        params: &[f32],
        ops: &dyn TransformerOps,
        segment: Segment,
        grad_segment: &mut [f32],
        work_queue: &WorkQueue<Batch>,
        running: &Running,
    ) -> Self {
        grad_segment.iter_mut().for_each(|g| *g = 0.0);

        loop {
            if !running.is_set() {
                self.handle.set_state(SphereState::Terminated);
                return self;
            }

            match work_queue.pop() {
                Some(batch) => {
                    self.handle.set_state(SphereState::Working);
                    let loss = ops.forward(params, &batch, &mut self.scratch);
                    ops.backward(params, segment, &batch, &self.scratch, grad_segment);
                    self.handle.record_batch(loss, batch.valid_token_count);
                    self.handle.set_state(SphereState::Idle);
                    // `batch` drops here: the worker destroys it after backward.
                }
                None => return self,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradient::GradientBuffer;
    use crate::reference_ops::EmbeddingPullOps;
    use std::sync::Arc;

    fn dims() -> ModelDims {
        ModelDims {
            vocab_size: 16,
            embedding_dim: 8,
            num_layers: 1,
            num_heads: 2,
            ff_hidden_dim: 8,
            context_length: 8,
            symmetry_order: 12,
        }
    }

    #[test]
    fn single_worker_drains_queue_and_reports_stats() {
        let dims = dims();
        let sphere = WorkerSphere::new(0, dims, 2, 4);
        let ops = EmbeddingPullOps::new(dims);
        let params = vec![0.1f32; dims.total_params()];
        let mut grad = GradientBuffer::new(dims.total_params(), 1);
        let segment = grad.segment(0);

        let work_queue: Arc<WorkQueue<Batch>> = Arc::new(WorkQueue::new(8));
        for _ in 0..3 {
            work_queue.try_push(Batch::new(vec![1, 2, 3, 4], vec![2, 3, 4, 5], vec![1.0; 4], 1, 4)).unwrap();
        }
        work_queue.signal_epoch_done();

        let running = Running::default();
        let sphere = sphere.run_epoch(&params, &ops, segment, grad.segment_mut(0), &work_queue, &running);

        let stats = sphere.handle.worker_stats();
        assert_eq!(stats.batches_processed, 3);
        assert_eq!(stats.state, SphereState::Idle);
    }

    #[test]
    fn cleared_running_flag_terminates_before_draining() {
        let dims = dims();
        let sphere = WorkerSphere::new(0, dims, 2, 4);
        let ops = EmbeddingPullOps::new(dims);
        let params = vec![0.1f32; dims.total_params()];
        let mut grad = GradientBuffer::new(dims.total_params(), 1);
        let segment = grad.segment(0);

        let work_queue: Arc<WorkQueue<Batch>> = Arc::new(WorkQueue::new(8));
        // No epoch_done signalled, no batches pushed: an unconditional pop() would spin.
        let running = Running::default();
        running.stop();

        let sphere = sphere.run_epoch(&params, &ops, segment, grad.segment_mut(0), &work_queue, &running);
        assert_eq!(sphere.handle.state(), SphereState::Terminated);
    }
}
