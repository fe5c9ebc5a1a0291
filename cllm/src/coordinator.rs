//! `ControlCoordinator`, "Node Zero": the one thread that owns reduction, the
//! optimizer step, and epoch lifecycle. It never executes a batch's forward/backward.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use cllm_queues::{Running, SharedWorkQueue, WorkQueue};

use crate::data::Batch;
use crate::error::{CllmError, Result};
use crate::gradient::{GradientBuffer, Segment};
use crate::hierarchy::{dominant_group, route_group, HierarchyTree};
use crate::iterator::BatchIterator;
use crate::metrics::{MetricsEvent, MetricsRegistry, FEATURE_AMSGRAD, FEATURE_GRADIENT_CLIPPED, FEATURE_HIERARCHICAL, FEATURE_NAN_GUARDED};
use crate::optimizer::{clip_gradient, l2_norm, Optimizer};
use crate::ops::TransformerOps;
use crate::sphere::WorkerSphere;

/// Reduction scales down (rather than drops) a segment whose norm exceeds this before
/// summing — distinct from the optimizer's own configurable `clip_norm`.
const REDUCTION_NORM_CAP: f32 = 10.0;
/// Three consecutive all-dropped reductions trip `DivergenceDetected`.
const DIVERGENCE_STREAK_LIMIT: u32 = 3;

/// What one reduction produced, consumed by the optimizer step and the metrics publish.
struct ReduceOutcome {
    master: Vec<f32>,
    n_valid: usize,
    gradient_norm: f32,
}

/// Aggregate stats for one completed epoch.
pub struct EpochReport {
    pub batches_processed: u64,
    pub average_loss: f32,
}

/// Owns the optimizer's moment state, the running divergence counter, and the metrics
/// hub. Constructed once per training run.
pub struct ControlCoordinator {
    optimizer: Optimizer,
    metrics: Arc<MetricsRegistry>,
    symmetry_order: u32,
    consecutive_all_dropped: u32,
    epoch: u64,
    best_loss: f32,
}

impl ControlCoordinator {
    pub fn new(optimizer: Optimizer, metrics: Arc<MetricsRegistry>, symmetry_order: u32) -> Self {
        Self { optimizer, metrics, symmetry_order, consecutive_all_dropped: 0, epoch: 0, best_loss: f32::INFINITY }
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut Optimizer {
        &mut self.optimizer
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Sums valid segments into a single master gradient, dropping any segment holding a
    /// NaN/Inf value and scaling any whose ℓ2 norm exceeds [`REDUCTION_NORM_CAP`] before
    /// summing. Divides the sum by the number of contributing segments.
    fn reduce(&mut self, buffer: &GradientBuffer) -> Result<ReduceOutcome> {
        let mut master = vec![0.0f32; buffer.len()];
        let mut n_valid = 0usize;

        for (i, segment) in buffer.segments().iter().enumerate() {
            let slice = buffer.segment_slice(i);
            if slice.iter().any(|g| !g.is_finite()) {
                self.metrics.log_event(MetricsEvent::SegmentDropped { worker: i, reason: "NaN/Inf in gradient segment".into() });
                self.set_metrics_flag(FEATURE_NAN_GUARDED);
                continue;
            }

            let norm = l2_norm(slice);
            let scaled;
            let contribution: &[f32] = if norm > REDUCTION_NORM_CAP {
                let scale = REDUCTION_NORM_CAP / norm;
                scaled = slice.iter().map(|g| g * scale).collect::<Vec<_>>();
                self.set_metrics_flag(FEATURE_GRADIENT_CLIPPED);
                &scaled
            } else {
                slice
            };

            for (m, &g) in master[segment.start..segment.end].iter_mut().zip(contribution) {
                *m += g;
            }
            n_valid += 1;
        }

        if n_valid == 0 {
            self.consecutive_all_dropped += 1;
            if self.consecutive_all_dropped >= DIVERGENCE_STREAK_LIMIT {
                self.metrics.log_event(MetricsEvent::Divergence { consecutive_failures: self.consecutive_all_dropped });
                return Err(CllmError::DivergenceDetected { consecutive_failures: self.consecutive_all_dropped });
            }
            return Ok(ReduceOutcome { master, n_valid: 0, gradient_norm: 0.0 });
        }
        self.consecutive_all_dropped = 0;

        for m in master.iter_mut() {
            *m /= n_valid as f32;
        }
        let gradient_norm = l2_norm(&master);
        Ok(ReduceOutcome { master, n_valid, gradient_norm })
    }

    fn set_metrics_flag(&self, flag: u32) {
        let mut snap = self.metrics.snapshot();
        snap.set_flag(flag);
        self.metrics.publish(snap);
    }

    /// Runs one full epoch: resets `iterator`, dispatches batches through a fresh
    /// prefetch stage into per-group work queues, drains to completion, reduces, and
    /// takes one optimizer step. Returns epoch stats and the spheres (with their scratch
    /// intact) for the next epoch, or `Err(DivergenceDetected)` if every segment was
    /// dropped three reductions running.
    #[allow(clippy::too_many_arguments)]
    pub fn run_epoch(
        &mut self,
        iterator: &mut BatchIterator,
        params: &mut [f32],
        ops: &dyn TransformerOps,
        grad_buffer: &mut GradientBuffer,
        hierarchy: &HierarchyTree,
        group_of: Option<&dyn Fn(u32) -> u32>,
        spheres: Vec<WorkerSphere>,
        running: &Running,
    ) -> Result<(EpochReport, Vec<WorkerSphere>)> {
        iterator.reset();
        self.epoch += 1;
        let epoch_start = Instant::now();

        let mut groups_with_workers: Vec<u32> = (0..hierarchy.worker_count()).map(|i| hierarchy.worker_group(i)).collect();
        groups_with_workers.sort_unstable();
        groups_with_workers.dedup();

        let queues_by_group: Vec<(u32, SharedWorkQueue<Batch>)> =
            groups_with_workers.iter().map(|&g| (g, Arc::new(WorkQueue::new(cllm_queues::DEFAULT_WORK_QUEUE_CAPACITY)))).collect();
        let queue_for_group = |group: u32| -> SharedWorkQueue<Batch> {
            queues_by_group.iter().find(|(g, _)| *g == group).map(|(_, q)| q.clone()).expect("every worker group has a queue")
        };

        let prefetch = cllm_queues::PrefetchQueue::new(cllm_queues::DEFAULT_PREFETCH_CAPACITY);
        let segments: Vec<Segment> = grad_buffer.segments().to_vec();
        let params_shared: &[f32] = params;

        let spheres_out: Vec<WorkerSphere> = thread::scope(|scope| -> Vec<WorkerSphere> {
            // Prefetcher: fills the bounded prefetch ring straight from the iterator.
            let prefetch_producer = prefetch.clone();
            scope.spawn(|| loop {
                if !running.is_set() {
                    prefetch_producer.mark_producer_done();
                    return;
                }
                match iterator.next() {
                    Some(batch) => {
                        if prefetch_producer.push_with_backoff(batch, running).is_err() {
                            return;
                        }
                    }
                    None => {
                        prefetch_producer.mark_producer_done();
                        return;
                    }
                }
            });

            // Workers: one scoped thread per leaf worker, each holding its own disjoint
            // gradient segment for the whole epoch — see `sphere.rs`'s module doc:
            // `thread::scope` + `split_at_mut` in place of unsafe raw-pointer segment
            // sharing.
            let mut remaining = grad_buffer.as_mut_slice();
            let mut worker_handles = Vec::with_capacity(spheres.len());
            for (i, sphere) in spheres.into_iter().enumerate() {
                let segment = segments[i];
                let (mine, rest) = remaining.split_at_mut(segment.end - segment.start);
                remaining = rest;

                let group = hierarchy.worker_group(i);
                let queue = queue_for_group(group);
                let handle = scope.spawn(move || sphere.run_epoch(params_shared, ops, segment, mine, &queue, running));
                worker_handles.push(handle);
            }

            // Coordinator: drains the prefetch ring into the dominant-group queue.
            loop {
                if !running.is_set() {
                    break;
                }
                match prefetch.try_pop() {
                    Some(batch) => {
                        let dominant = dominant_group(&batch.input_ids, self.symmetry_order, group_of);
                        let routed = route_group(dominant, &groups_with_workers);
                        let queue = queue_for_group(routed);
                        if queue.push_with_backoff(batch, running).is_err() {
                            break;
                        }
                    }
                    None => {
                        if prefetch.producer_done() && prefetch.is_empty() {
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
            }
            for (_, queue) in &queues_by_group {
                queue.signal_epoch_done();
            }

            worker_handles.into_iter().map(|h| h.join().expect("worker thread panicked")).collect()
        });

        let outcome = self.reduce(grad_buffer)?;
        if outcome.n_valid > 0 {
            let mut grad = outcome.master;
            let cfg = self.optimizer.config();
            if cfg.clip_value > 0.0 || cfg.clip_norm > 0.0 {
                clip_gradient(&mut grad, cfg.clip_value, cfg.clip_norm);
            }
            self.optimizer.step(params, &grad);
        }
        grad_buffer.zero();

        let mut total_loss = 0.0f64;
        let mut batches_processed = 0u64;
        let mut tokens_processed = 0u64;
        let mut worker_stats = Vec::with_capacity(spheres_out.len());
        for sphere in &spheres_out {
            let stats = sphere.handle.worker_stats();
            total_loss += stats.avg_loss as f64 * stats.batches_processed as f64;
            batches_processed += stats.batches_processed;
            tokens_processed += stats.tokens_processed;
            worker_stats.push(stats);
        }
        let average_loss = if batches_processed > 0 { (total_loss / batches_processed as f64) as f32 } else { 0.0 };
        let epoch_secs = epoch_start.elapsed().as_secs_f64();
        let tokens_per_second = if epoch_secs > 0.0 { tokens_processed as f64 / epoch_secs } else { 0.0 };

        let mut snapshot = self.metrics.snapshot();
        snapshot.epoch = self.epoch;
        snapshot.step = self.optimizer.step_count();
        snapshot.current_loss = average_loss;
        if average_loss < self.best_loss {
            self.best_loss = average_loss;
        }
        snapshot.best_loss = self.best_loss;
        snapshot.workers = worker_stats;
        snapshot.learning_rate = self.optimizer.current_lr();
        snapshot.gradient_norm = outcome.gradient_norm;
        snapshot.parameter_norm = l2_norm(params);
        snapshot.tokens_per_second = tokens_per_second;
        if groups_with_workers.len() > 1 {
            snapshot.set_flag(FEATURE_HIERARCHICAL);
        }
        if self.optimizer.config().amsgrad {
            snapshot.set_flag(FEATURE_AMSGRAD);
        }
        self.metrics.publish(snapshot);

        Ok((EpochReport { batches_processed, average_loss }, spheres_out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TokenId;
    use crate::optimizer::{OptimizerConfig, OptimizerKind};
    use crate::ops::ModelDims;
    use crate::reference_ops::EmbeddingPullOps;

    fn dims() -> ModelDims {
        ModelDims { vocab_size: 16, embedding_dim: 8, num_layers: 1, num_heads: 2, ff_hidden_dim: 8, context_length: 8, symmetry_order: 1 }
    }

    fn tiny_stream() -> Vec<TokenId> {
        vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 1, 2, 3]
    }

    #[test]
    fn tiny_epoch_loss_decreases_and_params_move_bounded() {
        let dims = dims();
        let ops = EmbeddingPullOps::new(dims);
        let mut params = vec![0.05f32; dims.total_params()];
        for (i, p) in params.iter_mut().enumerate() {
            *p = ((i * 53) % 11) as f32 * 0.02;
        }
        let initial_norm = l2_norm(&params);

        let mut grad_buffer = GradientBuffer::new(dims.total_params(), 1);
        let hierarchy = HierarchyTree::build(1, 1).unwrap();
        let config = OptimizerConfig { kind: OptimizerKind::Sgd, lr: 0.1, momentum: 0.0, weight_decay: 0.0, clip_norm: 0.0, clip_value: 0.0, ..OptimizerConfig::default() };
        let optimizer = Optimizer::new(config, dims.total_params());
        let metrics = MetricsRegistry::new(false);
        let mut coordinator = ControlCoordinator::new(optimizer, metrics, 1);

        let mut iterator = BatchIterator::new(tiny_stream(), crate::iterator::BatchIteratorConfig { batch_size: 2, seq_len: 4, drop_last: true }).unwrap();
        let running = Running::default();

        let sphere = WorkerSphere::new(0, dims, 2, 4);
        let (report1, spheres) = coordinator
            .run_epoch(&mut iterator, &mut params, &ops, &mut grad_buffer, &hierarchy, None, vec![sphere], &running)
            .unwrap();
        assert_eq!(report1.batches_processed, 2);
        let loss_step_1 = report1.average_loss;

        let (report2, _spheres) = coordinator
            .run_epoch(&mut iterator, &mut params, &ops, &mut grad_buffer, &hierarchy, None, spheres, &running)
            .unwrap();
        let loss_step_2 = report2.average_loss;

        assert!(loss_step_2 < loss_step_1, "loss_step_1={loss_step_1} loss_step_2={loss_step_2}");
        let moved = (l2_norm(&params) - initial_norm).abs();
        assert!(moved > 0.0 && moved <= 10.0 + 1e-3, "moved={moved}");
    }

    #[test]
    fn nan_in_one_of_two_segments_is_dropped_and_training_continues() {
        let dims = dims();
        let ops = EmbeddingPullOps::new(dims);
        let mut params = vec![0.1f32; dims.total_params()];

        let mut grad_buffer = GradientBuffer::new(dims.total_params(), 2);
        grad_buffer.segment_mut(0)[0] = f32::NAN;
        for g in grad_buffer.segment_mut(1).iter_mut() {
            *g = 0.01;
        }

        let metrics = MetricsRegistry::new(false);
        let optimizer = Optimizer::new(OptimizerConfig { kind: OptimizerKind::Sgd, lr: 0.1, ..OptimizerConfig::default() }, dims.total_params());
        let mut coordinator = ControlCoordinator::new(optimizer, metrics, 1);

        let outcome = coordinator.reduce(&grad_buffer).unwrap();
        assert_eq!(outcome.n_valid, 1);
        let seg1 = grad_buffer.segment(1);
        for &g in &outcome.master[seg1.start..seg1.end] {
            assert!((g - 0.01).abs() < 1e-6);
        }
    }

    #[test]
    fn three_consecutive_all_dropped_reductions_trip_divergence() {
        let dims = dims();
        let mut grad_buffer = GradientBuffer::new(dims.total_params(), 1);
        grad_buffer.segment_mut(0)[0] = f32::NAN;

        let metrics = MetricsRegistry::new(false);
        let optimizer = Optimizer::new(OptimizerConfig::default(), dims.total_params());
        let mut coordinator = ControlCoordinator::new(optimizer, metrics, 1);

        assert!(coordinator.reduce(&grad_buffer).is_ok());
        assert!(coordinator.reduce(&grad_buffer).is_ok());
        let err = coordinator.reduce(&grad_buffer).unwrap_err();
        assert!(matches!(err, CllmError::DivergenceDetected { consecutive_failures: 3 }));
    }
}
