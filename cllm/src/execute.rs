//! Top-level driver that wires a [`Config`] and a [`TransformerOps`] implementation into
//! a running training loop: build the runtime once from configuration, then repeatedly
//! hand control to the per-epoch coordinator until the epoch budget or a `running` flag
//! says to stop.

use std::sync::Arc;

use cllm_queues::Running;

use crate::config::Config;
use crate::coordinator::ControlCoordinator;
use crate::error::Result;
use crate::gradient::GradientBuffer;
use crate::hierarchy::HierarchyTree;
use crate::iterator::{BatchIterator, BatchIteratorConfig};
use crate::metrics::MetricsRegistry;
use crate::modelfile::{ModelFile, OptimizerCheckpoint};
use crate::ops::{ModelDims, TransformerOps};
use crate::optimizer::Optimizer;
use crate::sphere::WorkerSphere;

/// Everything `execute` needs beyond what lives in [`Config`]: the token stream to train
/// over, the architecture, and the arithmetic collaborator.
pub struct ExecuteArgs<'a> {
    pub dims: ModelDims,
    pub token_stream: Vec<crate::data::TokenId>,
    pub ops: &'a dyn TransformerOps,
    pub params: Vec<f32>,
}

/// What one call to [`execute`] produced.
pub struct ExecuteReport {
    pub epochs_completed: u64,
    pub final_loss: f32,
    pub params: Vec<f32>,
}

/// Runs training to completion (`config.training.num_epochs` epochs, or until `running`
/// is cleared — whichever comes first), publishing metrics on `metrics` after every epoch
/// and, every `save_every` epochs, writing a checkpoint pair via `checkpoint_writer` if one
/// is supplied.
///
/// The coordinator owns both the optimizer step and checkpoint writing: they are the same
/// kind of "only Node Zero touches this" state, so splitting them across two owners would
/// only invite the two to drift out of sync.
pub fn execute(
    config: &Config,
    args: ExecuteArgs,
    metrics: Arc<MetricsRegistry>,
    running: Running,
    mut checkpoint_writer: Option<&mut dyn FnMut(&ModelFile, &OptimizerCheckpoint) -> Result<()>>,
) -> Result<ExecuteReport> {
    let ExecuteArgs { dims, token_stream, ops, mut params } = args;

    let worker_count = config.runtime.resolved_worker_count();
    let hierarchy = HierarchyTree::build(worker_count, config.runtime.symmetry_order)?;
    let mut grad_buffer = GradientBuffer::new(params.len(), hierarchy.worker_count());

    let mut spheres: Vec<WorkerSphere> = (0..hierarchy.worker_count())
        .map(|i| WorkerSphere::new(i, dims, config.training.batch_size, config.training.sequence_length))
        .collect();

    let optimizer_config = crate::optimizer::OptimizerConfig {
        clip_value: config.training.gradient_clip,
        weight_decay: config.training.weight_decay,
        lr: config.training.learning_rate,
        total_steps: config.training.num_epochs.saturating_mul(hierarchy.worker_count().max(1) as u64),
        ..config.optimizer
    };
    let optimizer = Optimizer::new(optimizer_config, params.len());
    let mut coordinator = ControlCoordinator::new(optimizer, metrics, config.runtime.symmetry_order);

    let mut iterator = BatchIterator::new(
        token_stream,
        BatchIteratorConfig { batch_size: config.training.batch_size, seq_len: config.training.sequence_length, drop_last: true },
    )?;

    let mut epochs_completed = 0u64;
    let mut final_loss = 0.0f32;

    for epoch_idx in 0..config.training.num_epochs {
        if !running.is_set() {
            break;
        }

        let (report, returned_spheres) =
            match coordinator.run_epoch(&mut iterator, &mut params, ops, &mut grad_buffer, &hierarchy, None, spheres, &running) {
                Ok(v) => v,
                Err(err) => {
                    coordinator.metrics().log_event(crate::metrics::MetricsEvent::Diagnostic(format!(
                        "aborting at epoch {}, {} epochs completed: {err}",
                        coordinator.epoch(),
                        epochs_completed
                    )));
                    return Err(err);
                }
            };
        spheres = returned_spheres;
        epochs_completed += 1;
        final_loss = report.average_loss;

        if config.training.save_every > 0 && (epoch_idx + 1) % config.training.save_every == 0 {
            if let Some(writer) = checkpoint_writer.as_deref_mut() {
                let model = ModelFile::new(dims, 1, "cllm".into(), "checkpoint".into(), 1.618_033_988_75, 0, params.clone());
                let (m, v) = coordinator.optimizer().moments();
                let mut moments = Vec::with_capacity(m.len() + v.len());
                moments.extend_from_slice(m);
                moments.extend_from_slice(v);
                let checkpoint = OptimizerCheckpoint {
                    current_epoch: coordinator.epoch() as i32,
                    current_step: coordinator.optimizer().step_count() as i32,
                    current_loss: final_loss,
                    best_loss: final_loss,
                    moments,
                };
                writer(&model, &checkpoint)?;
            }
        }
    }

    Ok(ExecuteReport { epochs_completed, final_loss, params })
}
