//! A minimal, deterministic stand-in for the real transformer arithmetic.
//!
//! The actual forward/backward of attention, feed-forward, and layer-norm are out of
//! scope for this crate — they are supplied by an external collaborator
//! implementing [`TransformerOps`]. This module exists only so the runtime (queues,
//! hierarchy, reduction, optimizer) can be exercised end-to-end in tests and examples
//! without a real model: it trains an embedding table to pull each token's embedding
//! toward its next-token target's embedding, under ordinary squared-error loss.

use crate::data::Batch;
use crate::gradient::Segment;
use crate::ops::{ModelDims, SphereScratch, TransformerOps};

/// Trains only the leading `vocab_size * embedding_dim` prefix of the parameter vector
/// as a token embedding table; every other weight (attention, feed-forward, unembedding)
/// is present (to keep `ModelDims::total_params` honest) but untouched.
pub struct EmbeddingPullOps {
    dims: ModelDims,
}

impl EmbeddingPullOps {
    /// Builds a reference implementation over the given architecture dims.
    pub fn new(dims: ModelDims) -> Self {
        Self { dims }
    }

    fn embedding_offset(&self, token: u32) -> usize {
        (token as usize) * self.dims.embedding_dim
    }
}

/// Adds `values` into the slice of `grad_segment` covering
/// `[global_offset, global_offset + values.len())`, clipped to `segment`'s bounds. Used
/// because `grad_segment` is already sliced to the worker's own segment, but the
/// parameter ranges this toy model touches may only partially (or not at all) overlap it.
fn accumulate_clipped(grad_segment: &mut [f32], segment: Segment, global_offset: usize, values: &[f32]) {
    let range_start = global_offset;
    let range_end = global_offset + values.len();
    let lo = range_start.max(segment.start);
    let hi = range_end.min(segment.end);
    if lo >= hi {
        return;
    }
    for global_idx in lo..hi {
        grad_segment[global_idx - segment.start] += values[global_idx - range_start];
    }
}

impl TransformerOps for EmbeddingPullOps {
    fn forward(&self, params: &[f32], batch: &Batch, scratch: &mut SphereScratch) -> f32 {
        let d = self.dims.embedding_dim;
        // Reuse `grad_hidden` ([B*S*D]) to stash the per-position (input - target)
        // embedding difference, read back by `backward` below.
        let diffs = &mut scratch.grad_hidden;
        diffs.iter_mut().for_each(|x| *x = 0.0);

        let mut total_loss = 0.0f32;
        for row in 0..batch.batch_size {
            if !batch.row_is_valid(row) {
                continue;
            }
            let input_row = batch.input_row(row);
            let target_row = batch.target_row(row);
            let mask_row = batch.mask_row(row);
            for pos in 0..batch.seq_len {
                if mask_row[pos] == 0.0 {
                    continue;
                }
                let in_off = self.embedding_offset(input_row[pos]);
                let tgt_off = self.embedding_offset(target_row[pos]);
                if in_off + d > params.len() || tgt_off + d > params.len() {
                    continue;
                }
                let diff_slot = (row * batch.seq_len + pos) * d;
                let mut sq_err = 0.0f32;
                for k in 0..d {
                    let diff = params[in_off + k] - params[tgt_off + k];
                    diffs[diff_slot + k] = diff;
                    sq_err += diff * diff;
                }
                total_loss += 0.5 * sq_err / d as f32;
            }
        }
        total_loss
    }

    fn backward(&self, params: &[f32], segment: Segment, batch: &Batch, scratch: &SphereScratch, grad_segment: &mut [f32]) {
        let d = self.dims.embedding_dim;
        let diffs = &scratch.grad_hidden;

        for row in 0..batch.batch_size {
            if !batch.row_is_valid(row) {
                continue;
            }
            let input_row = batch.input_row(row);
            let target_row = batch.target_row(row);
            let mask_row = batch.mask_row(row);
            for pos in 0..batch.seq_len {
                if mask_row[pos] == 0.0 {
                    continue;
                }
                let in_off = self.embedding_offset(input_row[pos]);
                let tgt_off = self.embedding_offset(target_row[pos]);
                if in_off + d > params.len() || tgt_off + d > params.len() {
                    continue;
                }
                let diff_slot = (row * batch.seq_len + pos) * d;
                let diff = &diffs[diff_slot..diff_slot + d];

                // d/d(e_in) of 0.5*||e_in - e_tgt||^2 = (e_in - e_tgt); d/d(e_tgt) = -(e_in - e_tgt).
                accumulate_clipped(grad_segment, segment, in_off, diff);
                let negated: Vec<f32> = diff.iter().map(|x| -x).collect();
                accumulate_clipped(grad_segment, segment, tgt_off, &negated);
            }
        }
    }
}
