//! The transformer-arithmetic contract the core treats as an external collaborator.
//! The core never looks inside `forward`/`backward`; it only relies on the stated
//! signature and the "writes only to its own buffers" contract.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::data::Batch;
use crate::gradient::Segment;

/// Fixed architecture dimensions, set once at model construction.
#[derive(Debug, Clone, Copy)]
pub struct ModelDims {
    /// Vocabulary size `V`.
    pub vocab_size: usize,
    /// Embedding / hidden width `D`.
    pub embedding_dim: usize,
    /// Number of transformer layers `L`.
    pub num_layers: usize,
    /// Number of attention heads per layer.
    pub num_heads: usize,
    /// Feed-forward hidden width per layer.
    pub ff_hidden_dim: usize,
    /// Maximum sequence length the model was built for.
    pub context_length: usize,
    /// Symmetry order `K` used for vocabulary partitioning.
    pub symmetry_order: u32,
}

impl ModelDims {
    /// Total learnable parameter count implied by these dims.
    ///
    /// Embedding table (`V*D`) + per layer (qkv projections `3*D*D`, output projection
    /// `D*D`, two layer norms `2*D`, feed-forward `2*D*H`) + final projection (`D*V`).
    /// The exact parameter layout is opaque to the core; this is only used to
    /// size the flat parameter vector at model construction.
    pub fn total_params(&self) -> usize {
        let embed = self.vocab_size * self.embedding_dim;
        let attn = 4 * self.embedding_dim * self.embedding_dim;
        let norms = 2 * self.embedding_dim;
        let ff = 2 * self.embedding_dim * self.ff_hidden_dim;
        let per_layer = attn + norms + ff;
        let unembed = self.embedding_dim * self.vocab_size;
        embed + self.num_layers * per_layer + unembed
    }

    /// Deterministically initializes a fresh parameter vector from `seed`: every value is
    /// drawn uniformly from `[-bound, bound]` with `bound = 1/sqrt(embedding_dim)`, the
    /// usual fan-in scaling for embedding and projection weights. Same `seed` and `self`
    /// always produce the same vector.
    pub fn init_params(&self, seed: u64) -> Vec<f32> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let bound = 1.0 / (self.embedding_dim.max(1) as f32).sqrt();
        (0..self.total_params()).map(|_| rng.gen_range(-bound..bound)).collect()
    }
}

/// Per-worker, privately-owned activation and gradient scratch.
///
/// Allocated once at worker start-up, destroyed at worker join; never shared across
/// threads and never touched by the coordinator.
pub struct SphereScratch {
    dims: ModelDims,
    /// `[B*S*D]` input embeddings.
    pub input_embeddings: Vec<f32>,
    /// `[L*B*S*D]` per-layer input.
    pub layer_input: Vec<f32>,
    /// `[L*B*S*D]` per-layer attention output.
    pub attention_output: Vec<f32>,
    /// `[L*B*S*D]` per-layer feed-forward output.
    pub ff_output: Vec<f32>,
    /// `[L*B*S*D]` per-layer (post-residual) layer output.
    pub layer_output: Vec<f32>,
    /// `[L*B*S*H]` per-layer feed-forward hidden activations.
    pub ff_hidden: Vec<f32>,
    /// `[L*B*S*D]` per-layer query cache.
    pub attn_q: Vec<f32>,
    /// `[L*B*S*D]` per-layer key cache.
    pub attn_k: Vec<f32>,
    /// `[L*B*S*D]` per-layer value cache.
    pub attn_v: Vec<f32>,
    /// `[L*B*heads*S*S]` per-layer pre-softmax attention scores.
    pub attn_scores: Vec<f32>,
    /// `[L*B*heads*S*S]` per-layer post-softmax attention weights.
    pub attn_weights: Vec<f32>,
    /// `[B*S*D]` final hidden state after the last layer.
    pub final_hidden: Vec<f32>,
    /// `[B*S*V]` output logits.
    pub logits: Vec<f32>,
    /// `[B*S*V]` backward scratch: gradient flowing into the logits.
    pub grad_logits: Vec<f32>,
    /// `[B*S*D]` backward scratch: gradient flowing into the final hidden state.
    pub grad_hidden: Vec<f32>,
    /// `[B*S*D]` backward scratch: gradient flowing into a single layer's input.
    pub grad_layer: Vec<f32>,
}

impl SphereScratch {
    /// Allocates scratch sized for batches up to `max_batch_size * max_seq_len`
    /// positions, under the fixed architecture `dims`.
    pub fn allocate(dims: ModelDims, max_batch_size: usize, max_seq_len: usize) -> Self {
        let b = max_batch_size;
        let s = max_seq_len;
        let d = dims.embedding_dim;
        let l = dims.num_layers;
        let h = dims.ff_hidden_dim;
        let v = dims.vocab_size;
        let heads = dims.num_heads.max(1);

        Self {
            dims,
            input_embeddings: vec![0.0; b * s * d],
            layer_input: vec![0.0; l * b * s * d],
            attention_output: vec![0.0; l * b * s * d],
            ff_output: vec![0.0; l * b * s * d],
            layer_output: vec![0.0; l * b * s * d],
            ff_hidden: vec![0.0; l * b * s * h],
            attn_q: vec![0.0; l * b * s * d],
            attn_k: vec![0.0; l * b * s * d],
            attn_v: vec![0.0; l * b * s * d],
            attn_scores: vec![0.0; l * b * heads * s * s],
            attn_weights: vec![0.0; l * b * heads * s * s],
            final_hidden: vec![0.0; b * s * d],
            logits: vec![0.0; b * s * v],
            grad_logits: vec![0.0; b * s * v],
            grad_hidden: vec![0.0; b * s * d],
            grad_layer: vec![0.0; b * s * d],
        }
    }

    /// The fixed architecture dims this scratch was sized for.
    pub fn dims(&self) -> ModelDims {
        self.dims
    }
}

/// The external contract a worker invokes once per batch to run the transformer
/// arithmetic. Implementations must be deterministic given `params`, the batch, and
/// prior scratch contents; must write only into `scratch` (forward) or the supplied
/// `grad_segment` (backward); and must never touch the parameter vector.
pub trait TransformerOps: Send + Sync {
    /// Runs the forward pass for `batch`, writing all intermediates into `scratch` and
    /// returning the summed loss over the batch's valid (unmasked) positions.
    fn forward(&self, params: &[f32], batch: &Batch, scratch: &mut SphereScratch) -> f32;

    /// Runs the backward pass for `batch`, reading `scratch` and accumulating gradients
    /// into `grad_segment`, which covers the half-open range `segment` of the full flat
    /// parameter vector. Must not write outside `grad_segment`.
    fn backward(&self, params: &[f32], segment: Segment, batch: &Batch, scratch: &SphereScratch, grad_segment: &mut [f32]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> ModelDims {
        ModelDims { vocab_size: 16, embedding_dim: 8, num_layers: 1, num_heads: 2, ff_hidden_dim: 8, context_length: 8, symmetry_order: 1 }
    }

    #[test]
    fn init_params_is_deterministic_given_the_same_seed() {
        let d = dims();
        let a = d.init_params(42);
        let b = d.init_params(42);
        assert_eq!(a, b);
        assert_eq!(a.len(), d.total_params());
    }

    #[test]
    fn init_params_differs_across_seeds() {
        let d = dims();
        let a = d.init_params(1);
        let b = d.init_params(2);
        assert_ne!(a, b);
    }

    #[test]
    fn init_params_stays_within_the_fan_in_bound() {
        let d = dims();
        let bound = 1.0 / (d.embedding_dim as f32).sqrt();
        for v in d.init_params(7) {
            assert!(v.abs() <= bound, "{v} exceeds bound {bound}");
        }
    }
}
