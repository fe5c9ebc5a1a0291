//! The `Batch` record and token-id constants

/// Unsigned 32-bit index into a vocabulary of size `V`.
pub type TokenId = u32;

/// Padding token. Padding positions carry this id on both `input_ids` and `target_ids`.
pub const PAD: TokenId = 0;
/// Beginning-of-sequence token.
pub const BOS: TokenId = 2;
/// End-of-sequence token.
pub const EOS: TokenId = 3;

/// An immutable `(input_ids, target_ids, mask)` triple covering `batch_size * seq_len`
/// positions, produced by a [`crate::iterator::BatchIterator`].
///
/// Ownership passes iterator -> prefetch queue -> work queue -> worker, which destroys
/// it after backward. `Batch` carries no interior mutability; a worker that wants to
/// mutate anything writes into its own scratch, never into the batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Flattened `[batch_size * seq_len]` input token ids.
    pub input_ids: Vec<TokenId>,
    /// Flattened `[batch_size * seq_len]` target token ids, same layout as `input_ids`.
    pub target_ids: Vec<TokenId>,
    /// Flattened `[batch_size * seq_len]` mask, 1.0 for real positions, 0.0 for padding.
    pub mask: Vec<f32>,
    /// Number of sequences in the batch.
    pub batch_size: usize,
    /// Length of each sequence.
    pub seq_len: usize,
    /// Count of positions with `mask == 1.0`.
    pub valid_token_count: usize,
}

impl Batch {
    /// Constructs a batch, computing `valid_token_count` from the mask.
    ///
    /// # Panics
    /// Panics if the slice lengths are inconsistent with `batch_size * seq_len` — this is
    /// an internal invariant of the iterator, never a user-facing error.
    pub fn new(input_ids: Vec<TokenId>, target_ids: Vec<TokenId>, mask: Vec<f32>, batch_size: usize, seq_len: usize) -> Self {
        let expected = batch_size * seq_len;
        assert_eq!(input_ids.len(), expected, "input_ids length mismatch");
        assert_eq!(target_ids.len(), expected, "target_ids length mismatch");
        assert_eq!(mask.len(), expected, "mask length mismatch");
        let valid_token_count = mask.iter().filter(|&&m| m != 0.0).count();
        Self { input_ids, target_ids, mask, batch_size, seq_len, valid_token_count }
    }

    /// Total positions in the batch, padding included.
    pub fn total_positions(&self) -> usize {
        self.batch_size * self.seq_len
    }

    /// Row slice `[seq_len]` for sequence `row` across `input_ids`.
    pub fn input_row(&self, row: usize) -> &[TokenId] {
        let start = row * self.seq_len;
        &self.input_ids[start..start + self.seq_len]
    }

    /// Row slice `[seq_len]` for sequence `row` across `target_ids`.
    pub fn target_row(&self, row: usize) -> &[TokenId] {
        let start = row * self.seq_len;
        &self.target_ids[start..start + self.seq_len]
    }

    /// Row slice `[seq_len]` for sequence `row` across `mask`.
    pub fn mask_row(&self, row: usize) -> &[f32] {
        let start = row * self.seq_len;
        &self.mask[start..start + self.seq_len]
    }

    /// Whether sequence `row` has at least one unmasked position.
    pub fn row_is_valid(&self, row: usize) -> bool {
        self.mask_row(row).iter().any(|&m| m != 0.0)
    }

    /// Padding invariant check: every position has `mask == 1` iff neither id at that
    /// position is `PAD`.
    #[cfg(test)]
    pub(crate) fn satisfies_padding_invariant(&self) -> bool {
        (0..self.total_positions()).all(|i| {
            let is_real = self.input_ids[i] != PAD && self.target_ids[i] != PAD;
            (self.mask[i] != 0.0) == is_real
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_token_count_matches_mask() {
        let batch = Batch::new(vec![1, 2, PAD, PAD], vec![2, 3, PAD, PAD], vec![1.0, 1.0, 0.0, 0.0], 2, 2);
        assert_eq!(batch.valid_token_count, 2);
        assert!(batch.satisfies_padding_invariant());
    }

    #[test]
    fn row_accessors_slice_correctly() {
        let batch = Batch::new(vec![1, 2, 3, 4], vec![2, 3, 4, 5], vec![1.0; 4], 2, 2);
        assert_eq!(batch.input_row(1), &[3, 4]);
        assert_eq!(batch.target_row(0), &[2, 3]);
        assert!(batch.row_is_valid(0));
    }
}
