//! Produces a finite, restartable sequence of [`Batch`] values from a token stream.

use crate::data::{Batch, TokenId, PAD};
use crate::error::{CllmError, Result};

/// Configuration for a [`BatchIterator`].
#[derive(Debug, Clone, Copy)]
pub struct BatchIteratorConfig {
    /// Sequences per batch.
    pub batch_size: usize,
    /// Tokens per sequence.
    pub seq_len: usize,
    /// Whether a final, partially-full stream tail is dropped (`true`) or emitted as one
    /// padded batch (`false`).
    pub drop_last: bool,
}

/// A finite, restartable, forward-only sequence of [`Batch`] values over an owned token
/// stream.
///
/// For stream position `p`, `input_ids[i] = stream[p + i]` and
/// `target_ids[i] = stream[p + i + 1]` — the iterator is a sliding next-token window, so
/// producing one batch requires `batch_size * seq_len + 1` tokens remaining.
pub struct BatchIterator {
    stream: Vec<TokenId>,
    config: BatchIteratorConfig,
    position: usize,
}

impl BatchIterator {
    /// Builds an iterator over `stream`. Fails with [`CllmError::MalformedInput`] if the
    /// stream is too short to ever produce even one next-token pair.
    pub fn new(stream: Vec<TokenId>, config: BatchIteratorConfig) -> Result<Self> {
        if stream.len() < 2 {
            return Err(CllmError::MalformedInput(format!(
                "token stream has length {}, need at least 2",
                stream.len()
            )));
        }
        Ok(Self { stream, config, position: 0 })
    }

    /// Tokens remaining from the current position to the end of the stream.
    fn tokens_remaining(&self) -> usize {
        self.stream.len().saturating_sub(self.position)
    }

    /// Window size of one full (unpadded) batch, including the trailing target token.
    fn window(&self) -> usize {
        self.config.batch_size * self.config.seq_len + 1
    }

    /// Produces the next batch, or `None` at end-of-stream.
    pub fn next(&mut self) -> Option<Batch> {
        let remaining = self.tokens_remaining();
        let window = self.window();

        if remaining >= window {
            let batch = self.full_batch();
            self.position += self.config.batch_size * self.config.seq_len;
            return Some(batch);
        }

        if self.config.drop_last {
            return None;
        }

        // 0 < remaining <= batch_size * seq_len: one final padded batch.
        if remaining > 1 {
            let batch = self.padded_tail_batch(remaining);
            self.position = self.stream.len();
            return Some(batch);
        }

        None
    }

    fn full_batch(&self) -> Batch {
        let b = self.config.batch_size;
        let s = self.config.seq_len;
        let mut input_ids = Vec::with_capacity(b * s);
        let mut target_ids = Vec::with_capacity(b * s);
        for row in 0..b {
            let row_start = self.position + row * s;
            for i in 0..s {
                input_ids.push(self.stream[row_start + i]);
                target_ids.push(self.stream[row_start + i + 1]);
            }
        }
        let mask = vec![1.0f32; b * s];
        Batch::new(input_ids, target_ids, mask, b, s)
    }

    /// `remaining` real next-token pairs are available (`remaining - 1` full pairs once
    /// you account for the need for a trailing target), packed into row-major order and
    /// padded out to a full `batch_size * seq_len` grid.
    fn padded_tail_batch(&self, remaining: usize) -> Batch {
        let b = self.config.batch_size;
        let s = self.config.seq_len;
        let real_positions = remaining - 1;
        let total = b * s;

        let mut input_ids = Vec::with_capacity(total);
        let mut target_ids = Vec::with_capacity(total);
        let mut mask = Vec::with_capacity(total);

        for i in 0..total {
            if i < real_positions {
                input_ids.push(self.stream[self.position + i]);
                target_ids.push(self.stream[self.position + i + 1]);
                mask.push(1.0);
            } else {
                input_ids.push(PAD);
                target_ids.push(PAD);
                mask.push(0.0);
            }
        }

        Batch::new(input_ids, target_ids, mask, b, s)
    }

    /// Rewinds to the stream start. Idempotent.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Exact number of batches this iterator will yield from the current position under
    /// the current configuration, without consuming it.
    ///
    /// `len()` is defined operationally (how many times `next()` would succeed), so it is
    /// computed by simulating position advancement rather than a closed-form formula that
    /// would have to special-case `drop_last` twice.
    pub fn len(&self) -> usize {
        let step = self.config.batch_size * self.config.seq_len;
        let window = self.window();
        let mut remaining = self.tokens_remaining();
        let mut count = 0;
        loop {
            if remaining >= window {
                count += 1;
                remaining -= step;
            } else if !self.config.drop_last && remaining > 1 {
                count += 1;
                break;
            } else {
                break;
            }
        }
        count
    }

    /// Whether the iterator is exhausted (no further call to `next()` will succeed).
    pub fn is_exhausted(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(batch_size: usize, seq_len: usize, drop_last: bool) -> BatchIteratorConfig {
        BatchIteratorConfig { batch_size, seq_len, drop_last }
    }

    #[test]
    fn tiny_epoch_yields_exactly_two_batches() {
        let stream: Vec<TokenId> = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 1, 2, 3];
        assert_eq!(stream.len(), 18);
        let mut iter = BatchIterator::new(stream, config(2, 4, true)).unwrap();
        assert_eq!(iter.len(), 2);
        let b1 = iter.next().expect("first batch");
        assert_eq!(b1.input_ids, vec![1, 2, 3, 4, 2, 3, 4, 5]);
        assert_eq!(b1.target_ids, vec![2, 3, 4, 5, 3, 4, 5, 6]);
        let b2 = iter.next().expect("second batch");
        assert_eq!(b2.input_ids, vec![9, 10, 11, 12, 10, 11, 12, 13]);
        assert!(iter.next().is_none());
    }

    #[test]
    fn drop_last_true_drops_short_tail() {
        let stream: Vec<TokenId> = (0..10).collect();
        let mut iter = BatchIterator::new(stream, config(2, 4, true)).unwrap();
        // window = 2*4+1 = 9, remaining = 10 on first call -> one batch, then remaining=2 < 9 -> stop.
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
    }

    #[test]
    fn drop_last_false_pads_final_batch() {
        let stream: Vec<TokenId> = (0..5).collect();
        let mut iter = BatchIterator::new(stream, config(1, 4, false)).unwrap();
        let batch = iter.next().expect("padded tail batch");
        assert_eq!(batch.input_ids, vec![0, 1, 2, 3]);
        assert_eq!(batch.target_ids, vec![1, 2, 3, 4]);
        assert_eq!(batch.mask, vec![1.0, 1.0, 1.0, 1.0]);
        assert!(iter.next().is_none());
    }

    #[test]
    fn drop_last_false_marks_tail_padding() {
        let stream: Vec<TokenId> = (1..4).collect();
        let mut iter = BatchIterator::new(stream, config(1, 4, false)).unwrap();
        let batch = iter.next().expect("padded tail batch");
        assert_eq!(batch.input_ids, vec![1, 2, PAD, PAD]);
        assert_eq!(batch.target_ids, vec![2, 3, PAD, PAD]);
        assert_eq!(batch.mask, vec![1.0, 1.0, 0.0, 0.0]);
        assert!(batch.satisfies_padding_invariant());
    }

    #[test]
    fn malformed_stream_rejected() {
        let err = BatchIterator::new(vec![1], config(1, 1, true)).unwrap_err();
        assert!(matches!(err, CllmError::MalformedInput(_)));
    }

    #[test]
    fn reset_is_idempotent_and_round_trips() {
        let stream: Vec<TokenId> = (0..20).collect();
        let mut iter = BatchIterator::new(stream, config(2, 3, true)).unwrap();

        let mut first_pass = Vec::new();
        while let Some(b) = iter.next() {
            first_pass.push(b.input_ids);
        }

        iter.reset();
        iter.reset();

        let mut second_pass = Vec::new();
        while let Some(b) = iter.next() {
            second_pass.push(b.input_ids);
        }

        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn empty_stream_ends_immediately() {
        let stream: Vec<TokenId> = (0..1).collect();
        let err = BatchIterator::new(stream, config(1, 1, true));
        assert!(err.is_err());
    }
}
