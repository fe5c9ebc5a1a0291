//! Error kinds produced by the training runtime

use thiserror::Error;

/// Errors the core can raise. Propagation policy: `NumericAnomaly` is recoverable
/// and handled inline by the reducer; everything else is fatal to the operation that
/// raised it.
#[derive(Debug, Error)]
pub enum CllmError {
    /// Corrupt batch, malformed token stream, or invalid model header.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Failed to allocate scratch, gradient, or queue storage at startup.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// NaN or Inf observed in a worker's gradient segment during reduction.
    ///
    /// Recoverable: the segment is dropped from the reduction rather than propagated to
    /// the caller. This variant exists so the coordinator can log and count occurrences
    /// without unwinding.
    #[error("numeric anomaly in segment {segment}: {reason}")]
    NumericAnomaly {
        /// Index of the worker whose segment was dropped.
        segment: usize,
        /// Human-readable description (e.g. "NaN", "Inf", "norm exceeds bound").
        reason: String,
    },

    /// Three consecutive reductions dropped every segment; the epoch is abandoned.
    #[error("divergence detected: {consecutive_failures} consecutive reductions with no valid segments")]
    DivergenceDetected {
        /// Number of consecutive all-dropped reductions observed.
        consecutive_failures: u32,
    },

    /// A structural invariant was violated (out-of-segment write, inconsistent queue
    /// counters, etc). Fatal; the process should abort with the attached diagnostic.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// `running` was observed cleared. Not a true error at the API boundary, but
    /// modeled as one so callers can distinguish clean shutdown from success.
    #[error("interrupted")]
    Interrupted,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CllmError>;
