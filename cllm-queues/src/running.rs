//! The single global stop signal shared by the prefetcher, coordinator, and every worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cheaply-cloned handle to the computation's `running` flag.
///
/// Every loop in the system (prefetcher, coordinator, workers) tests this at each
/// iteration boundary. Clearing it is the only supported cancellation mechanism.
#[derive(Clone)]
pub struct Running {
    flag: Arc<AtomicBool>,
}

impl Default for Running {
    fn default() -> Self {
        Self { flag: Arc::new(AtomicBool::new(true)) }
    }
}

impl Running {
    /// Returns whether the computation should keep going.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Clears the flag, requesting that every loop observing it stop at its next check.
    pub fn stop(&self) {
        self.flag.store(false, Ordering::Release);
    }
}
