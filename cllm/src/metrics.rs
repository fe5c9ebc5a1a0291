//! Process-wide metrics snapshot and event log, ported from the `Registry`/
//! `Logger<T>` pattern used for dataflow logging, but shared across threads: the
//! coordinator publishes after every reduction from its own thread, while observers may be
//! registered from any thread before the run starts.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::sphere::SphereState;

/// Hierarchical routing is in use (`T > K + 1`, ).
pub const FEATURE_HIERARCHICAL: u32 = 1 << 0;
/// The optimizer is running with AMSGrad's running max of the second moment.
pub const FEATURE_AMSGRAD: u32 = 1 << 1;
/// At least one reduction this run has clipped a gradient's norm.
pub const FEATURE_GRADIENT_CLIPPED: u32 = 1 << 2;
/// At least one reduction this run has dropped a NaN/Inf segment.
pub const FEATURE_NAN_GUARDED: u32 = 1 << 3;

/// Per-worker state exposed in a [`Metrics`] snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    pub sphere_id: usize,
    pub state: SphereState,
    pub batches_processed: u64,
    pub avg_loss: f32,
    pub tokens_processed: u64,
}

/// A point-in-time copy of coordinator state, published once per reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub epoch: u64,
    pub step: u64,
    pub current_loss: f32,
    pub best_loss: f32,
    pub workers: Vec<WorkerStats>,
    pub learning_rate: f32,
    pub gradient_norm: f32,
    pub parameter_norm: f32,
    pub tokens_per_second: f64,
    pub feature_flags: u32,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            epoch: 0,
            step: 0,
            current_loss: 0.0,
            best_loss: f32::INFINITY,
            workers: Vec::new(),
            learning_rate: 0.0,
            gradient_norm: 0.0,
            parameter_norm: 0.0,
            tokens_per_second: 0.0,
            feature_flags: 0,
        }
    }
}

impl Metrics {
    /// Sets a feature flag, leaving the others untouched.
    pub fn set_flag(&mut self, flag: u32) {
        self.feature_flags |= flag;
    }

    /// Whether a feature flag is currently set.
    pub fn has_flag(&self, flag: u32) -> bool {
        self.feature_flags & flag != 0
    }
}

/// A named, timestamped progress or anomaly event (progress lines, anomaly
/// warnings naming the affected worker/segment, shutdown diagnostics).
#[derive(Debug, Clone)]
pub enum MetricsEvent {
    /// Emitted every batch group, or every 100 batches
    Progress { epoch: u64, batches_done: u64 },
    /// A worker's gradient segment was dropped during reduction (NaN/Inf).
    SegmentDropped { worker: usize, reason: String },
    /// Three consecutive reductions dropped every segment.
    Divergence { consecutive_failures: u32 },
    /// A free-form diagnostic, e.g. on abort: queue counters and epoch position.
    Diagnostic(String),
}

type MetricsObserver = Box<dyn Fn(&Metrics) + Send>;
type EventObserver = Box<dyn Fn(&Duration, &MetricsEvent) + Send>;

struct Inner {
    snapshot: Metrics,
    metrics_observers: Vec<MetricsObserver>,
    event_observers: Vec<EventObserver>,
}

/// The process-wide metrics hub. One instance is shared (via `Arc`) between the
/// coordinator and anything that wants to observe training progress.
pub struct MetricsRegistry {
    start: Instant,
    inner: Mutex<Inner>,
}

impl MetricsRegistry {
    /// Builds a registry with an empty snapshot and, unless `with_default_observer` is
    /// false, a lightweight `eprintln!`-based event observer installed so the event stream
    /// is never left silently unconsumed.
    pub fn new(with_default_observer: bool) -> Arc<Self> {
        let registry = Arc::new(Self {
            start: Instant::now(),
            inner: Mutex::new(Inner {
                snapshot: Metrics::default(),
                metrics_observers: Vec::new(),
                event_observers: Vec::new(),
            }),
        });
        if with_default_observer {
            registry.register_event_observer(Box::new(|_elapsed, event| {
                eprintln!("[cllm] {event:?}");
            }));
        }
        registry
    }

    /// Registers a closure invoked, under the lock, with every published [`Metrics`]
    /// snapshot. Must not block.
    pub fn register_metrics_observer(&self, observer: MetricsObserver) {
        self.inner.lock().unwrap().metrics_observers.push(observer);
    }

    /// Registers a closure invoked, under the lock, with every logged [`MetricsEvent`].
    pub fn register_event_observer(&self, observer: EventObserver) {
        self.inner.lock().unwrap().event_observers.push(observer);
    }

    /// Replaces the current snapshot and notifies all registered metrics observers.
    pub fn publish(&self, snapshot: Metrics) {
        let mut inner = self.inner.lock().unwrap();
        inner.snapshot = snapshot.clone();
        for observer in &inner.metrics_observers {
            observer(&snapshot);
        }
    }

    /// A consistent copy of the latest published snapshot.
    pub fn snapshot(&self) -> Metrics {
        self.inner.lock().unwrap().snapshot.clone()
    }

    /// Logs an event, timestamped relative to registry construction, to all event
    /// observers.
    pub fn log_event(&self, event: MetricsEvent) {
        let elapsed = self.start.elapsed();
        let inner = self.inner.lock().unwrap();
        for observer in &inner.event_observers {
            observer(&elapsed, &event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_notifies_observers_with_the_new_snapshot() {
        let registry = MetricsRegistry::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        registry.register_metrics_observer(Box::new(move |m| {
            seen_clone.lock().unwrap().push(m.epoch);
        }));

        let mut snap = Metrics::default();
        snap.epoch = 1;
        registry.publish(snap);
        let mut snap = Metrics::default();
        snap.epoch = 2;
        registry.publish(snap);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(registry.snapshot().epoch, 2);
    }

    #[test]
    fn feature_flags_are_independent_bits() {
        let mut m = Metrics::default();
        m.set_flag(FEATURE_HIERARCHICAL);
        m.set_flag(FEATURE_NAN_GUARDED);
        assert!(m.has_flag(FEATURE_HIERARCHICAL));
        assert!(m.has_flag(FEATURE_NAN_GUARDED));
        assert!(!m.has_flag(FEATURE_AMSGRAD));
    }

    #[test]
    fn event_observers_receive_logged_events() {
        let registry = MetricsRegistry::new(false);
        let seen = Arc::new(Mutex::new(0u32));
        let seen_clone = seen.clone();
        registry.register_event_observer(Box::new(move |_elapsed, event| {
            if let MetricsEvent::Divergence { consecutive_failures } = event {
                *seen_clone.lock().unwrap() = *consecutive_failures;
            }
        }));
        registry.log_event(MetricsEvent::Divergence { consecutive_failures: 3 });
        assert_eq!(*seen.lock().unwrap(), 3);
    }
}
