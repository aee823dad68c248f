//! Metrics collection for CoreLoop
//!
//! Prometheus metrics for the dispatcher. Workers update them on the hot path,
//! so everything here is a lock-free counter, gauge or histogram.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics registry for CoreLoop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub dispatcher: DispatcherMetrics,
    pub worker: WorkerMetrics,
}

/// Submission-side metrics
#[derive(Debug, Clone)]
pub struct DispatcherMetrics {
    /// Requests accepted into the queue
    pub requests_submitted: IntCounter,

    /// Requests rejected at submission, labelled by reason
    pub requests_rejected: IntCounterVec,

    /// Current queue depth
    pub queue_depth: IntGauge,

    /// Workers that loaded their replica and are serving
    pub active_workers: IntGauge,

    /// Workers that failed to load
    pub load_failures: IntCounter,
}

/// Worker-side metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Completed requests
    pub requests_succeeded: IntCounter,

    /// Requests whose inference failed
    pub requests_failed: IntCounter,

    /// Time spent inside the backend
    pub inference_duration: Histogram,

    /// Time between submission and dequeue
    pub queue_wait: Histogram,

    /// Callbacks that panicked
    pub callback_panics: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    ///
    /// Metric construction only fails on malformed names or duplicate
    /// registration, both of which are programming errors here.
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests_submitted = IntCounter::new(
            "coreloop_requests_submitted_total",
            "Total number of requests accepted by the dispatcher",
        )
        .expect("valid metric");

        let requests_rejected = IntCounterVec::new(
            Opts::new(
                "coreloop_requests_rejected_total",
                "Total number of requests rejected at submission",
            ),
            &["reason"],
        )
        .expect("valid metric");

        let queue_depth = IntGauge::new("coreloop_queue_depth", "Current depth of the request queue")
            .expect("valid metric");

        let active_workers = IntGauge::new(
            "coreloop_active_workers",
            "Current number of workers serving requests",
        )
        .expect("valid metric");

        let load_failures = IntCounter::new(
            "coreloop_load_failures_total",
            "Total number of workers that failed to load a model replica",
        )
        .expect("valid metric");

        let requests_succeeded = IntCounter::new(
            "coreloop_requests_succeeded_total",
            "Total number of requests completed successfully",
        )
        .expect("valid metric");

        let requests_failed = IntCounter::new(
            "coreloop_requests_failed_total",
            "Total number of requests whose inference failed",
        )
        .expect("valid metric");

        let inference_duration = Histogram::with_opts(
            HistogramOpts::new(
                "coreloop_inference_duration_seconds",
                "Backend inference duration in seconds",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0]),
        )
        .expect("valid metric");

        let queue_wait = Histogram::with_opts(
            HistogramOpts::new(
                "coreloop_queue_wait_seconds",
                "Time requests spend in queue before a worker picks them up",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.1, 0.5]),
        )
        .expect("valid metric");

        let callback_panics = IntCounter::new(
            "coreloop_callback_panics_total",
            "Total number of completion callbacks that panicked",
        )
        .expect("valid metric");

        registry.register(Box::new(requests_submitted.clone())).expect("unique metric");
        registry.register(Box::new(requests_rejected.clone())).expect("unique metric");
        registry.register(Box::new(queue_depth.clone())).expect("unique metric");
        registry.register(Box::new(active_workers.clone())).expect("unique metric");
        registry.register(Box::new(load_failures.clone())).expect("unique metric");

        registry.register(Box::new(requests_succeeded.clone())).expect("unique metric");
        registry.register(Box::new(requests_failed.clone())).expect("unique metric");
        registry.register(Box::new(inference_duration.clone())).expect("unique metric");
        registry.register(Box::new(queue_wait.clone())).expect("unique metric");
        registry.register(Box::new(callback_panics.clone())).expect("unique metric");

        MetricsRegistry {
            registry,
            dispatcher: DispatcherMetrics {
                requests_submitted,
                requests_rejected,
                queue_depth,
                active_workers,
                load_failures,
            },
            worker: WorkerMetrics {
                requests_succeeded,
                requests_failed,
                inference_duration,
                queue_wait,
                callback_panics,
            },
        }
    }

    /// Gather all metrics in the Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
