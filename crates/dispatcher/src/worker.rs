//! Worker bound to one core
//!
//! A worker owns one model replica and processes requests serially. Failures
//! and panics inside the backend are turned into per-request errors, and a
//! panicking callback is logged; neither ends the worker loop.

use crate::backend::{ModelLoader, ModelReplica};
use crate::queue::QueueConsumer;
use crate::request::{Completion, InferenceRequest, QueuedRequest, Timings};
use crate::tensor::Tensor;
use coreloop_common::{CoreLoopError, Result, METRICS};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Counters reported by a worker when it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub core_id: usize,
    pub succeeded: u64,
    pub failed: u64,
}

impl WorkerStats {
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// A model replica bound to one core
pub struct Worker {
    core_id: usize,
    replica: Box<dyn ModelReplica>,
    stats: WorkerStats,
}

impl Worker {
    /// Load `artifact_path` onto `core_id`
    ///
    /// A panic inside the loader is reported as a load failure.
    pub fn load(loader: &dyn ModelLoader, artifact_path: &Path, core_id: usize) -> Result<Self> {
        let replica = panic::catch_unwind(AssertUnwindSafe(|| loader.load(artifact_path, core_id)))
            .unwrap_or_else(|payload| {
                Err(CoreLoopError::load(format!(
                    "core {}: loader panicked: {}",
                    core_id,
                    panic_message(payload.as_ref())
                )))
            })?;

        Ok(Self::new(core_id, replica))
    }

    /// Wrap an already loaded replica
    pub fn new(core_id: usize, replica: Box<dyn ModelReplica>) -> Self {
        Self {
            core_id,
            replica,
            stats: WorkerStats {
                core_id,
                ..WorkerStats::default()
            },
        }
    }

    pub fn core_id(&self) -> usize {
        self.core_id
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Run inference for one request on this worker's core
    pub fn infer(&mut self, request: &InferenceRequest) -> Result<Vec<Tensor>> {
        let replica = &mut self.replica;
        panic::catch_unwind(AssertUnwindSafe(|| replica.infer(request.inputs()))).unwrap_or_else(
            |payload| {
                Err(CoreLoopError::inference(format!(
                    "backend panicked on request {}: {}",
                    request.id(),
                    panic_message(payload.as_ref())
                )))
            },
        )
    }

    /// Process one dequeued request and fire its callback
    pub(crate) fn process(&mut self, queued: QueuedRequest) {
        let QueuedRequest {
            request,
            callback,
            enqueued_at,
        } = queued;

        let started_at = Instant::now();
        let result = self.infer(&request);
        let finished_at = Instant::now();

        let timings = Timings {
            enqueued_at,
            started_at,
            finished_at,
        };
        METRICS.worker.queue_wait.observe(timings.queue_wait().as_secs_f64());
        METRICS
            .worker
            .inference_duration
            .observe(timings.inference_time().as_secs_f64());

        match &result {
            Ok(_) => {
                self.stats.succeeded += 1;
                METRICS.worker.requests_succeeded.inc();
                trace!(
                    core_id = self.core_id,
                    request_id = request.id(),
                    elapsed = ?timings.inference_time(),
                    "Request completed"
                );
            }
            Err(e) => {
                self.stats.failed += 1;
                METRICS.worker.requests_failed.inc();
                if e.is_per_request() {
                    warn!(
                        core_id = self.core_id,
                        request_id = request.id(),
                        error = %e,
                        "Inference failed"
                    );
                } else {
                    error!(
                        core_id = self.core_id,
                        request_id = request.id(),
                        kind = e.kind(),
                        error = %e,
                        "Backend error"
                    );
                }
            }
        }

        let completion = Completion {
            request_id: request.id(),
            core_id: self.core_id,
            timings,
            result,
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(completion))) {
            METRICS.worker.callback_panics.inc();
            error!(
                core_id = self.core_id,
                request_id = request.id(),
                panic = %panic_message(payload.as_ref()),
                "Completion callback panicked"
            );
        }
    }

    /// Pull from the queue until it is closed and drained
    pub(crate) fn run(mut self, consumer: QueueConsumer) -> WorkerStats {
        info!(core_id = self.core_id, "Worker started");

        while let Some(queued) = consumer.next() {
            self.process(queued);
        }

        debug!(core_id = self.core_id, "Queue closed and drained");
        info!(
            core_id = self.core_id,
            succeeded = self.stats.succeeded,
            failed = self.stats.failed,
            "Worker stopped"
        );
        self.stats
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
