//! Requests, completions and callbacks

use crate::tensor::Tensor;
use coreloop_common::{CoreLoopError, Result};
use std::time::{Duration, Instant};

/// Request identifier, opaque to the dispatcher
pub type RequestId = u64;

/// A single inference request
///
/// Inputs are immutable once submitted.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    id: RequestId,
    inputs: Vec<Tensor>,
}

impl InferenceRequest {
    pub fn new(id: RequestId, inputs: Vec<Tensor>) -> Self {
        Self { id, inputs }
    }

    /// Request with a single input tensor
    pub fn single(id: RequestId, input: Tensor) -> Self {
        Self::new(id, vec![input])
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }
}

/// Timestamps recorded for every request
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Accepted by `submit`
    pub enqueued_at: Instant,
    /// Picked up by a worker
    pub started_at: Instant,
    /// Inference returned (before the callback runs)
    pub finished_at: Instant,
}

impl Timings {
    pub fn queue_wait(&self) -> Duration {
        self.started_at.saturating_duration_since(self.enqueued_at)
    }

    pub fn inference_time(&self) -> Duration {
        self.finished_at.saturating_duration_since(self.started_at)
    }

    pub fn total(&self) -> Duration {
        self.finished_at.saturating_duration_since(self.enqueued_at)
    }
}

/// Outcome of one request, handed to its callback exactly once
#[derive(Debug)]
pub struct Completion {
    pub request_id: RequestId,
    /// Core of the worker that processed the request
    pub core_id: usize,
    pub timings: Timings,
    pub result: Result<Vec<Tensor>>,
}

impl Completion {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<Vec<Tensor>> {
        self.result
    }

    /// Error of a failed request, if any
    pub fn error(&self) -> Option<&CoreLoopError> {
        self.result.as_ref().err()
    }
}

/// Completion callback, run on the worker thread that processed the request
pub type Callback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// A request waiting in the queue together with its callback
pub(crate) struct QueuedRequest {
    pub(crate) request: InferenceRequest,
    pub(crate) callback: Callback,
    pub(crate) enqueued_at: Instant,
}

impl QueuedRequest {
    pub(crate) fn new(request: InferenceRequest, callback: Callback) -> Self {
        Self {
            request,
            callback,
            enqueued_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timings_durations() {
        let enqueued_at = Instant::now();
        let started_at = enqueued_at + Duration::from_millis(5);
        let finished_at = started_at + Duration::from_millis(10);
        let timings = Timings {
            enqueued_at,
            started_at,
            finished_at,
        };

        assert_eq!(timings.queue_wait(), Duration::from_millis(5));
        assert_eq!(timings.inference_time(), Duration::from_millis(10));
        assert_eq!(timings.total(), Duration::from_millis(15));
    }

    #[test]
    fn test_completion_accessors() {
        let now = Instant::now();
        let completion = Completion {
            request_id: 7,
            core_id: 1,
            timings: Timings {
                enqueued_at: now,
                started_at: now,
                finished_at: now,
            },
            result: Err(CoreLoopError::inference("boom")),
        };

        assert!(!completion.is_ok());
        assert_eq!(completion.error().map(|e| e.kind()), Some("inference"));
        assert!(completion.into_result().is_err());
    }
}
