//! Shared request queue
//!
//! A multi-producer/multi-consumer channel between submitters and workers.
//! Submission never blocks: a bounded queue rejects with `QueueFull` instead.
//! Closing drops the only sender, and consumers see disconnection only after
//! every queued request has been taken, which is what makes shutdown drain.

use crate::request::QueuedRequest;
use coreloop_common::{CoreLoopError, METRICS};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Request queue shared by the dispatcher and its workers
pub struct RequestQueue {
    /// `None` once closed
    sender: RwLock<Option<Sender<QueuedRequest>>>,

    receiver: Receiver<QueuedRequest>,

    /// Maximum queue size (None = unbounded)
    capacity: Option<usize>,

    /// Current queue depth (atomic for metrics)
    depth: Arc<AtomicUsize>,
}

impl RequestQueue {
    /// Create a new queue
    pub fn new(capacity: Option<usize>) -> Self {
        let (sender, receiver) = match capacity {
            Some(cap) => channel::bounded(cap),
            None => channel::unbounded(),
        };

        Self {
            sender: RwLock::new(Some(sender)),
            receiver,
            capacity,
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueue a request
    ///
    /// Fails with `QueueClosed` after [`close`](Self::close) and with
    /// `QueueFull` when a bounded queue is at capacity. A rejected request is
    /// never enqueued and is handed back to the caller.
    pub(crate) fn try_push(
        &self,
        item: QueuedRequest,
    ) -> std::result::Result<(), (CoreLoopError, QueuedRequest)> {
        // Holding the read lock keeps `close` from racing with the send.
        let guard = self.sender.read();
        let sender = match guard.as_ref() {
            Some(sender) => sender,
            None => return Err((CoreLoopError::QueueClosed, item)),
        };

        let request_id = item.request.id();
        // Count before sending so a fast consumer never takes the gauge below zero.
        self.depth.fetch_add(1, Ordering::SeqCst);
        METRICS.dispatcher.queue_depth.inc();

        match sender.try_send(item) {
            Ok(()) => {
                trace!(request_id, depth = self.depth(), "Request enqueued");
                Ok(())
            }
            Err(TrySendError::Full(item)) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                METRICS.dispatcher.queue_depth.dec();
                Err((
                    CoreLoopError::queue_full(format!(
                        "Request queue is full ({} pending), rejecting request {}",
                        self.capacity.unwrap_or_default(),
                        request_id
                    )),
                    item,
                ))
            }
            Err(TrySendError::Disconnected(item)) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                METRICS.dispatcher.queue_depth.dec();
                Err((CoreLoopError::QueueClosed, item))
            }
        }
    }

    /// Consumer handle for one worker
    pub(crate) fn consumer(&self) -> QueueConsumer {
        QueueConsumer {
            receiver: self.receiver.clone(),
            depth: self.depth.clone(),
        }
    }

    /// Stop accepting requests; returns false if already closed
    pub fn close(&self) -> bool {
        self.sender.write().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Get the current queue depth
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Check if the queue is healthy (below 90% of a bounded capacity)
    pub fn is_healthy(&self) -> bool {
        match self.capacity {
            Some(cap) => self.depth() < (cap * 9 / 10).max(1),
            None => true,
        }
    }
}

/// Worker side of the queue
pub(crate) struct QueueConsumer {
    receiver: Receiver<QueuedRequest>,
    depth: Arc<AtomicUsize>,
}

impl QueueConsumer {
    /// Block until a request is available; `None` once closed and drained
    pub(crate) fn next(&self) -> Option<QueuedRequest> {
        let item = self.receiver.recv().ok()?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        METRICS.dispatcher.queue_depth.dec();
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Completion, InferenceRequest};
    use crate::tensor::Tensor;
    use coreloop_common::Result;

    impl RequestQueue {
        fn push(&self, item: QueuedRequest) -> Result<()> {
            self.try_push(item).map_err(|(e, _)| e)
        }
    }

    fn queued(id: u64) -> QueuedRequest {
        QueuedRequest::new(
            InferenceRequest::single(id, Tensor::zeros(vec![1, 1])),
            Box::new(|_: Completion| {}),
        )
    }

    #[test]
    fn test_queue_fifo_and_drain() {
        let queue = RequestQueue::new(None);
        let consumer = queue.consumer();

        for i in 0..3 {
            queue.push(queued(i)).unwrap();
        }
        assert_eq!(queue.depth(), 3);
        assert!(queue.close());

        let ids: Vec<_> = std::iter::from_fn(|| consumer.next())
            .map(|q| q.request.id())
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_queue_backpressure() {
        let queue = RequestQueue::new(Some(5));

        for i in 0..10 {
            let result = queue.push(queued(i));
            if i < 5 {
                assert!(result.is_ok());
            } else {
                assert!(matches!(result, Err(CoreLoopError::QueueFull(_))));
            }
        }

        assert_eq!(queue.depth(), 5);
        assert!(!queue.is_healthy());
    }

    #[test]
    fn test_queue_full_hands_request_back() {
        let queue = RequestQueue::new(Some(1));
        let consumer = queue.consumer();
        queue.push(queued(1)).unwrap();

        let (err, rejected) = match queue.try_push(queued(2)) {
            Err(rejected) => rejected,
            Ok(()) => panic!("second request should not fit"),
        };
        assert!(matches!(err, CoreLoopError::QueueFull(_)));
        assert_eq!(rejected.request.id(), 2);

        assert_eq!(consumer.next().map(|q| q.request.id()), Some(1));
        assert!(queue.try_push(rejected).is_ok());
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn test_queue_closed_rejects() {
        let queue = RequestQueue::new(None);
        assert!(queue.close());
        assert!(!queue.close());
        assert!(queue.is_closed());

        assert!(matches!(queue.push(queued(1)), Err(CoreLoopError::QueueClosed)));
        assert_eq!(queue.depth(), 0);
    }
}
