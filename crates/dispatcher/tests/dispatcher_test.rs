//! Dispatcher behavior with an in-process test backend

use coreloop_common::CoreLoopError;
use coreloop_dispatcher::{
    Completion, Dispatcher, DispatcherOptions, InferenceRequest, ModelLoader, ModelReplica,
    Tensor,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Echoes its input after an optional delay; rejects negative first values
struct EchoReplica {
    core_id: usize,
    delay: Duration,
}

impl ModelReplica for EchoReplica {
    fn core_id(&self) -> usize {
        self.core_id
    }

    fn infer(&mut self, inputs: &[Tensor]) -> coreloop_common::Result<Vec<Tensor>> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        match inputs.first().and_then(|t| t.as_slice().first()) {
            Some(v) if *v < 0.0 => Err(CoreLoopError::inference("negative input")),
            _ => Ok(inputs.to_vec()),
        }
    }
}

struct EchoLoader {
    delay: Duration,
}

impl ModelLoader for EchoLoader {
    fn load(&self, _path: &Path, core_id: usize) -> coreloop_common::Result<Box<dyn ModelReplica>> {
        Ok(Box::new(EchoReplica {
            core_id,
            delay: self.delay,
        }))
    }
}

fn start(cores: Vec<usize>) -> Dispatcher {
    start_with(cores, Duration::ZERO, None)
}

fn start_with(cores: Vec<usize>, delay: Duration, capacity: Option<usize>) -> Dispatcher {
    let mut options = DispatcherOptions::new("test.artifact", cores);
    if let Some(capacity) = capacity {
        options = options.with_queue_capacity(capacity);
    }
    Dispatcher::start(Arc::new(EchoLoader { delay }), options).unwrap()
}

fn request(id: u64, value: f32) -> InferenceRequest {
    InferenceRequest::single(id, Tensor::new(vec![value], vec![1, 1]).unwrap())
}

#[test]
fn test_every_request_completes_exactly_once() {
    let dispatcher = start(vec![0, 1, 2, 3]);
    let counts = Arc::new(Mutex::new(HashMap::new()));

    for id in 0..200u64 {
        let counts = counts.clone();
        let value = if id % 7 == 0 { -1.0 } else { 1.0 };
        dispatcher
            .submit(request(id, value), move |c: Completion| {
                *counts.lock().entry(c.request_id).or_insert(0) += 1;
            })
            .unwrap();
    }
    dispatcher.stop();

    let counts = counts.lock();
    assert_eq!(counts.len(), 200);
    assert!(counts.values().all(|&n| n == 1));
}

#[test]
fn test_ten_requests_two_workers() {
    let dispatcher = start(vec![0, 1]);
    let seen = Arc::new(Mutex::new(Vec::new()));

    for id in 0..10u64 {
        let seen = seen.clone();
        dispatcher
            .submit(request(id, id as f32), move |c: Completion| {
                assert!(c.is_ok());
                seen.lock().push(c.request_id);
            })
            .unwrap();
    }
    dispatcher.stop();

    let seen = seen.lock();
    assert_eq!(seen.len(), 10);
    let unique: BTreeSet<_> = seen.iter().copied().collect();
    assert_eq!(unique, (0..10).collect());
}

#[test]
fn test_single_worker_preserves_submission_order() {
    let dispatcher = start(vec![0]);
    let order = Arc::new(Mutex::new(Vec::new()));

    for id in 0..50u64 {
        let order = order.clone();
        dispatcher
            .submit(request(id, 1.0), move |c: Completion| order.lock().push(c.request_id))
            .unwrap();
    }
    dispatcher.stop();

    assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
}

#[test]
fn test_each_worker_completes_in_dequeue_order() {
    let dispatcher = start(vec![0, 1, 2]);
    let per_core: Arc<Mutex<HashMap<usize, Vec<u64>>>> = Arc::new(Mutex::new(HashMap::new()));

    for id in 0..300u64 {
        let per_core = per_core.clone();
        dispatcher
            .submit(request(id, 1.0), move |c: Completion| {
                per_core.lock().entry(c.core_id).or_default().push(c.request_id);
            })
            .unwrap();
    }
    dispatcher.stop();

    // A single queue hands out ids in submission order, so each worker sees
    // an increasing subsequence.
    for ids in per_core.lock().values() {
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", ids);
    }
}

#[test]
fn test_worker_continues_after_failed_request() {
    let dispatcher = start(vec![0]);
    let results = Arc::new(Mutex::new(Vec::new()));

    for (id, value) in [(1, 1.0), (2, -1.0), (3, 1.0)] {
        let results = results.clone();
        dispatcher
            .submit_with_handlers(
                request(id, value),
                {
                    let results = results.clone();
                    move |id, _outputs, _timings| results.lock().push((id, true))
                },
                move |id, err, _timings| {
                    assert!(matches!(err, CoreLoopError::Inference(_)));
                    results.lock().push((id, false));
                },
            )
            .unwrap();
    }
    dispatcher.stop();

    assert_eq!(*results.lock(), vec![(1, true), (2, false), (3, true)]);
}

#[test]
fn test_submit_after_stop_is_rejected() {
    let dispatcher = start(vec![0, 1]);
    dispatcher.stop();

    let fired = Arc::new(AtomicUsize::new(0));
    let flag = fired.clone();
    let result = dispatcher.submit(request(1, 1.0), move |_| {
        flag.fetch_add(1, Ordering::SeqCst);
    });

    assert!(matches!(result, Err(CoreLoopError::QueueClosed)));
    assert_eq!(dispatcher.queue_depth(), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stop_drains_pending_requests() {
    let dispatcher = start_with(vec![0], Duration::from_millis(2), None);
    let done = Arc::new(AtomicUsize::new(0));

    for id in 0..25u64 {
        let done = done.clone();
        dispatcher
            .submit(request(id, 1.0), move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    dispatcher.stop();

    assert_eq!(done.load(Ordering::SeqCst), 25);
    assert!(!dispatcher.is_running());
}

#[test]
fn test_bounded_queue_rejects_without_blocking() {
    let dispatcher = start_with(vec![0], Duration::from_millis(50), Some(2));

    let mut accepted = 0;
    let mut rejected = 0;
    for id in 0..10u64 {
        match dispatcher.submit(request(id, 1.0), |_| {}) {
            Ok(()) => accepted += 1,
            Err(CoreLoopError::QueueFull(_)) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    // One request may already be in flight, plus two queued.
    assert!(accepted <= 3, "accepted {}", accepted);
    assert!(rejected >= 7);
    dispatcher.stop();
}

#[test]
fn test_drop_stops_workers() {
    let done = Arc::new(AtomicUsize::new(0));
    {
        let dispatcher = start(vec![0, 1]);
        for id in 0..10u64 {
            let done = done.clone();
            dispatcher
                .submit(request(id, 1.0), move |_| {
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
    }
    assert_eq!(done.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_submit_async_resolves() {
    let dispatcher = start(vec![0, 1]);

    let rx = dispatcher.submit_async(request(42, 3.0)).unwrap();
    let completion = rx.await.unwrap();

    assert_eq!(completion.request_id, 42);
    let outputs = completion.into_result().unwrap();
    assert_eq!(outputs[0].as_slice(), &[3.0]);

    let rx = dispatcher.submit_async(request(43, -3.0)).unwrap();
    let completion = rx.await.unwrap();
    assert!(matches!(completion.error(), Some(CoreLoopError::Inference(_))));

    dispatcher.stop();
}
