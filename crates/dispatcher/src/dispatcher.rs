//! Multi-core inference dispatcher
//!
//! One worker thread per core shares a single request queue. Submission is
//! non-blocking; results are delivered through callbacks that run on the
//! worker thread, so callback bodies should be short.
//!
//! There is no ordering guarantee across workers. Each worker processes
//! requests in the order it dequeues them, so a single-core dispatcher
//! completes requests in submission order.

use crate::backend::ModelLoader;
use crate::cores::resolve_cores;
use crate::queue::RequestQueue;
use crate::request::{Completion, InferenceRequest, QueuedRequest, RequestId, Timings};
use crate::tensor::Tensor;
use crate::worker::{panic_message, Worker, WorkerStats};
use coreloop_common::{CoreLoopConfig, CoreLoopError, Result, METRICS};
use crossbeam::channel;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Options for [`Dispatcher::start`]
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Artifact every worker loads
    pub artifact_path: PathBuf,

    /// One worker per entry
    pub cores: Vec<usize>,

    /// Maximum queue size (None = unbounded)
    pub queue_capacity: Option<usize>,

    /// Worker threads are named `<prefix>-<core>`
    pub thread_name_prefix: String,
}

impl DispatcherOptions {
    pub fn new<P: Into<PathBuf>>(artifact_path: P, cores: Vec<usize>) -> Self {
        Self {
            artifact_path: artifact_path.into(),
            cores,
            queue_capacity: None,
            thread_name_prefix: "coreloop-worker".to_string(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Build options from configuration, honoring the visible-cores override
    pub fn from_config(config: &CoreLoopConfig) -> Result<Self> {
        Ok(Self {
            artifact_path: config.model.artifact_path.clone(),
            cores: resolve_cores(&config.dispatcher.cores)?,
            queue_capacity: config.dispatcher.queue_capacity,
            thread_name_prefix: config.dispatcher.thread_name_prefix.clone(),
        })
    }
}

struct WorkerHandle {
    core_id: usize,
    handle: JoinHandle<WorkerStats>,
}

/// Fans requests out to one worker per core
pub struct Dispatcher {
    queue: RequestQueue,
    workers: Mutex<Vec<WorkerHandle>>,
    worker_threads: Vec<ThreadId>,
    active_cores: Vec<usize>,
}

impl Dispatcher {
    /// Spawn one worker per core and wait until each has loaded or failed
    ///
    /// A load failure only takes down that core's worker. Start fails when no
    /// worker could load.
    pub fn start(loader: Arc<dyn ModelLoader>, options: DispatcherOptions) -> Result<Self> {
        if options.cores.is_empty() {
            return Err(CoreLoopError::config("At least one core is required"));
        }
        if options.queue_capacity == Some(0) {
            return Err(CoreLoopError::config("Queue capacity must be at least 1"));
        }

        info!(
            cores = ?options.cores,
            artifact = %options.artifact_path.display(),
            queue_capacity = ?options.queue_capacity,
            "Starting dispatcher"
        );

        let queue = RequestQueue::new(options.queue_capacity);
        let (ready_tx, ready_rx) = channel::unbounded::<(usize, Result<()>)>();
        let mut handles = Vec::with_capacity(options.cores.len());
        let mut failures = Vec::new();

        for &core_id in &options.cores {
            let loader = loader.clone();
            let artifact_path = options.artifact_path.clone();
            let consumer = queue.consumer();
            let ready_tx = ready_tx.clone();

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", options.thread_name_prefix, core_id))
                .spawn(move || {
                    let worker = match Worker::load(loader.as_ref(), &artifact_path, core_id) {
                        Ok(worker) => worker,
                        Err(e) => {
                            let _ = ready_tx.send((core_id, Err(e)));
                            return WorkerStats {
                                core_id,
                                ..WorkerStats::default()
                            };
                        }
                    };
                    let _ = ready_tx.send((core_id, Ok(())));
                    drop(ready_tx);
                    worker.run(consumer)
                });

            match spawned {
                Ok(handle) => handles.push(WorkerHandle { core_id, handle }),
                Err(e) => failures.push((
                    core_id,
                    CoreLoopError::load(format!("core {}: failed to spawn worker: {}", core_id, e)),
                )),
            }
        }
        drop(ready_tx);

        let mut active_cores = Vec::with_capacity(handles.len());
        for _ in 0..handles.len() {
            match ready_rx.recv() {
                Ok((core_id, Ok(()))) => active_cores.push(core_id),
                Ok((core_id, Err(e))) => failures.push((core_id, e)),
                Err(_) => break,
            }
        }
        active_cores.sort_unstable();

        for (core_id, e) in &failures {
            METRICS.dispatcher.load_failures.inc();
            error!(core_id, error = %e, "Worker failed to load; core disabled");
        }

        let worker_threads = handles.iter().map(|h| h.handle.thread().id()).collect();
        let dispatcher = Self {
            queue,
            workers: Mutex::new(handles),
            worker_threads,
            active_cores,
        };

        if dispatcher.active_cores.is_empty() {
            dispatcher.stop();
            let (_, first) = failures
                .into_iter()
                .next()
                .unwrap_or_else(|| (0, CoreLoopError::load("No worker reported ready")));
            return Err(first);
        }

        METRICS
            .dispatcher
            .active_workers
            .add(dispatcher.active_cores.len() as i64);
        info!(
            active_cores = ?dispatcher.active_cores,
            failed = options.cores.len() - dispatcher.active_cores.len(),
            "Dispatcher running"
        );

        Ok(dispatcher)
    }

    /// Enqueue a request; `callback` fires exactly once with its completion
    ///
    /// Never blocks. Fails with `QueueClosed` after [`stop`](Self::stop) and
    /// `QueueFull` when a bounded queue is at capacity; in both cases the
    /// request is not enqueued and the callback is dropped unfired.
    pub fn submit<F>(&self, request: InferenceRequest, callback: F) -> Result<()>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.submit_queued(QueuedRequest::new(request, Box::new(callback)))
            .map_err(|(e, _)| e)
    }

    /// Enqueue an already boxed request, handing it back on rejection
    pub(crate) fn submit_queued(
        &self,
        queued: QueuedRequest,
    ) -> std::result::Result<(), (CoreLoopError, QueuedRequest)> {
        let request_id = queued.request.id();
        match self.queue.try_push(queued) {
            Ok(()) => {
                METRICS.dispatcher.requests_submitted.inc();
                Ok(())
            }
            Err((e, queued)) => {
                METRICS
                    .dispatcher
                    .requests_rejected
                    .with_label_values(&[e.kind()])
                    .inc();
                debug!(request_id, error = %e, "Request rejected");
                Err((e, queued))
            }
        }
    }

    /// Enqueue a request with separate success and error handlers
    ///
    /// Exactly one of the two handlers fires.
    pub fn submit_with_handlers<S, E>(
        &self,
        request: InferenceRequest,
        on_success: S,
        on_error: E,
    ) -> Result<()>
    where
        S: FnOnce(RequestId, Vec<Tensor>, Timings) + Send + 'static,
        E: FnOnce(RequestId, CoreLoopError, Timings) + Send + 'static,
    {
        self.submit(request, move |completion| match completion.result {
            Ok(outputs) => on_success(completion.request_id, outputs, completion.timings),
            Err(e) => on_error(completion.request_id, e, completion.timings),
        })
    }

    /// Enqueue a request and receive its completion through a oneshot channel
    ///
    /// The receiver can be awaited or read with `blocking_recv`.
    pub fn submit_async(&self, request: InferenceRequest) -> Result<oneshot::Receiver<Completion>> {
        let (tx, rx) = oneshot::channel();
        self.submit(request, move |completion| {
            // The caller may have dropped the receiver.
            let _ = tx.send(completion);
        })?;
        Ok(rx)
    }

    /// Stop accepting requests, drain the queue and join every worker
    ///
    /// Blocks until all workers have exited. Calling it again is a no-op. When
    /// called from a completion callback the queue is closed but the calling
    /// worker cannot be joined, so the call returns without waiting.
    pub fn stop(&self) {
        let was_open = self.queue.close();
        if was_open {
            info!(pending = self.queue.depth(), "Stopping dispatcher, draining queue");
        }

        if self.worker_threads.contains(&thread::current().id()) {
            warn!("stop() called from a worker thread; not waiting for workers");
            return;
        }

        let start = Instant::now();
        let mut workers = self.workers.lock();
        if workers.is_empty() {
            return;
        }

        let mut total = WorkerStats::default();
        for WorkerHandle { core_id, handle } in workers.drain(..) {
            match handle.join() {
                Ok(stats) => {
                    total.succeeded += stats.succeeded;
                    total.failed += stats.failed;
                }
                Err(payload) => error!(
                    core_id,
                    panic = %panic_message(payload.as_ref()),
                    "Worker thread panicked"
                ),
            }
        }

        METRICS
            .dispatcher
            .active_workers
            .sub(self.active_cores.len() as i64);
        info!(
            succeeded = total.succeeded,
            failed = total.failed,
            elapsed = ?start.elapsed(),
            "Dispatcher stopped"
        );
    }

    /// Whether submissions are still accepted
    pub fn is_running(&self) -> bool {
        !self.queue.is_closed()
    }

    /// Cores whose worker loaded successfully
    pub fn active_cores(&self) -> &[usize] {
        &self.active_cores
    }

    /// Requests waiting for a worker
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Whether a bounded queue still has headroom
    pub fn is_healthy(&self) -> bool {
        self.queue.is_healthy()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // A callback may own the last handle; joining would then deadlock.
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.stop()));
        if result.is_err() {
            error!("Dispatcher shutdown panicked during drop");
        }
    }
}
