//! Data-parallel inference over a running dispatcher
//!
//! Splits one large input along the batch dimension, fans the pieces out to
//! every active core and stitches the outputs back together in input order.

use crate::dispatcher::Dispatcher;
use crate::request::{Completion, InferenceRequest, QueuedRequest, RequestId, Timings};
use crate::tensor::Tensor;
use coreloop_common::{CoreLoopError, Result};
use crossbeam::channel;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Pause before retrying when the queue is full of other callers' requests
const FULL_QUEUE_BACKOFF: Duration = Duration::from_millis(1);

/// Per-batch record of where and how long a piece ran
#[derive(Debug, Clone, Copy)]
pub struct BatchStats {
    pub request_id: RequestId,
    pub core_id: usize,
    pub rows: usize,
    pub timings: Timings,
}

/// Result of a data-parallel run
#[derive(Debug)]
pub struct ParallelOutput {
    /// One tensor per model output, batches concatenated in input order
    pub outputs: Vec<Tensor>,
    /// Indexed by batch position
    pub batches: Vec<BatchStats>,
}

/// Splits inputs into batches and runs them across the dispatcher's workers
#[derive(Debug)]
pub struct DataParallel {
    next_id: AtomicU64,
}

impl Default for DataParallel {
    fn default() -> Self {
        Self::new()
    }
}

impl DataParallel {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Request ids are allocated sequentially from `first_id`
    pub fn starting_at(first_id: RequestId) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
        }
    }

    /// Run `input` through `dispatcher` in batches of at most `batch_size` rows
    ///
    /// Blocks until every submitted batch has completed. On a bounded queue the
    /// helper waits for its own batches to drain instead of failing with
    /// `QueueFull`. If any batch fails the call fails with the error of the
    /// earliest failing batch.
    pub fn run(
        &self,
        dispatcher: &Dispatcher,
        input: &Tensor,
        batch_size: usize,
    ) -> Result<ParallelOutput> {
        let start = Instant::now();
        let batches = input.split_batches(batch_size)?;
        if batches.is_empty() {
            return Err(CoreLoopError::invalid_input("Input has no rows to process"));
        }

        let num_batches = batches.len();
        let first_id = self.next_id.fetch_add(num_batches as u64, Ordering::SeqCst);
        debug!(
            rows = input.batch_len(),
            batch_size,
            num_batches,
            first_id,
            "Dispatching data-parallel run"
        );

        let (tx, rx) = channel::unbounded::<(usize, Completion)>();
        let mut rows = Vec::with_capacity(num_batches);
        let mut completions: Vec<Option<Completion>> = (0..num_batches).map(|_| None).collect();
        let mut in_flight = 0usize;
        let mut submit_error = None;

        'batches: for (position, batch) in batches.into_iter().enumerate() {
            rows.push(batch.batch_len());
            let tx = tx.clone();
            let mut queued = QueuedRequest::new(
                InferenceRequest::single(first_id + position as u64, batch),
                Box::new(move |completion: Completion| {
                    let _ = tx.send((position, completion));
                }),
            );

            loop {
                match dispatcher.submit_queued(queued) {
                    Ok(()) => {
                        in_flight += 1;
                        break;
                    }
                    Err((CoreLoopError::QueueFull(_), rejected)) => {
                        // Bounded queue: let one of our batches finish, then retry.
                        if in_flight > 0 {
                            if let Ok((done, completion)) = rx.recv() {
                                completions[done] = Some(completion);
                                in_flight -= 1;
                            }
                        } else {
                            thread::sleep(FULL_QUEUE_BACKOFF);
                        }
                        queued = rejected;
                        queued.enqueued_at = Instant::now();
                    }
                    Err((e, _)) => {
                        submit_error = Some(e);
                        break 'batches;
                    }
                }
            }
        }
        drop(tx);

        // Wait for everything already in flight, even when submission failed.
        for (position, completion) in rx.iter() {
            completions[position] = Some(completion);
        }

        if let Some(e) = submit_error {
            return Err(e);
        }

        let mut per_output: Vec<Vec<Tensor>> = Vec::new();
        let mut stats = Vec::with_capacity(num_batches);

        for (position, completion) in completions.into_iter().enumerate() {
            let completion = completion.ok_or_else(|| {
                CoreLoopError::internal(format!("Batch {} completed without a result", position))
            })?;
            stats.push(BatchStats {
                request_id: completion.request_id,
                core_id: completion.core_id,
                rows: rows[position],
                timings: completion.timings,
            });

            let outputs = completion.result?;
            if per_output.is_empty() {
                per_output = outputs.iter().map(|_| Vec::with_capacity(num_batches)).collect();
            } else if outputs.len() != per_output.len() {
                return Err(CoreLoopError::inference(format!(
                    "Batch {} returned {} outputs, expected {}",
                    position,
                    outputs.len(),
                    per_output.len()
                )));
            }
            for (slot, tensor) in per_output.iter_mut().zip(outputs) {
                slot.push(tensor);
            }
        }

        let outputs = per_output
            .iter()
            .map(|parts| Tensor::concat(parts))
            .collect::<Result<Vec<_>>>()?;

        info!(
            rows = input.batch_len(),
            num_batches,
            elapsed = ?start.elapsed(),
            "Data-parallel run complete"
        );

        Ok(ParallelOutput {
            outputs,
            batches: stats,
        })
    }
}
