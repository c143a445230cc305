//! Runs one unit of work per tile, sequentially or on a fixed pool of workers.

use crate::chunking::Tile;
use crate::error::{ClassifyError, Result, TileError};
use crate::pipeline::TileOutput;
use log::{debug, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

/// Shared stop flag. Workers check it before pulling the next tile.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a failed tile does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep going; failures are reported at the end.
    #[default]
    BestEffort,
    /// Stop handing out tiles after the first failure.
    FailFast,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    concurrency: usize,
    failure_policy: FailurePolicy,
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(ClassifyError::InvalidArgument(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            concurrency,
            failure_policy: FailurePolicy::default(),
            cancel: CancelToken::new(),
        })
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Process every tile and return one output per tile, ordered by index.
    ///
    /// `init` builds the worker-local state (e.g. open source handles) once per
    /// worker; the state is dropped when that worker runs out of tiles. Tiles
    /// left unprocessed because of cancellation come back as
    /// [`TileError::Cancelled`].
    pub fn run<S, I, F>(&self, tiles: &[Tile], init: I, work: F) -> Result<Vec<TileOutput>>
    where
        I: Fn() -> S + Sync,
        F: Fn(&mut S, usize, &Tile) -> TileOutput + Sync,
    {
        let queue = AtomicUsize::new(0);
        let workers = self.concurrency.min(tiles.len().max(1));

        let finished: Vec<TileOutput> = if workers == 1 {
            debug!("Running {} tiles sequentially", tiles.len());
            let mut state = init();
            self.drain(&queue, tiles, &mut state, &work)
        } else {
            info!("Running {} tiles on {} workers", tiles.len(), workers);
            self.run_pool(workers, &queue, tiles, &init, &work)?
        };

        let mut slots: Vec<Option<TileOutput>> = (0..tiles.len()).map(|_| None).collect();
        for output in finished {
            let index = output.index;
            slots[index] = Some(output);
        }

        let outputs: Vec<TileOutput> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.unwrap_or_else(|| TileOutput::failed(index, tiles[index], TileError::Cancelled)))
            .collect();

        if self.cancel.is_cancelled() {
            let skipped = outputs
                .iter()
                .filter(|o| matches!(o.result, Err(TileError::Cancelled)))
                .count();
            warn!("Run cancelled: {} tiles were not processed", skipped);
        }
        Ok(outputs)
    }

    fn run_pool<S, I, F>(
        &self,
        workers: usize,
        queue: &AtomicUsize,
        tiles: &[Tile],
        init: &I,
        work: &F,
    ) -> Result<Vec<TileOutput>>
    where
        I: Fn() -> S + Sync,
        F: Fn(&mut S, usize, &Tile) -> TileOutput + Sync,
    {
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tile-worker-{}", i))
            .exit_handler(move |_| {
                let _ = exit_tx.send(());
            })
            .build()?;

        let per_worker: Vec<Vec<TileOutput>> = pool.broadcast(|ctx| {
            let mut state = init();
            let done = self.drain(queue, tiles, &mut state, work);
            debug!("Worker {} finished {} tiles", ctx.index(), done.len());
            done
        });

        // Wait for every worker thread to exit before handing control back
        drop(pool);
        for _ in 0..workers {
            if exit_rx.recv().is_err() {
                break;
            }
        }

        Ok(per_worker.into_iter().flatten().collect())
    }

    /// Worker loop: pull the next index until the queue is empty or the run is cancelled.
    fn drain<S, F>(&self, queue: &AtomicUsize, tiles: &[Tile], state: &mut S, work: &F) -> Vec<TileOutput>
    where
        F: Fn(&mut S, usize, &Tile) -> TileOutput,
    {
        let mut done = Vec::new();
        while !self.cancel.is_cancelled() {
            let index = queue.fetch_add(1, Ordering::SeqCst);
            let Some(tile) = tiles.get(index) else {
                break;
            };

            let output = panic::catch_unwind(AssertUnwindSafe(|| work(state, index, tile)))
                .unwrap_or_else(|payload| {
                    TileOutput::failed(index, *tile, TileError::Prediction(panic_message(payload)))
                });

            if let Err(e) = &output.result {
                warn!("Tile {} ({}) failed: {}", index, tile, e);
                if self.failure_policy == FailurePolicy::FailFast {
                    warn!("Fail-fast policy: cancelling remaining tiles");
                    self.cancel.cancel();
                }
            }
            done.push(output);
        }
        done
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {}", s)
    } else {
        "worker panicked".to_string()
    }
}
