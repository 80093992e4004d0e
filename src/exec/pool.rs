//! Pool of replay workers sharing one execution lock and one result queue.

use super::task::TxTask;
use super::worker::{PoolContext, Worker, WorkerError};
use crossbeam::channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Result queue slots per worker.
const RESULTS_PER_WORKER: usize = 4;

/// Decrements the outstanding-worker counter when a worker thread ends,
/// however it ends.
struct Completion(Arc<AtomicUsize>);

impl Drop for Completion {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct WorkersPool {
    workers: Vec<Arc<Mutex<Worker>>>,
    results: Receiver<Box<TxTask>>,
    handles: Vec<JoinHandle<()>>,
    outstanding: Arc<AtomicUsize>,
    failure: Arc<Mutex<Option<WorkerError>>>,
    ctx: PoolContext,
}

impl WorkersPool {
    /// Creates `worker_count` workers. With more than one worker each runs
    /// on its own thread; a single worker is driven by the caller through
    /// [`WorkersPool::worker`].
    pub fn new(worker_count: usize, ctx: PoolContext) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, results) = bounded(RESULTS_PER_WORKER * worker_count);
        let workers: Vec<_> = (0..worker_count)
            .map(|id| Arc::new(Mutex::new(Worker::new(id, ctx.clone(), sender.clone()))))
            .collect();
        drop(sender);

        let outstanding = Arc::new(AtomicUsize::new(0));
        let failure = Arc::new(Mutex::new(None));
        let mut handles = Vec::new();
        if worker_count > 1 {
            for worker in &workers {
                let worker = worker.clone();
                let id = worker.lock().id();
                let completion = Completion(outstanding.clone());
                outstanding.fetch_add(1, Ordering::AcqRel);
                let failure = failure.clone();
                let scheduler = ctx.scheduler.clone();

                let spawned = thread::Builder::new()
                    .name(format!("replay-worker-{id}"))
                    .spawn(move || {
                        let _completion = completion;
                        if let Err(err) = worker.lock().run() {
                            failure.lock().get_or_insert(err);
                            // Wake up the other workers and the consumer.
                            scheduler.finish();
                        }
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => error!(worker = id, %err, "cannot spawn worker thread"),
                }
            }
            debug!(workers = handles.len(), "spawned replay workers");
        }

        Self {
            workers,
            results,
            handles,
            outstanding,
            failure,
            ctx,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Whether workers run on their own threads.
    pub fn is_threaded(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn worker(&self, index: usize) -> Option<&Arc<Mutex<Worker>>> {
        self.workers.get(index)
    }

    /// Queue the workers send executed tasks to.
    pub fn results(&self) -> &Receiver<Box<TxTask>> {
        &self.results
    }

    /// Number of worker threads that have not ended yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Rolls back the transactions of every worker. Workers are idle until
    /// their next task.
    pub fn clear(&self) {
        for worker in &self.workers {
            worker.lock().reset_tx(None, None);
        }
    }

    /// Finishes the scheduler, joins every worker thread and returns the
    /// first fatal error.
    ///
    /// Results still queued at this point are discarded.
    pub fn wait(&mut self) -> Result<(), WorkerError> {
        self.join_all();
        match self.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn join_all(&mut self) {
        self.ctx.scheduler.finish();
        for handle in self.handles.drain(..) {
            // A worker blocked on a full result queue never sees the
            // scheduler finish.
            while !handle.is_finished() {
                while self.results.try_recv().is_ok() {}
                thread::yield_now();
            }
            if handle.join().is_err() {
                error!("replay worker panicked");
            }
        }
    }
}

impl Drop for WorkersPool {
    fn drop(&mut self) {
        self.join_all();
    }
}
