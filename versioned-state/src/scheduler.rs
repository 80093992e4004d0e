//! Scheduler handing tasks to execution workers.
//!
//! Tasks are kept in a min-heap by global sequence number so that the lowest
//! outstanding task is always handed out first. Pulling blocks until a task is
//! available or the scheduler is finished, which is the only way worker loops
//! terminate.

use crate::types::TxNum;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Unit of work handed out by the [`Scheduler`].
pub trait Task: Send {
    /// Global sequence number, used for ordering.
    fn sequence(&self) -> TxNum;

    /// Clears every result field so the task can be executed again.
    fn reset(&mut self);
}

struct Queued<T>(Box<T>);

impl<T: Task> PartialEq for Queued<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence() == other.0.sequence()
    }
}

impl<T: Task> Eq for Queued<T> {}

impl<T: Task> PartialOrd for Queued<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T: Task> Ord for Queued<T> {
    // Reversed so that the max-heap pops the lowest sequence number.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.sequence().cmp(&self.0.sequence())
    }
}

struct Queue<T> {
    heap: BinaryHeap<Queued<T>>,
    finished: bool,
}

/// Scheduler state for coordinating workers.
pub struct Scheduler<T> {
    queue: Mutex<Queue<T>>,
    receive_work: Condvar,
    /// Tasks handed out so far, including re-executions.
    scheduled: AtomicUsize,
    /// Tasks queued again after their first execution.
    repeated: AtomicUsize,
}

impl<T: Task> Scheduler<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                finished: false,
            }),
            receive_work: Condvar::new(),
            scheduled: AtomicUsize::new(0),
            repeated: AtomicUsize::new(0),
        })
    }

    /// Queues a task for its first execution.
    pub fn add_work(&self, mut task: Box<T>) {
        task.reset();
        let mut queue = self.queue.lock();
        queue.heap.push(Queued(task));
        drop(queue);
        self.receive_work.notify_one();
    }

    /// Queues a task again after a conflict or a stale execution.
    pub fn repeat_work(&self, task: Box<T>) {
        self.repeated.fetch_add(1, Ordering::Relaxed);
        self.add_work(task);
    }

    /// Pulls the next task, blocking until one is available.
    ///
    /// Returns `None` once the scheduler is finished and drained; every task
    /// is handed to exactly one caller.
    pub fn schedule(&self) -> Option<Box<T>> {
        let mut queue = self.queue.lock();
        while !queue.finished && queue.heap.is_empty() {
            self.receive_work.wait(&mut queue);
        }
        let task = queue.heap.pop().map(|Queued(task)| task);
        if task.is_some() {
            self.scheduled.fetch_add(1, Ordering::Relaxed);
        }
        task
    }

    /// Non-blocking variant of [`Scheduler::schedule`].
    pub fn try_schedule(&self) -> Option<Box<T>> {
        let task = self.queue.lock().heap.pop().map(|Queued(task)| task);
        if task.is_some() {
            self.scheduled.fetch_add(1, Ordering::Relaxed);
        }
        task
    }

    /// Signals exhaustion: blocked and future pulls return `None` once the
    /// queue is empty.
    pub fn finish(&self) {
        self.queue.lock().finished = true;
        self.receive_work.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.queue.lock().finished
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().heap.len()
    }

    /// Gets statistics about scheduling progress.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.queue_len(),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            repeated: self.repeated.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about scheduler state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub scheduled: usize,
    pub repeated: usize,
}
