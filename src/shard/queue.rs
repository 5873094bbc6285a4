//! Bounded FIFO task queue feeding one shard thread.
//!
//! External producers block while the queue is at capacity, which is the
//! engine's backpressure mechanism. Internal wake-ups (the blocking
//! controller re-arming a transaction) bypass the bound: the shard thread
//! is the one draining the queue, so letting it block on its own push
//! would deadlock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::EngineShard;

pub(crate) enum ShardTask {
    Run(Box<dyn FnOnce(&mut EngineShard) + Send>),
    Stop,
}

pub(crate) struct TaskQueue {
    inner: Mutex<VecDeque<ShardTask>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn push(&self, task: ShardTask) {
        let mut q = self.inner.lock();
        while q.len() >= self.capacity {
            self.not_full.wait(&mut q);
        }
        q.push_back(task);
        self.not_empty.notify_one();
    }

    fn push_unbounded(&self, task: ShardTask) {
        let mut q = self.inner.lock();
        q.push_back(task);
        self.not_empty.notify_one();
    }

    /// Pops the next task, waiting at most `timeout`. `None` signals the
    /// shard loop to run a heartbeat tick.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<ShardTask> {
        let deadline = Instant::now() + timeout;
        let mut q = self.inner.lock();
        loop {
            if let Some(task) = q.pop_front() {
                self.not_full.notify_one();
                return Some(task);
            }
            if self.not_empty.wait_until(&mut q, deadline).timed_out() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Cloneable producer half of a shard's task queue.
#[derive(Clone)]
pub struct TaskSender {
    queue: Arc<TaskQueue>,
}

impl TaskSender {
    pub(crate) fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }

    /// Enqueues a unit of work; FIFO relative to other tasks. Blocks while
    /// the queue is full.
    pub fn add_task(&self, f: impl FnOnce(&mut EngineShard) + Send + 'static) {
        self.queue.push(ShardTask::Run(Box::new(f)));
    }

    /// Queue-bound-exempt enqueue for shard-internal wake-ups.
    pub(crate) fn add_task_internal(&self, f: impl FnOnce(&mut EngineShard) + Send + 'static) {
        self.queue.push_unbounded(ShardTask::Run(Box::new(f)));
    }

    pub(crate) fn stop(&self) {
        self.queue.push_unbounded(ShardTask::Stop);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
