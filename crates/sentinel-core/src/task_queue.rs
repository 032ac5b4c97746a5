// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded in-memory task queue between the listener and the worker pool.
//!
//! A fixed-capacity FIFO behind one mutex and one condition variable.
//! Multiple producers and consumers; `push` never blocks, `pop` blocks
//! with a timeout. Priority lives in the database queue, not here.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::events::Task;

/// Returned by [`TaskQueue::push`] when the queue is at capacity; carries
/// the task back so the submitter keeps ownership.
#[derive(Debug)]
pub struct QueueFull(pub Task);

/// Bounded MPMC task queue.
pub struct TaskQueue {
    inner: Mutex<VecDeque<Task>>,
    not_empty: Condvar,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue a task. Fails immediately when at capacity.
    pub fn push(&self, task: Task) -> Result<(), QueueFull> {
        let mut queue = self.inner.lock().expect("task queue mutex poisoned");
        if queue.len() >= self.capacity {
            return Err(QueueFull(task));
        }
        queue.push_back(task);
        drop(queue);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the oldest task, blocking up to `timeout`. `None` means the
    /// window elapsed without a task becoming available.
    pub fn pop(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.lock().expect("task queue mutex poisoned");
        loop {
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self
                .not_empty
                .wait_timeout(queue, remaining)
                .expect("task queue mutex poisoned");
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
    }

    /// Snapshot of the current depth.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("task queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
