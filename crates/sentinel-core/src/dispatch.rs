// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event dispatch: the listener's handler.
//!
//! Turns a dequeued lifecycle event into a worker task. Duplicate
//! deliveries of the same `event_id` (the queue is at-least-once across
//! restarts and commit failures) are dropped here, which keeps the
//! downstream handling idempotent within one process; the status MERGE is
//! idempotent on its own either way.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{Result, ServiceError};
use crate::events::{Event, Task, TaskKind};
use crate::metrics::Metrics;
use crate::task_queue::{QueueFull, TaskQueue};

/// How many recently seen event ids are remembered for deduplication.
const DEDUPE_WINDOW: usize = 4096;

/// Handler invoked by the listener for every dequeued event.
///
/// An `Err` return makes the listener roll back instead of committing, so
/// the message returns to the queue and is redelivered (until the queue's
/// own retry limit moves it to the dead-letter queue).
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: Event) -> Result<()>;
}

/// Default handler: validate, dedupe, enqueue a `ProcessEvent` task.
pub struct EventDispatcher {
    queue: Arc<TaskQueue>,
    metrics: Arc<Metrics>,
    seen: Mutex<SeenEvents>,
}

struct SeenEvents {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl EventDispatcher {
    pub fn new(queue: Arc<TaskQueue>, metrics: Arc<Metrics>) -> Self {
        Self {
            queue,
            metrics,
            seen: Mutex::new(SeenEvents {
                order: VecDeque::with_capacity(DEDUPE_WINDOW),
                ids: HashSet::with_capacity(DEDUPE_WINDOW),
            }),
        }
    }

    /// Record an id; returns false when it was already in the window.
    fn first_sighting(&self, event_id: &str) -> bool {
        let mut seen = self.seen.lock().expect("dedupe mutex poisoned");
        if seen.ids.contains(event_id) {
            return false;
        }
        if seen.order.len() == DEDUPE_WINDOW {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        seen.order.push_back(event_id.to_string());
        seen.ids.insert(event_id.to_string());
        true
    }
}

impl EventHandler for EventDispatcher {
    fn handle(&self, event: Event) -> Result<()> {
        if let Err(reason) = event.validate() {
            // Malformed messages are dropped by committing them away; the
            // producer contract was already broken.
            warn!(event_id = %event.event_id, reason, "dropping malformed event");
            self.metrics.queue_events_failed_total.inc();
            return Ok(());
        }

        if !self.first_sighting(&event.event_id) {
            debug!(event_id = %event.event_id, "duplicate delivery dropped");
            return Ok(());
        }

        match self.queue.push(Task::new(TaskKind::ProcessEvent(event))) {
            Ok(()) => Ok(()),
            Err(QueueFull(task)) => {
                // Refusing the event keeps it on the database queue; it
                // will be redelivered once there is room again.
                warn!(task = task.kind_name(), "task queue full, refusing event");
                if let TaskKind::ProcessEvent(event) = task.kind {
                    let mut seen = self.seen.lock().expect("dedupe mutex poisoned");
                    seen.ids.remove(&event.event_id);
                    seen.order.retain(|id| id != &event.event_id);
                }
                Err(ServiceError::QueueFull)
            }
        }
    }
}
