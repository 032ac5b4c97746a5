// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AQ listener.
//!
//! One long-running thread borrows a session per iteration, dequeues at
//! most one typed message under visibility-on-commit, hands it to the
//! handler, and commits. The commit is what removes the message from the
//! queue; a failed handler or commit rolls back, so the message is
//! redelivered. An empty wait window is a no-op, every other dequeue
//! failure counts, sleeps, and continues.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::dispatch::EventHandler;
use crate::error::ServiceError;
use crate::metrics::Metrics;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Dequeue wait per iteration.
    pub wait: Duration,
    /// Pause after a dequeue or session failure.
    pub error_backoff: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Listener statistics.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub errors: AtomicU64,
}

/// Handle to the running listener thread.
pub struct QueueListener {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    stats: Arc<ListenerStats>,
}

impl QueueListener {
    /// Spawn the listener thread.
    pub fn start(
        cfg: ListenerConfig,
        db: Arc<dyn Database>,
        handler: Arc<dyn EventHandler>,
        metrics: Arc<Metrics>,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<QueueListener> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ListenerStats::default());

        let loop_running = Arc::clone(&running);
        let loop_stats = Arc::clone(&stats);
        let handle = std::thread::Builder::new()
            .name("sentinel-listener".to_string())
            .spawn(move || {
                run_loop(cfg, db, handler, metrics, shutdown, loop_running, loop_stats);
            })?;

        Ok(QueueListener {
            handle: Some(handle),
            running,
            stats,
        })
    }

    /// Ask the loop to exit; it notices between iterations, so worst-case
    /// latency is the dequeue wait plus the error backoff.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Join the listener thread, abandoning it past `deadline`. Returns
    /// whether the thread actually exited.
    pub fn join(mut self, deadline: Instant) -> bool {
        self.stop();
        let Some(handle) = self.handle.take() else {
            return true;
        };
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(25));
        }
        if handle.is_finished() {
            let _ = handle.join();
            true
        } else {
            warn!("listener did not exit within the shutdown budget");
            false
        }
    }
}

fn run_loop(
    cfg: ListenerConfig,
    db: Arc<dyn Database>,
    handler: Arc<dyn EventHandler>,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<ListenerStats>,
) {
    info!(wait = ?cfg.wait, "listener started");

    while running.load(Ordering::SeqCst) && !shutdown.load(Ordering::SeqCst) {
        // One borrowed session per dequeue cycle.
        let mut session = match db.acquire() {
            Ok(session) => session,
            Err(ServiceError::PoolClosed) => break,
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "listener could not borrow a session");
                std::thread::sleep(cfg.error_backoff);
                continue;
            }
        };

        match session.dequeue_event(cfg.wait) {
            // No message within the wait window: the expected idle path.
            Ok(None) => continue,
            Ok(Some(event)) => {
                stats.received.fetch_add(1, Ordering::Relaxed);
                metrics.queue_events_received_total.inc();
                let event_id = event.event_id.clone();

                match handler.handle(event) {
                    Ok(()) => match session.commit() {
                        Ok(()) => {
                            stats.processed.fetch_add(1, Ordering::Relaxed);
                            metrics.queue_events_processed_total.inc();
                        }
                        Err(e) => {
                            // The message stays on the queue and will be
                            // redelivered; handlers are idempotent on
                            // event_id.
                            stats.errors.fetch_add(1, Ordering::Relaxed);
                            metrics.queue_events_failed_total.inc();
                            error!(event_id = %event_id, error = %e, "dequeue commit failed");
                            std::thread::sleep(cfg.error_backoff);
                        }
                    },
                    Err(e) => {
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        metrics.queue_events_failed_total.inc();
                        warn!(event_id = %event_id, error = %e, "handler refused event");
                        if let Err(e) = session.rollback() {
                            debug!(error = %e, "rollback after refused event failed");
                        }
                        std::thread::sleep(cfg.error_backoff);
                    }
                }
            }
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dequeue failed");
                std::thread::sleep(cfg.error_backoff);
            }
        }
    }

    info!("listener stopped");
}
