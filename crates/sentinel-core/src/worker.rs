// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool.
//!
//! A fixed set of threads drains the task queue. Each worker acquires one
//! pooled session at startup and holds it for its whole life, so steady
//! state pays the database round trip and never pool contention. A session
//! lost to a non-recoverable error is replaced once; a worker that cannot
//! get a session exits and is counted.
//!
//! Tasks are not retried here: retry policy belongs to the database queue
//! and the maintenance tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::db::{Database, DbSession};
use crate::error::{Result, ServiceError};
use crate::events::{LogRow, StatusUpdate, Task, TaskKind};
use crate::flusher::LogFlusher;
use crate::metrics::Metrics;
use crate::task_queue::TaskQueue;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// How long one pop blocks before rechecking the shutdown flag.
    pub task_timeout: Duration,
}

/// Worker statistics.
#[derive(Debug)]
pub struct WorkerStats {
    configured: usize,
    completed: AtomicU64,
    failed: AtomicU64,
    total_duration_ns: AtomicU64,
    failed_workers: AtomicU64,
}

impl WorkerStats {
    fn new(configured: usize) -> Self {
        Self {
            configured,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_duration_ns: AtomicU64::new(0),
            failed_workers: AtomicU64::new(0),
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn total_duration_ns(&self) -> u64 {
        self.total_duration_ns.load(Ordering::Relaxed)
    }

    pub fn failed_workers(&self) -> u64 {
        self.failed_workers.load(Ordering::Relaxed)
    }

    pub fn active_workers(&self) -> usize {
        self.configured
            .saturating_sub(self.failed_workers() as usize)
    }
}

/// Running worker pool.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    /// Spawn the configured workers. All-or-nothing: when any thread fails
    /// to spawn, the shutdown flag is raised, the already-running workers
    /// are joined, and the error is returned.
    pub fn start(
        cfg: WorkerConfig,
        queue: Arc<TaskQueue>,
        db: Arc<dyn Database>,
        flusher: Arc<LogFlusher>,
        metrics: Arc<Metrics>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<WorkerPool> {
        let stats = Arc::new(WorkerStats::new(cfg.workers));
        let mut handles = Vec::with_capacity(cfg.workers);

        for i in 0..cfg.workers {
            let worker = Worker {
                id: i,
                cfg: cfg.clone(),
                queue: Arc::clone(&queue),
                db: Arc::clone(&db),
                flusher: Arc::clone(&flusher),
                metrics: Arc::clone(&metrics),
                shutdown: Arc::clone(&shutdown),
                stats: Arc::clone(&stats),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("sentinel-worker-{i}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::SeqCst);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(ServiceError::Startup(format!(
                        "failed to spawn worker {i}: {e}"
                    )));
                }
            }
        }

        info!(workers = cfg.workers, "worker pool started");
        Ok(WorkerPool { handles, stats })
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Join every worker, giving up at `deadline`. Returns the number of
    /// threads abandoned.
    pub fn join(mut self, deadline: Instant) -> usize {
        let mut abandoned = 0;
        while let Some(handle) = self.handles.pop() {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(25));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                abandoned += 1;
            }
        }
        abandoned
    }
}

struct Worker {
    id: usize,
    cfg: WorkerConfig,
    queue: Arc<TaskQueue>,
    db: Arc<dyn Database>,
    flusher: Arc<LogFlusher>,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    fn run(self) {
        let mut session = match self.db.acquire() {
            Ok(session) => session,
            Err(e) => {
                error!(worker = self.id, error = %e, "worker could not acquire a session");
                self.stats.failed_workers.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        debug!(worker = self.id, "worker session pinned");

        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(task) = self.queue.pop(self.cfg.task_timeout) else {
                continue;
            };
            self.execute(&mut session, task);

            // A session lost to a non-recoverable error is replaced; a
            // worker that cannot replace it exits.
            if session.is_retired() {
                warn!(worker = self.id, "replacing retired session");
                match self.db.acquire() {
                    Ok(fresh) => session = fresh,
                    Err(e) => {
                        error!(worker = self.id, error = %e, "worker lost its session");
                        self.stats.failed_workers.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
        debug!(worker = self.id, "worker exiting");
    }

    fn execute(&self, session: &mut Box<dyn DbSession>, task: Task) {
        let kind_name = task.kind_name();
        self.metrics.worker_tasks_in_progress.inc();
        let started = Instant::now();

        let result = self.run_task(session.as_mut(), &task.kind);
        let elapsed = started.elapsed();

        self.metrics.worker_tasks_in_progress.dec();
        self.metrics.worker_tasks_total.inc();
        self.metrics.worker_task_duration.observe_duration(elapsed);
        self.stats
            .total_duration_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);

        let succeeded = match result {
            Ok(()) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                // Errors never leave the worker loop; log, count, continue.
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = self.id, task = kind_name, error = %e, "task failed");
                let _ = session.rollback();
                false
            }
        };

        if let Some(callback) = task.callback {
            callback(succeeded);
        }
    }

    fn run_task(&self, session: &mut dyn DbSession, kind: &TaskKind) -> Result<()> {
        match kind {
            TaskKind::ProcessEvent(event) => {
                let update = StatusUpdate::from_event(event);
                session.apply_status_update(&update)?;
                session.record_process_metric(
                    &event.process_id,
                    &event.tenant_id,
                    &format!("events_{}", event.event_type.as_str().to_lowercase()),
                    1.0,
                )?;
                self.metrics.db_queries_total.add(2);
                self.flusher.append(LogRow::from_event(event));
                session.commit()?;
            }
            TaskKind::StatusUpdate(update) => {
                session.apply_status_update(update)?;
                self.metrics.db_queries_total.inc();
                session.commit()?;
            }
            TaskKind::HeartbeatCheck { stale_after } => {
                let stalled = session.mark_stalled(*stale_after)?;
                self.metrics.db_queries_total.inc();
                session.commit()?;
                if stalled > 0 {
                    info!(stalled, "processes marked stalled");
                }
            }
            TaskKind::CleanupExpired { older_than } => {
                let deleted = session.cleanup_expired(*older_than)?;
                self.metrics.db_queries_total.inc();
                session.commit()?;
                if deleted > 0 {
                    debug!(deleted, "expired status rows removed");
                }
            }
            TaskKind::LogBatch => {
                // insert_log_rows commits internally; one flush is one
                // unit of work.
                self.flusher.flush(session)?;
                self.metrics.db_queries_total.inc();
            }
            TaskKind::Custom { name, .. } => {
                debug!(worker = self.id, task = %name, "custom task has no handler");
            }
        }
        Ok(())
    }
}
