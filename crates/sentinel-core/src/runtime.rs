// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Composition root.
//!
//! Owns the start order, the maintenance scheduler, the process-wide
//! shutdown flag the signal handlers flip, and the documented shutdown
//! order: listener first (no new events), then the HTTP acceptor, then the
//! workers, then a final best-effort flush, and the pool last. Joins get a
//! 10 second soft budget; threads still running after it are abandoned.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::db::Database;
use crate::dispatch::EventDispatcher;
use crate::error::Result;
use crate::events::{Task, TaskKind};
use crate::flusher::LogFlusher;
use crate::http::{AppState, HttpConfig, HttpServer};
use crate::listener::{ListenerConfig, QueueListener};
use crate::metrics::Metrics;
use crate::task_queue::TaskQueue;
use crate::worker::{WorkerConfig, WorkerPool};

/// Soft budget for joining every thread at shutdown.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// Maintenance scheduler tick.
const SCHEDULER_TICK: Duration = Duration::from_millis(200);

// Signal handlers are restricted to async-signal-safe operations; an
// atomic store qualifies, so this static is the only process-global.
static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_signal(_signum: i32) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that request graceful shutdown. No
/// other signals are handled.
pub fn install_signal_handlers() -> std::result::Result<(), nix::Error> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGINT, &action)?;
        signal::sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

/// Whether a shutdown signal has arrived.
pub fn running() -> bool {
    RUNNING.load(Ordering::SeqCst)
}

/// The assembled service.
pub struct Runtime {
    shutdown: Arc<AtomicBool>,
    db: Arc<dyn Database>,
    flusher: Arc<LogFlusher>,
    queue: Arc<TaskQueue>,
    listener: QueueListener,
    http: HttpServer,
    workers: WorkerPool,
    scheduler: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Start every component. Startup is fail-fast: any component that
    /// cannot start tears the already-started ones down through the shared
    /// shutdown flag and the error propagates to the caller.
    pub fn start(
        cfg: &Config,
        db: Arc<dyn Database>,
        metrics: Arc<Metrics>,
        authenticator: Authenticator,
    ) -> Result<Runtime> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flusher = Arc::new(LogFlusher::new(cfg.log_batch_size));
        let queue = Arc::new(TaskQueue::new(cfg.task_queue_capacity));

        let workers = WorkerPool::start(
            WorkerConfig {
                workers: cfg.worker_threads,
                task_timeout: cfg.task_timeout,
            },
            Arc::clone(&queue),
            Arc::clone(&db),
            Arc::clone(&flusher),
            Arc::clone(&metrics),
            Arc::clone(&shutdown),
        )?;

        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&metrics),
        ));
        let listener = QueueListener::start(
            ListenerConfig {
                wait: cfg.dequeue_wait,
                ..ListenerConfig::default()
            },
            Arc::clone(&db),
            dispatcher,
            Arc::clone(&metrics),
            Arc::clone(&shutdown),
        )
        .map_err(|e| {
            shutdown.store(true, Ordering::SeqCst);
            crate::ServiceError::Startup(format!("spawn listener: {e}"))
        })?;

        let state = Arc::new(AppState {
            db: Arc::clone(&db),
            metrics: Arc::clone(&metrics),
            authenticator,
            default_query_limit: 100,
            max_query_limit: 1000,
        });
        let http = HttpServer::start(
            HttpConfig::new(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                cfg.http_port,
            )),
            state,
            Arc::clone(&shutdown),
        )
        .inspect_err(|_| shutdown.store(true, Ordering::SeqCst))?;

        let scheduler = spawn_scheduler(cfg, &shutdown, &queue, &flusher, &db, &metrics)
            .map_err(|e| {
                shutdown.store(true, Ordering::SeqCst);
                crate::ServiceError::Startup(format!("spawn scheduler: {e}"))
            })?;

        info!("runtime started");
        Ok(Runtime {
            shutdown,
            db,
            flusher,
            queue,
            listener,
            http,
            workers,
            scheduler: Some(scheduler),
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http.local_addr()
    }

    /// Graceful shutdown in the documented order.
    pub fn shutdown(mut self) {
        info!("shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + SHUTDOWN_BUDGET;

        if !self.listener.join(deadline) {
            warn!("listener abandoned");
        }
        if let Some(scheduler) = self.scheduler.take() {
            let _ = scheduler.join();
        }
        if !self.http.join(deadline) {
            warn!("http acceptor abandoned");
        }
        let abandoned = self.workers.join(deadline);
        if abandoned > 0 {
            warn!(abandoned, "worker threads abandoned");
        }

        // Whatever the workers buffered but never flushed goes out in one
        // last batch, best-effort.
        if !self.flusher.is_empty() {
            match self.db.acquire() {
                Ok(mut session) => {
                    let _ = self.flusher.flush(session.as_mut());
                }
                Err(e) => warn!(error = %e, "final flush skipped"),
            }
        }
        let pending = self.queue.len();
        if pending > 0 {
            warn!(pending, "tasks left unexecuted at shutdown");
        }

        self.db.close();
        info!("shutdown complete");
    }
}

/// The scheduler drives the periodic work: gauge refresh, threshold and
/// interval flushes, heartbeat staleness checks, and retention cleanup.
fn spawn_scheduler(
    cfg: &Config,
    shutdown: &Arc<AtomicBool>,
    queue: &Arc<TaskQueue>,
    flusher: &Arc<LogFlusher>,
    db: &Arc<dyn Database>,
    metrics: &Arc<Metrics>,
) -> std::io::Result<JoinHandle<()>> {
    let shutdown = Arc::clone(shutdown);
    let queue = Arc::clone(queue);
    let flusher = Arc::clone(flusher);
    let db = Arc::clone(db);
    let metrics = Arc::clone(metrics);
    let flush_interval = cfg.flush_interval;
    let maintenance_interval = cfg.maintenance_interval;
    let heartbeat_stale_after = cfg.heartbeat_stale_after;
    let status_retention = cfg.status_retention;

    std::thread::Builder::new()
        .name("sentinel-scheduler".to_string())
        .spawn(move || {
            let mut last_flush = Instant::now();
            let mut last_maintenance = Instant::now();

            while !shutdown.load(Ordering::SeqCst) {
                std::thread::sleep(SCHEDULER_TICK);

                let pool = db.stats();
                metrics.pool_open_connections.set(i64::from(pool.open));
                metrics.pool_busy_connections.set(i64::from(pool.busy));
                metrics.queue_depth.set(queue.len() as i64);

                let due = last_flush.elapsed() >= flush_interval && !flusher.is_empty();
                if flusher.should_flush() || due {
                    // A full queue just postpones the flush one tick.
                    if queue.push(Task::new(TaskKind::LogBatch)).is_ok() {
                        last_flush = Instant::now();
                    }
                }

                if last_maintenance.elapsed() >= maintenance_interval {
                    let _ = queue.push(Task::new(TaskKind::HeartbeatCheck {
                        stale_after: heartbeat_stale_after,
                    }));
                    let _ = queue.push(Task::new(TaskKind::CleanupExpired {
                        older_than: status_retention,
                    }));
                    last_maintenance = Instant::now();
                }
            }
        })
}
