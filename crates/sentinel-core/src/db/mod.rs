// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database access layer.
//!
//! [`Database`] vends short-lived sessions from a bounded pool of
//! long-lived ones; [`DbSession`] is everything the rest of the service
//! does with a session. The production backend over the Oracle driver
//! lives in [`oracle`]; tests run against an in-memory fake implementing
//! the same traits.
//!
//! Ownership: the pool owns every session handle for the process lifetime.
//! Callers hold a boxed borrow that returns the session on drop; a session
//! tagged for retirement is discarded instead of reused.

pub mod oracle;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::TenantContext;
use crate::error::Result;
use crate::events::{Event, LogRow, StatusUpdate};

/// Pool statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions currently open.
    pub open: u32,
    /// Sessions currently lent out.
    pub busy: u32,
    /// Successful acquires since pool creation.
    pub acquired_total: u64,
    /// Sessions returned since pool creation.
    pub released_total: u64,
    /// Acquire or session errors since pool creation.
    pub error_total: u64,
}

/// One row of `process_live_status`.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatusRecord {
    pub process_id: String,
    pub tenant_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

/// One row of `process_logs` as served by the log query endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntryRecord {
    pub logged_at: DateTime<Utc>,
    pub log_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_duration_us: Option<i64>,
}

/// A bounded session pool.
pub trait Database: Send + Sync {
    /// Acquire a healthy session, blocking up to the configured wait
    /// timeout. Fails with [`crate::ServiceError::PoolExhausted`] when no
    /// session frees up in time and [`crate::ServiceError::PoolClosed`]
    /// after [`Database::close`].
    fn acquire(&self) -> Result<Box<dyn DbSession>>;

    /// Current statistics snapshot.
    fn stats(&self) -> PoolStats;

    /// Drain outstanding sessions best-effort and destroy the pool. After
    /// this, `acquire` fails.
    fn close(&self);
}

/// Operations the service performs on one borrowed session.
///
/// Write operations do not commit on their own; callers group the writes
/// of one unit of work and call [`DbSession::commit`] — except
/// [`DbSession::insert_log_rows`], which commits internally because a bulk
/// flush is its own unit of work.
pub trait DbSession: Send {
    /// Lightweight liveness check.
    fn ping(&mut self) -> Result<()>;

    /// Commit the open transaction. For the listener this is what removes
    /// the in-flight message from the queue.
    fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction (returns an in-flight message to
    /// the queue).
    fn rollback(&mut self) -> Result<()>;

    /// Tag the session so the pool discards it on release.
    fn retire(&mut self);

    /// Whether the session has been tagged for retirement.
    fn is_retired(&self) -> bool;

    /// Dequeue one typed event, waiting up to `wait`. `Ok(None)` is the
    /// expected no-message-in-window outcome, never an error.
    fn dequeue_event(&mut self, wait: Duration) -> Result<Option<Event>>;

    /// Bulk-insert log rows in one round trip and commit. All-or-nothing:
    /// on error no row of the batch is visible.
    fn insert_log_rows(&mut self, rows: &[LogRow]) -> Result<usize>;

    /// Upsert one row of `process_live_status`.
    fn apply_status_update(&mut self, update: &StatusUpdate) -> Result<()>;

    /// Record one sample into `process_metrics`.
    fn record_process_metric(
        &mut self,
        process_id: &str,
        tenant_id: &str,
        metric: &str,
        value: f64,
    ) -> Result<()>;

    /// Mark RUNNING rows without a heartbeat within `stale_after` as
    /// STALLED; returns the number of rows changed.
    fn mark_stalled(&mut self, stale_after: Duration) -> Result<u64>;

    /// Delete terminal status rows finished longer than `older_than` ago;
    /// returns the number of rows deleted.
    fn cleanup_expired(&mut self, older_than: Duration) -> Result<u64>;

    /// Fetch the live status of one process, tenant-scoped through the
    /// guard unless the context bypasses isolation.
    fn query_status(
        &mut self,
        process_id: &str,
        ctx: &TenantContext,
    ) -> Result<Option<ProcessStatusRecord>>;

    /// List most-recent processes visible to the context.
    fn list_processes(
        &mut self,
        ctx: &TenantContext,
        limit: u32,
    ) -> Result<Vec<ProcessStatusRecord>>;

    /// Fetch recent log rows of one process visible to the context.
    fn query_logs(
        &mut self,
        process_id: &str,
        ctx: &TenantContext,
        limit: u32,
    ) -> Result<Vec<LogEntryRecord>>;
}
