// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Oracle backend: session pool, AQ dequeue, array-DML log insertion, and
//! the tenant-scoped queries.
//!
//! Raw driver handles never leave this module. The driver's session pool
//! carries the health machinery (ping after idle, max session lifetime,
//! timed-wait acquisition); this wrapper adds the service's statistics and
//! the retire-on-release tagging for sessions that hit non-recoverable
//! errors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use oracle::aq::{self, DeqNavigation, Visibility};
use oracle::conn::CloseMode as ConnCloseMode;
use oracle::pool::{CloseMode as PoolCloseMode, GetMode, Pool, PoolBuilder, PoolType};
use oracle::sql_type::{Object, ObjectType, ToSql};
use oracle::Connection;
use tracing::{debug, warn};

use crate::auth::TenantContext;
use crate::config::{PoolConfig, PoolGetMode};
use crate::db::{Database, DbSession, LogEntryRecord, PoolStats, ProcessStatusRecord};
use crate::error::{Result, ServiceError};
use crate::events::{Event, EventType, LogRow, StatusUpdate};
use crate::tenant;

/// Object type carried by the queue payload.
pub const EVENT_OBJECT_TYPE: &str = "SENTINEL_EVENT_T";

/// ORA codes after which a session is no longer usable.
const SESSION_DEAD_CODES: [i32; 8] = [28, 1012, 3113, 3114, 3135, 12541, 12571, 25408];

/// ORA-25228: timeout or end-of-fetch during message dequeue.
const DEQUEUE_TIMEOUT_CODE: i32 = 25228;

fn is_session_dead(err: &oracle::Error) -> bool {
    match err.oci_code() {
        Some(code) => SESSION_DEAD_CODES.contains(&code),
        None => false,
    }
}

fn is_pool_timeout(err: &oracle::Error) -> bool {
    // ORA-24457/24459: OCISessionGet timed out waiting for the pool.
    matches!(err.oci_code(), Some(24457) | Some(24459))
}

fn is_dequeue_timeout(err: &oracle::Error) -> bool {
    err.oci_code() == Some(DEQUEUE_TIMEOUT_CODE)
}

/// Translate a driver error. `recoverable` means the session survives the
/// error; the driver's own recoverability flag is honored on top of the
/// known session-fatal codes.
/// Same mapping as [`OracleSession::check`], but over the disjoint
/// `counters`/`retired` fields so it can be called while another field
/// (e.g. `conn`) is separately borrowed.
fn check_result<T>(
    counters: &Counters,
    retired: &mut bool,
    operation: &'static str,
    result: std::result::Result<T, oracle::Error>,
) -> Result<T> {
    match result {
        Ok(v) => Ok(v),
        Err(e) => {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            let e = classify(operation, e);
            if !e.is_recoverable() {
                *retired = true;
            }
            Err(e)
        }
    }
}

fn classify(operation: &'static str, err: oracle::Error) -> ServiceError {
    let recoverable = if is_session_dead(&err) {
        err.db_error().map(|d| d.is_recoverable()).unwrap_or(false)
    } else {
        true
    };
    ServiceError::Database {
        operation,
        details: err.to_string(),
        recoverable,
    }
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    errors: AtomicU64,
}

/// Bounded homogeneous session pool over the wallet-authenticated driver
/// context.
pub struct OracleDatabase {
    pool: Pool,
    queue_name: String,
    counters: Arc<Counters>,
    closed: AtomicBool,
}

impl OracleDatabase {
    /// Create the pool. The connect string is a TNS alias resolved through
    /// the wallet directory (`TNS_ADMIN`); an empty username switches to
    /// external authentication against the wallet's credential store.
    pub fn connect(
        username: &str,
        password: &str,
        connect_string: &str,
        cfg: &PoolConfig,
        queue_name: &str,
    ) -> Result<Self> {
        let get_mode = match cfg.get_mode {
            PoolGetMode::Wait => GetMode::Wait,
            PoolGetMode::NoWait => GetMode::NoWait,
            PoolGetMode::TimedWait => GetMode::TimedWait(cfg.wait_timeout),
            PoolGetMode::ForceGet => GetMode::ForceGet,
        };
        let mut builder = PoolBuilder::new(username, password, connect_string);
        builder
            .min_connections(cfg.min_sessions)
            .max_connections(cfg.max_sessions)
            .connection_increment(cfg.session_increment)
            .get_mode(get_mode);
        builder
            .ping_interval(Some(cfg.ping_interval))
            .map_err(|e| classify("pool-create", e))?;
        builder
            .max_lifetime_connection(cfg.max_lifetime)
            .map_err(|e| classify("pool-create", e))?;
        if username.is_empty() {
            // External auth requires a heterogeneous pool; sessions still
            // share the single wallet identity.
            builder.pool_type(PoolType::Heterogeneous);
            builder.external_auth(true);
        } else {
            builder.pool_type(PoolType::Homogeneous);
        }

        let pool = builder.build().map_err(|e| classify("pool-create", e))?;
        debug!(
            min = cfg.min_sessions,
            max = cfg.max_sessions,
            "session pool created"
        );

        Ok(Self {
            pool,
            queue_name: queue_name.to_string(),
            counters: Arc::new(Counters::default()),
            closed: AtomicBool::new(false),
        })
    }
}

impl Database for OracleDatabase {
    fn acquire(&self) -> Result<Box<dyn DbSession>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServiceError::PoolClosed);
        }
        match self.pool.get() {
            Ok(conn) => {
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                Ok(Box::new(OracleSession {
                    conn,
                    queue_name: self.queue_name.clone(),
                    event_type: None,
                    retired: false,
                    counters: Arc::clone(&self.counters),
                }))
            }
            Err(e) if is_pool_timeout(&e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(ServiceError::PoolExhausted)
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(classify("acquire", e))
            }
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            open: self.pool.open_count().unwrap_or(0),
            busy: self.pool.busy_count().unwrap_or(0),
            acquired_total: self.counters.acquired.load(Ordering::Relaxed),
            released_total: self.counters.released.load(Ordering::Relaxed),
            error_total: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pool.close(&PoolCloseMode::Force) {
            warn!(error = %e, "session pool close reported an error");
        }
    }
}

/// One borrowed session. Returned to the pool on drop; dropped from the
/// pool instead when tagged for retirement.
pub struct OracleSession {
    conn: Connection,
    queue_name: String,
    event_type: Option<ObjectType>,
    retired: bool,
    counters: Arc<Counters>,
}

impl OracleSession {
    /// Translate one driver error, counting it and tagging the session for
    /// retirement when it is session-fatal.
    fn fail(&mut self, operation: &'static str, err: oracle::Error) -> ServiceError {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        let err = classify(operation, err);
        if !err.is_recoverable() {
            self.retired = true;
        }
        err
    }

    /// Map a driver result through [`OracleSession::fail`].
    fn check<T>(
        &mut self,
        operation: &'static str,
        result: std::result::Result<T, oracle::Error>,
    ) -> Result<T> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(operation, e)),
        }
    }

    /// The payload descriptor, resolved once per session (the driver also
    /// caches it per connection).
    fn event_object_type(&mut self) -> Result<ObjectType> {
        if let Some(t) = &self.event_type {
            return Ok(t.clone());
        }
        let looked_up = self.conn.object_type(EVENT_OBJECT_TYPE);
        let t = self.check("object-type-lookup", looked_up)?;
        self.event_type = Some(t.clone());
        Ok(t)
    }
}

impl Drop for OracleSession {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        if self.retired {
            if let Err(e) = self.conn.close_with_mode(ConnCloseMode::Drop) {
                debug!(error = %e, "dropping retired session failed");
            }
        }
    }
}

impl DbSession for OracleSession {
    fn ping(&mut self) -> Result<()> {
        let pinged = self.conn.ping();
        self.check("ping", pinged)
    }

    fn commit(&mut self) -> Result<()> {
        let committed = self.conn.commit();
        self.check("commit", committed)
    }

    fn rollback(&mut self) -> Result<()> {
        let rolled_back = self.conn.rollback();
        self.check("rollback", rolled_back)
    }

    fn retire(&mut self) {
        self.retired = true;
    }

    fn is_retired(&self) -> bool {
        self.retired
    }

    fn dequeue_event(&mut self, wait: Duration) -> Result<Option<Event>> {
        let objtype = self.event_object_type()?;
        let created = aq::Queue::<Object>::new(&self.conn, &self.queue_name, &objtype);
        let mut queue = self.check("queue-open", created)?;

        // First-message navigation with array size 1 keeps ordering and
        // commit boundaries simple; the message leaves the queue only when
        // this session commits.
        let configured = queue.deq_options().and_then(|opts| {
            opts.set_navigation(&DeqNavigation::FirstMessage)?;
            opts.set_visibility(&Visibility::OnCommit)?;
            opts.set_wait(&wait)
        });
        if let Err(e) = configured {
            return Err(self.fail("dequeue-options", e));
        }

        match queue.dequeue() {
            Ok(props) => {
                let payload = props.payload();
                let object = self.check("dequeue-payload", payload)?;
                extract_event(&object).map(Some)
            }
            Err(e) if is_dequeue_timeout(&e) => Ok(None),
            Err(e) => Err(self.fail("dequeue", e)),
        }
    }

    fn insert_log_rows(&mut self, rows: &[LogRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        const INSERT_SQL: &str = r#"
            INSERT INTO process_logs (
                process_id, tenant_id, log_level, event_type, component,
                message, details_json, stack_trace, correlation_id, span_id,
                trace_id, event_duration_us, logged_at
            ) VALUES (
                :process_id, :tenant_id, :log_level, :event_type, :component,
                :message, :details_json, :stack_trace, :correlation_id, :span_id,
                :trace_id, :event_duration_us, SYSTIMESTAMP
            )
        "#;

        // One array-bound statement: every column becomes a batch variable
        // sized to the row count, executed in a single round trip.
        //
        // `Batch` borrows `self.conn` for its whole lifetime, so it can't
        // coexist with calls to `self.check`/`self.fail` (which take
        // `&mut self`); route through the disjoint `counters`/`retired`
        // fields directly instead.
        let OracleSession {
            conn,
            counters,
            retired,
            ..
        } = &mut *self;
        let built = conn.batch(INSERT_SQL, rows.len()).build();
        let mut batch = check_result(counters, retired, "log-batch-prepare", built)?;
        for row in rows {
            let log_level = row.log_level.as_str();
            let event_type = row.event_type.map(|t| t.as_str().to_string());
            let appended = batch.append_row_named(&[
                ("process_id", &row.process_id),
                ("tenant_id", &row.tenant_id),
                ("log_level", &log_level),
                ("event_type", &event_type),
                ("component", &row.component),
                ("message", &row.message),
                ("details_json", &row.details_json),
                ("stack_trace", &row.stack_trace),
                ("correlation_id", &row.correlation_id),
                ("span_id", &row.span_id),
                ("trace_id", &row.trace_id),
                ("event_duration_us", &row.event_duration_us),
            ]);
            check_result(counters, retired, "log-batch-append", appended)?;
        }
        let executed = batch.execute();
        check_result(counters, retired, "log-batch-execute", executed)?;
        drop(batch);

        // Rows committed together are visible together.
        let committed = self.conn.commit();
        self.check("log-batch-commit", committed)?;
        Ok(rows.len())
    }

    fn apply_status_update(&mut self, update: &StatusUpdate) -> Result<()> {
        const MERGE_SQL: &str = r#"
            MERGE INTO process_live_status dst
            USING (SELECT :process_id AS process_id FROM dual) src
            ON (dst.process_id = src.process_id)
            WHEN MATCHED THEN UPDATE SET
                dst.status = :status,
                dst.progress_pct = NVL(:progress_pct, dst.progress_pct),
                dst.last_message = NVL(:last_message, dst.last_message),
                dst.last_heartbeat = :observed_at,
                dst.started_at = NVL(dst.started_at, :observed_at),
                dst.finished_at = CASE WHEN :is_terminal = 1
                                       THEN :observed_at
                                       ELSE dst.finished_at END,
                dst.updated_at = SYSTIMESTAMP
            WHEN NOT MATCHED THEN INSERT (
                process_id, tenant_id, status, progress_pct, last_message,
                started_at, last_heartbeat, finished_at, updated_at
            ) VALUES (
                :process_id, :tenant_id, :status, :progress_pct, :last_message,
                :observed_at, :observed_at,
                CASE WHEN :is_terminal = 1 THEN :observed_at ELSE NULL END,
                SYSTIMESTAMP
            )
        "#;

        let status = update.status.as_str();
        let is_terminal = i32::from(update.status.is_terminal());
        let executed = self.conn.execute_named(
            MERGE_SQL,
            &[
                ("process_id", &update.process_id),
                ("tenant_id", &update.tenant_id),
                ("status", &status),
                ("progress_pct", &update.progress_pct),
                ("last_message", &update.message),
                ("observed_at", &update.observed_at),
                ("is_terminal", &is_terminal),
            ],
        );
        self.check("status-merge", executed)?;
        Ok(())
    }

    fn record_process_metric(
        &mut self,
        process_id: &str,
        tenant_id: &str,
        metric: &str,
        value: f64,
    ) -> Result<()> {
        const INSERT_SQL: &str = r#"
            INSERT INTO process_metrics (
                process_id, tenant_id, metric_name, metric_value, recorded_at
            ) VALUES (
                :process_id, :tenant_id, :metric_name, :metric_value, SYSTIMESTAMP
            )
        "#;
        let executed = self.conn.execute_named(
            INSERT_SQL,
            &[
                ("process_id", &process_id),
                ("tenant_id", &tenant_id),
                ("metric_name", &metric),
                ("metric_value", &value),
            ],
        );
        self.check("metric-insert", executed)?;
        Ok(())
    }

    fn mark_stalled(&mut self, stale_after: Duration) -> Result<u64> {
        const UPDATE_SQL: &str = r#"
            UPDATE process_live_status
            SET status = 'STALLED', updated_at = SYSTIMESTAMP
            WHERE status = 'RUNNING'
              AND last_heartbeat <
                  SYS_EXTRACT_UTC(SYSTIMESTAMP) - NUMTODSINTERVAL(:stale_seconds, 'SECOND')
        "#;
        let stale_seconds = stale_after.as_secs() as i64;
        let executed = self
            .conn
            .execute_named(UPDATE_SQL, &[("stale_seconds", &stale_seconds)]);
        let stmt = self.check("mark-stalled", executed)?;
        let count = stmt.row_count();
        self.check("mark-stalled", count)
    }

    fn cleanup_expired(&mut self, older_than: Duration) -> Result<u64> {
        const DELETE_SQL: &str = r#"
            DELETE FROM process_live_status
            WHERE status IN ('COMPLETED', 'FAILED')
              AND finished_at <
                  SYS_EXTRACT_UTC(SYSTIMESTAMP) - NUMTODSINTERVAL(:retention_seconds, 'SECOND')
        "#;
        let retention_seconds = older_than.as_secs() as i64;
        let executed = self
            .conn
            .execute_named(DELETE_SQL, &[("retention_seconds", &retention_seconds)]);
        let stmt = self.check("cleanup-expired", executed)?;
        let count = stmt.row_count();
        self.check("cleanup-expired", count)
    }

    fn query_status(
        &mut self,
        process_id: &str,
        ctx: &TenantContext,
    ) -> Result<Option<ProcessStatusRecord>> {
        const STATUS_SQL: &str = r#"
            SELECT process_id, tenant_id, status, progress_pct,
                   started_at, finished_at, last_heartbeat, last_message
            FROM process_live_status
            WHERE process_id = :process_id
        "#;

        let (sql, filtered) = tenant_scope(STATUS_SQL, ctx)?;
        let mut binds: Vec<(&str, &dyn ToSql)> = vec![("process_id", &process_id)];
        if filtered {
            binds.push(("tenant_id", &ctx.tenant_id));
        }

        match self.conn.query_row_named(&sql, &binds) {
            Ok(row) => {
                let record = status_from_row(&row);
                Ok(Some(self.check("status-query", record)?))
            }
            Err(e) if e.kind() == oracle::ErrorKind::NoDataFound => Ok(None),
            Err(e) => Err(self.fail("status-query", e)),
        }
    }

    fn list_processes(
        &mut self,
        ctx: &TenantContext,
        limit: u32,
    ) -> Result<Vec<ProcessStatusRecord>> {
        const LIST_SQL: &str = r#"
            SELECT process_id, tenant_id, status, progress_pct,
                   started_at, finished_at, last_heartbeat, last_message
            FROM process_live_status
            ORDER BY last_heartbeat DESC NULLS LAST
            FETCH FIRST :row_limit ROWS ONLY
        "#;

        let (sql, filtered) = tenant_scope(LIST_SQL, ctx)?;
        let mut binds: Vec<(&str, &dyn ToSql)> = vec![("row_limit", &limit)];
        if filtered {
            binds.push(("tenant_id", &ctx.tenant_id));
        }

        let queried = self.conn.query_named(&sql, &binds);
        let rows = self.check("process-list", queried)?;
        let mut records = Vec::new();
        for row in rows {
            let row = self.check("process-list", row)?;
            let record = status_from_row(&row);
            records.push(self.check("process-list", record)?);
        }
        Ok(records)
    }

    fn query_logs(
        &mut self,
        process_id: &str,
        ctx: &TenantContext,
        limit: u32,
    ) -> Result<Vec<LogEntryRecord>> {
        const LOGS_SQL: &str = r#"
            SELECT logged_at, log_level, event_type, component, message,
                   details_json, correlation_id, span_id, trace_id,
                   event_duration_us
            FROM process_logs
            WHERE process_id = :process_id
            ORDER BY logged_at DESC
            FETCH FIRST :row_limit ROWS ONLY
        "#;

        let (sql, filtered) = tenant_scope(LOGS_SQL, ctx)?;
        let mut binds: Vec<(&str, &dyn ToSql)> =
            vec![("process_id", &process_id), ("row_limit", &limit)];
        if filtered {
            binds.push(("tenant_id", &ctx.tenant_id));
        }

        let queried = self.conn.query_named(&sql, &binds);
        let rows = self.check("log-query", queried)?;
        let mut records = Vec::new();
        for row in rows {
            let row = self.check("log-query", row)?;
            let record = log_from_row(&row);
            records.push(self.check("log-query", record)?);
        }
        Ok(records)
    }
}

/// Apply the tenant guard to a query template. System and admin contexts
/// read across tenants; everyone else gets the bound tenant predicate.
fn tenant_scope(sql: &str, ctx: &TenantContext) -> Result<(String, bool)> {
    if ctx.bypasses_tenant_isolation() {
        return Ok((sql.to_string(), false));
    }
    Ok((tenant::inject_tenant_filter(sql)?, true))
}

fn status_from_row(row: &oracle::Row) -> std::result::Result<ProcessStatusRecord, oracle::Error> {
    Ok(ProcessStatusRecord {
        process_id: row.get(0)?,
        tenant_id: row.get(1)?,
        status: row.get(2)?,
        progress_pct: row.get(3)?,
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        last_heartbeat: row.get(6)?,
        last_message: row.get(7)?,
    })
}

fn log_from_row(row: &oracle::Row) -> std::result::Result<LogEntryRecord, oracle::Error> {
    Ok(LogEntryRecord {
        logged_at: row.get(0)?,
        log_level: row.get(1)?,
        event_type: row.get(2)?,
        component: row.get(3)?,
        message: row.get(4)?,
        details_json: row.get(5)?,
        correlation_id: row.get(6)?,
        span_id: row.get(7)?,
        trace_id: row.get(8)?,
        event_duration_us: row.get(9)?,
    })
}

/// Read the six typed attributes of one dequeued message. Attributes are
/// addressed by name through the object type descriptor; the CLOB payload
/// is materialized into an owned string.
fn extract_event(object: &Object) -> Result<Event> {
    let event_id: String = attr(object, "EVENT_ID")?;
    let type_str: String = attr(object, "EVENT_TYPE")?;
    let process_id: String = attr(object, "PROCESS_ID")?;
    let tenant_id: String = attr(object, "TENANT_ID")?;
    let timestamp_utc: DateTime<Utc> = attr(object, "TIMESTAMP_UTC")?;
    let payload: Option<String> = attr(object, "PAYLOAD")?;

    let event_type = EventType::parse(type_str.trim()).ok_or_else(|| ServiceError::Database {
        operation: "event-decode",
        details: format!("unknown event type {type_str:?}"),
        recoverable: true,
    })?;

    let event = Event {
        event_id,
        event_type,
        process_id,
        tenant_id,
        timestamp_utc,
        payload,
    };
    event.validate().map_err(|reason| ServiceError::Database {
        operation: "event-decode",
        details: reason,
        recoverable: true,
    })?;
    Ok(event)
}

fn attr<T: oracle::sql_type::FromSql>(object: &Object, name: &str) -> Result<T> {
    object.get(name).map_err(|e| ServiceError::Database {
        operation: "event-decode",
        details: format!("attribute {name}: {e}"),
        recoverable: true,
    })
}
