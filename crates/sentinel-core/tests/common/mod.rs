// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure.
//!
//! An in-memory [`Database`]/[`DbSession`] pair with scripted failure
//! modes, plus token and event builders shared by the component tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use sentinel_core::auth::{b64url_encode, Authenticator, InsecureAcceptAllVerifier, TenantContext};
use sentinel_core::db::{Database, DbSession, LogEntryRecord, PoolStats, ProcessStatusRecord};
use sentinel_core::error::{Result, ServiceError};
use sentinel_core::events::{Event, EventType, LogRow, StatusUpdate};

pub const TEST_ISSUER: &str = "https://auth.test/";
pub const TEST_AUDIENCE: &str = "clm-service";

/// Shared state behind every fake session.
#[derive(Default)]
pub struct FakeState {
    pub fail_acquires: AtomicBool,
    pub fail_inserts: AtomicBool,
    pub fail_dequeues: AtomicBool,
    /// Number of upcoming commits that fail (each failure re-queues the
    /// in-flight event, like a rollback would).
    pub commit_failures: AtomicU32,

    pub capacity: u32,
    pub busy: AtomicU32,
    pub acquired: AtomicU64,
    pub released: AtomicU64,
    pub errors: AtomicU64,
    pub closed: AtomicBool,

    pub events: Mutex<VecDeque<Event>>,
    pub committed_event_ids: Mutex<Vec<String>>,
    pub rollbacks: AtomicU64,

    pub logs: Mutex<Vec<LogRow>>,
    pub statuses: Mutex<HashMap<String, ProcessStatusRecord>>,
    pub metrics_rows: Mutex<Vec<(String, String, String, f64)>>,
}

/// In-memory stand-in for the Oracle backend.
#[derive(Clone)]
pub struct FakeDatabase {
    pub state: Arc<FakeState>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            state: Arc::new(FakeState {
                capacity,
                ..FakeState::default()
            }),
        }
    }

    pub fn push_event(&self, event: Event) {
        self.state
            .events
            .lock()
            .unwrap()
            .push_back(event);
    }

    pub fn fail_acquires(&self, fail: bool) {
        self.state.fail_acquires.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.state.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_commits(&self, n: u32) {
        self.state.commit_failures.store(n, Ordering::SeqCst);
    }

    pub fn seed_status(&self, record: ProcessStatusRecord) {
        self.state
            .statuses
            .lock()
            .unwrap()
            .insert(record.process_id.clone(), record);
    }

    pub fn seed_log(&self, row: LogRow) {
        self.state.logs.lock().unwrap().push(row);
    }

    pub fn inserted_logs(&self) -> Vec<LogRow> {
        self.state.logs.lock().unwrap().clone()
    }

    pub fn committed_event_ids(&self) -> Vec<String> {
        self.state.committed_event_ids.lock().unwrap().clone()
    }

    pub fn status_of(&self, process_id: &str) -> Option<ProcessStatusRecord> {
        self.state.statuses.lock().unwrap().get(process_id).cloned()
    }
}

impl Database for FakeDatabase {
    fn acquire(&self) -> Result<Box<dyn DbSession>> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ServiceError::PoolClosed);
        }
        if self.state.fail_acquires.load(Ordering::SeqCst) {
            self.state.errors.fetch_add(1, Ordering::Relaxed);
            return Err(ServiceError::Database {
                operation: "acquire",
                details: "scripted acquire failure".to_string(),
                recoverable: true,
            });
        }
        let busy = self.state.busy.fetch_add(1, Ordering::SeqCst);
        if busy >= self.state.capacity {
            self.state.busy.fetch_sub(1, Ordering::SeqCst);
            self.state.errors.fetch_add(1, Ordering::Relaxed);
            return Err(ServiceError::PoolExhausted);
        }
        self.state.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
            in_flight: None,
            retired: false,
        }))
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            open: self.state.capacity,
            busy: self.state.busy.load(Ordering::SeqCst),
            acquired_total: self.state.acquired.load(Ordering::Relaxed),
            released_total: self.state.released.load(Ordering::Relaxed),
            error_total: self.state.errors.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeSession {
    state: Arc<FakeState>,
    in_flight: Option<Event>,
    retired: bool,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        // An uncommitted message returns to the queue, like a real
        // rollback on session release.
        if let Some(event) = self.in_flight.take() {
            self.state.events.lock().unwrap().push_front(event);
        }
        self.state.busy.fetch_sub(1, Ordering::SeqCst);
        self.state.released.fetch_add(1, Ordering::Relaxed);
    }
}

impl DbSession for FakeSession {
    fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.state.commit_failures.load(Ordering::SeqCst) > 0 {
            self.state.commit_failures.fetch_sub(1, Ordering::SeqCst);
            if let Some(event) = self.in_flight.take() {
                self.state.events.lock().unwrap().push_front(event);
            }
            return Err(ServiceError::Database {
                operation: "commit",
                details: "scripted commit failure".to_string(),
                recoverable: true,
            });
        }
        if let Some(event) = self.in_flight.take() {
            self.state
                .committed_event_ids
                .lock()
                .unwrap()
                .push(event.event_id);
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.state.rollbacks.fetch_add(1, Ordering::Relaxed);
        if let Some(event) = self.in_flight.take() {
            self.state.events.lock().unwrap().push_front(event);
        }
        Ok(())
    }

    fn retire(&mut self) {
        self.retired = true;
    }

    fn is_retired(&self) -> bool {
        self.retired
    }

    fn dequeue_event(&mut self, wait: Duration) -> Result<Option<Event>> {
        if self.state.fail_dequeues.load(Ordering::SeqCst) {
            return Err(ServiceError::Database {
                operation: "dequeue",
                details: "scripted dequeue failure".to_string(),
                recoverable: true,
            });
        }
        let next = self.state.events.lock().unwrap().pop_front();
        match next {
            Some(event) => {
                self.in_flight = Some(event.clone());
                Ok(Some(event))
            }
            None => {
                std::thread::sleep(wait.min(Duration::from_millis(5)));
                Ok(None)
            }
        }
    }

    fn insert_log_rows(&mut self, rows: &[LogRow]) -> Result<usize> {
        if self.state.fail_inserts.load(Ordering::SeqCst) {
            // All-or-nothing: nothing from the batch is recorded.
            return Err(ServiceError::Database {
                operation: "log-batch-execute",
                details: "scripted insert failure".to_string(),
                recoverable: true,
            });
        }
        self.state.logs.lock().unwrap().extend_from_slice(rows);
        Ok(rows.len())
    }

    fn apply_status_update(&mut self, update: &StatusUpdate) -> Result<()> {
        let mut statuses = self.state.statuses.lock().unwrap();
        let existing_started = statuses
            .get(&update.process_id)
            .and_then(|r| r.started_at);
        let finished = update
            .status
            .is_terminal()
            .then_some(update.observed_at);
        statuses.insert(
            update.process_id.clone(),
            ProcessStatusRecord {
                process_id: update.process_id.clone(),
                tenant_id: update.tenant_id.clone(),
                status: update.status.as_str().to_string(),
                progress_pct: update.progress_pct,
                started_at: existing_started.or(Some(update.observed_at)),
                finished_at: finished,
                last_heartbeat: Some(update.observed_at),
                last_message: update.message.clone(),
            },
        );
        Ok(())
    }

    fn record_process_metric(
        &mut self,
        process_id: &str,
        tenant_id: &str,
        metric: &str,
        value: f64,
    ) -> Result<()> {
        self.state.metrics_rows.lock().unwrap().push((
            process_id.to_string(),
            tenant_id.to_string(),
            metric.to_string(),
            value,
        ));
        Ok(())
    }

    fn mark_stalled(&mut self, stale_after: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(stale_after).unwrap();
        let mut statuses = self.state.statuses.lock().unwrap();
        let mut changed = 0;
        for record in statuses.values_mut() {
            if record.status == "RUNNING"
                && record.last_heartbeat.is_some_and(|hb| hb < cutoff)
            {
                record.status = "STALLED".to_string();
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn cleanup_expired(&mut self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap();
        let mut statuses = self.state.statuses.lock().unwrap();
        let before = statuses.len();
        statuses.retain(|_, r| {
            !(matches!(r.status.as_str(), "COMPLETED" | "FAILED")
                && r.finished_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - statuses.len()) as u64)
    }

    fn query_status(
        &mut self,
        process_id: &str,
        ctx: &TenantContext,
    ) -> Result<Option<ProcessStatusRecord>> {
        let statuses = self.state.statuses.lock().unwrap();
        Ok(statuses
            .get(process_id)
            .filter(|r| visible(r.tenant_id.as_str(), ctx))
            .cloned())
    }

    fn list_processes(
        &mut self,
        ctx: &TenantContext,
        limit: u32,
    ) -> Result<Vec<ProcessStatusRecord>> {
        let statuses = self.state.statuses.lock().unwrap();
        let mut records: Vec<ProcessStatusRecord> = statuses
            .values()
            .filter(|r| visible(r.tenant_id.as_str(), ctx))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.process_id.cmp(&b.process_id));
        records.truncate(limit as usize);
        Ok(records)
    }

    fn query_logs(
        &mut self,
        process_id: &str,
        ctx: &TenantContext,
        limit: u32,
    ) -> Result<Vec<LogEntryRecord>> {
        let logs = self.state.logs.lock().unwrap();
        let mut records: Vec<LogEntryRecord> = logs
            .iter()
            .filter(|row| row.process_id == process_id && visible(row.tenant_id.as_str(), ctx))
            .map(|row| LogEntryRecord {
                logged_at: Utc::now(),
                log_level: row.log_level.as_str().to_string(),
                event_type: row.event_type.map(|t| t.as_str().to_string()),
                component: row.component.clone(),
                message: row.message.clone(),
                details_json: row.details_json.clone(),
                correlation_id: row.correlation_id.clone(),
                span_id: row.span_id.clone(),
                trace_id: row.trace_id.clone(),
                event_duration_us: row.event_duration_us,
            })
            .collect();
        records.truncate(limit as usize);
        Ok(records)
    }
}

fn visible(row_tenant: &str, ctx: &TenantContext) -> bool {
    ctx.bypasses_tenant_isolation() || ctx.tenant_id == row_tenant
}

/// Build a test event.
pub fn test_event(event_id: &str, event_type: EventType, process_id: &str, tenant: &str) -> Event {
    Event {
        event_id: event_id.to_string(),
        event_type,
        process_id: process_id.to_string(),
        tenant_id: tenant.to_string(),
        timestamp_utc: Utc::now(),
        payload: None,
    }
}

/// An authenticator whose signature check always passes (claims are still
/// validated).
pub fn accept_all_authenticator() -> Authenticator {
    Authenticator::new(TEST_ISSUER, TEST_AUDIENCE, Box::new(InsecureAcceptAllVerifier))
}

/// Mint a token for `tenant` with the given roles.
pub fn make_token(tenant: Option<&str>, roles: &[&str]) -> String {
    let now = Utc::now().timestamp();
    let mut claims = serde_json::json!({
        "iss": TEST_ISSUER,
        "aud": TEST_AUDIENCE,
        "exp": now + 600,
        "iat": now,
        "sub": "test-user",
        "roles": roles,
    });
    if let Some(tenant) = tenant {
        claims["tenant_id"] = serde_json::json!(tenant);
    }
    format!(
        "{}.{}.{}",
        b64url_encode(br#"{"alg":"RS256","typ":"JWT"}"#),
        b64url_encode(claims.to_string().as_bytes()),
        b64url_encode(b"test-signature")
    )
}
