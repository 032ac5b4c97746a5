// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Core data types: queue events, log rows, and worker tasks.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Declared width of `event_id` in the queue payload type.
pub const EVENT_ID_WIDTH: usize = 64;
/// Declared width of `process_id`.
pub const PROCESS_ID_WIDTH: usize = 128;
/// Declared width of `tenant_id`.
pub const TENANT_ID_WIDTH: usize = 64;
/// Maximum length of a log message column.
pub const LOG_MESSAGE_WIDTH: usize = 4000;

/// Process-lifecycle event kinds produced by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Started,
    Heartbeat,
    Progress,
    Completed,
    Error,
}

impl EventType {
    /// Wire representation (matches the producer package).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Started => "STARTED",
            EventType::Heartbeat => "HEARTBEAT",
            EventType::Progress => "PROGRESS",
            EventType::Completed => "COMPLETED",
            EventType::Error => "ERROR",
        }
    }

    /// Parse the wire representation. The enumeration is closed; anything
    /// else is a malformed message.
    pub fn parse(s: &str) -> Option<EventType> {
        match s {
            "STARTED" => Some(EventType::Started),
            "HEARTBEAT" => Some(EventType::Heartbeat),
            "PROGRESS" => Some(EventType::Progress),
            "COMPLETED" => Some(EventType::Completed),
            "ERROR" => Some(EventType::Error),
            _ => None,
        }
    }

    /// Enqueue priority used by the producers (ERROR highest).
    pub fn enqueue_priority(&self) -> i32 {
        match self {
            EventType::Error => 1,
            _ => 5,
        }
    }

    /// Whether the event ends the process lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::Completed | EventType::Error)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dequeued process-lifecycle event.
///
/// In-flight exactly once until the dequeue transaction commits; handlers
/// must be idempotent on `event_id` because at-least-once delivery applies
/// across restarts.
#[derive(Debug, Clone)]
pub struct Event {
    /// Opaque identifier, unique per message.
    pub event_id: String,
    /// Event kind.
    pub event_type: EventType,
    /// The monitored unit of work.
    pub process_id: String,
    /// Isolation key; never empty (defaulted upstream).
    pub tenant_id: String,
    /// UTC instant of emission.
    pub timestamp_utc: DateTime<Utc>,
    /// Optional large-text payload, typically JSON.
    pub payload: Option<String>,
}

impl Event {
    /// Check the field invariants: identifiers are non-empty and within
    /// their declared widths.
    pub fn validate(&self) -> Result<(), String> {
        check_field("event_id", &self.event_id, EVENT_ID_WIDTH)?;
        check_field("process_id", &self.process_id, PROCESS_ID_WIDTH)?;
        check_field("tenant_id", &self.tenant_id, TENANT_ID_WIDTH)?;
        Ok(())
    }

    /// Progress percentage carried in the payload of PROGRESS events.
    pub fn progress_pct(&self) -> Option<f64> {
        let payload = self.payload.as_deref()?;
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        value.get("progress_pct").and_then(|v| v.as_f64())
    }
}

fn check_field(name: &str, value: &str, width: usize) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{name} is empty"));
    }
    if value.len() > width {
        return Err(format!("{name} exceeds {width} bytes"));
    }
    Ok(())
}

/// Log severity, mirroring the `process_logs.log_level` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    pub fn parse(s: &str) -> Option<LogLevel> {
        match s {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row bound for bulk insertion into `process_logs`.
///
/// The insertion timestamp is assigned by the database at flush time.
/// Rows are moved into the flusher's buffer on append, so producers never
/// retain references into it.
#[derive(Debug, Clone)]
pub struct LogRow {
    pub process_id: String,
    pub tenant_id: String,
    pub log_level: LogLevel,
    pub event_type: Option<EventType>,
    pub component: Option<String>,
    pub message: String,
    pub details_json: Option<String>,
    pub stack_trace: Option<String>,
    pub correlation_id: Option<String>,
    pub span_id: Option<String>,
    pub trace_id: Option<String>,
    pub event_duration_us: Option<i64>,
}

impl LogRow {
    /// Build a row with the required columns; message is truncated to the
    /// column width.
    pub fn new(
        process_id: impl Into<String>,
        tenant_id: impl Into<String>,
        log_level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        let mut message = message.into();
        if message.len() > LOG_MESSAGE_WIDTH {
            // Truncate on a char boundary at or below the column width.
            let mut cut = LOG_MESSAGE_WIDTH;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self {
            process_id: process_id.into(),
            tenant_id: tenant_id.into(),
            log_level,
            event_type: None,
            component: None,
            message,
            details_json: None,
            stack_trace: None,
            correlation_id: None,
            span_id: None,
            trace_id: None,
            event_duration_us: None,
        }
    }

    /// The row the listener path records for a lifecycle event.
    pub fn from_event(event: &Event) -> Self {
        let level = match event.event_type {
            EventType::Error => LogLevel::Error,
            _ => LogLevel::Info,
        };
        let mut row = LogRow::new(
            event.process_id.clone(),
            event.tenant_id.clone(),
            level,
            format!("process {} reported {}", event.process_id, event.event_type),
        );
        row.event_type = Some(event.event_type);
        row.component = Some("queue-listener".to_string());
        row.details_json = event.payload.clone();
        row.correlation_id = Some(event.event_id.clone());
        row
    }
}

/// Completion callback invoked after a task executes. The argument is
/// whether the task succeeded.
pub type TaskCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Work handed from the listener (or the maintenance scheduler) to the
/// worker pool.
///
/// The submitter owns a task until it is pushed; the queue owns it until it
/// is popped; the executing worker owns it to completion.
pub struct Task {
    pub kind: TaskKind,
    pub callback: Option<TaskCallback>,
}

/// Task variants executed by the worker pool.
pub enum TaskKind {
    /// Flush the bulk log buffer through the worker's pinned session.
    LogBatch,
    /// Apply a prepared status change.
    StatusUpdate(StatusUpdate),
    /// Mark rows without recent heartbeats as stalled.
    HeartbeatCheck { stale_after: Duration },
    /// Full handling of one dequeued lifecycle event.
    ProcessEvent(Event),
    /// Delete terminal status rows past the retention window.
    CleanupExpired { older_than: Duration },
    /// Opaque extension point.
    Custom {
        name: String,
        payload: serde_json::Value,
    },
}

impl Task {
    pub fn new(kind: TaskKind) -> Self {
        Self { kind, callback: None }
    }

    pub fn with_callback(kind: TaskKind, callback: TaskCallback) -> Self {
        Self {
            kind,
            callback: Some(callback),
        }
    }

    /// Stable name for logs and metrics.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TaskKind::LogBatch => "log_batch",
            TaskKind::StatusUpdate(_) => "status_update",
            TaskKind::HeartbeatCheck { .. } => "heartbeat_check",
            TaskKind::ProcessEvent(_) => "process_event",
            TaskKind::CleanupExpired { .. } => "cleanup_expired",
            TaskKind::Custom { .. } => "custom",
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind_name())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// A prepared change to `process_live_status`.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub process_id: String,
    pub tenant_id: String,
    pub status: ProcessState,
    pub progress_pct: Option<f64>,
    pub message: Option<String>,
    /// Event time driving `started_at` / `finished_at` / `last_heartbeat`.
    pub observed_at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Derive the status change a lifecycle event implies.
    pub fn from_event(event: &Event) -> Self {
        let status = match event.event_type {
            EventType::Started => ProcessState::Running,
            EventType::Heartbeat | EventType::Progress => ProcessState::Running,
            EventType::Completed => ProcessState::Completed,
            EventType::Error => ProcessState::Failed,
        };
        Self {
            process_id: event.process_id.clone(),
            tenant_id: event.tenant_id.clone(),
            status,
            progress_pct: event.progress_pct(),
            message: event.payload.clone(),
            observed_at: event.timestamp_utc,
        }
    }
}

/// Live status of a monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Stalled,
    Completed,
    Failed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Running => "RUNNING",
            ProcessState::Stalled => "STALLED",
            ProcessState::Completed => "COMPLETED",
            ProcessState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Completed | ProcessState::Failed)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
