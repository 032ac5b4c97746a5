// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sentinel Core - Oracle AQ to HTTP bridge
//!
//! This crate is the runtime engine of the Sentinel process-monitoring
//! service. Database-resident procedures enqueue process-lifecycle events
//! (started, heartbeat, progress, completed, error) onto an Oracle Advanced
//! Queuing queue; Sentinel dequeues them, fans them out to worker threads
//! that perform the resulting database writes, and serves tenant-scoped
//! status and log queries over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Oracle Database                          │
//! │   PL/SQL producers ──► SENTINEL_QUEUE (typed AQ payload)     │
//! │   process_live_status / process_logs / process_metrics       │
//! └──────────────────────────────────────────────────────────────┘
//!        ▲                │ dequeue (visibility on commit)
//!        │ writes         ▼
//! ┌─────────────┐   ┌──────────────┐   ┌────────────────────────┐
//! │ Worker Pool │◄──│ Task Queue   │◄──│ AQ Listener (1 thread) │
//! │ (N threads, │   │ (bounded     │   └────────────────────────┘
//! │  pinned     │   │  MPMC)       │
//! │  sessions)  │   └──────────────┘   ┌────────────────────────┐
//! └─────────────┘                      │ HTTP Server            │
//!        │        ┌──────────────┐     │ /health /ready /metrics│
//!        └───────►│ Bulk Flusher │     │ /status /processes     │
//!                 │ (array DML)  │     │ /logs  (bearer auth)   │
//!                 └──────────────┘     └────────────────────────┘
//!                         all database access via the session pool
//! ```
//!
//! # Threading model
//!
//! Scheduling is parallel OS threads. One listener thread blocks on the AQ
//! dequeue for up to the configured wait; each worker thread pins one pooled
//! session for its whole life and blocks on the task queue's condition
//! variable; the HTTP acceptor hands every connection its own thread. The
//! session pool is the root resource: every other component holds a
//! non-owning [`std::sync::Arc`] reference to it and is joined before the
//! pool is closed.

pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod flusher;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod runtime;
pub mod task_queue;
pub mod tenant;
pub mod trace;
pub mod wallet;
pub mod worker;

pub use error::{Result, ServiceError};
