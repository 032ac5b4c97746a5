// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bulk log flusher.
//!
//! Workers append log rows here; periodically (or when the batch threshold
//! is reached) the buffered rows are written to `process_logs` in one
//! array-DML round trip. A failed flush drops its batch and counts the
//! failure: the service favors availability over log durability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::db::DbSession;
use crate::error::Result;
use crate::events::LogRow;

/// Default flush threshold.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Flusher statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlusherStats {
    pub appended_total: u64,
    pub flushed_rows_total: u64,
    pub flushes_total: u64,
    pub flush_errors: u64,
    pub dropped_rows_total: u64,
}

/// Mutex-guarded row buffer with serialized flushing.
pub struct LogFlusher {
    buffer: Mutex<Vec<LogRow>>,
    batch_size: usize,
    // Held across a whole flush so only one batch is in flight at a time.
    flush_gate: Mutex<()>,
    appended: AtomicU64,
    flushed_rows: AtomicU64,
    flushes: AtomicU64,
    flush_errors: AtomicU64,
    dropped_rows: AtomicU64,
}

impl LogFlusher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            flush_gate: Mutex::new(()),
            appended: AtomicU64::new(0),
            flushed_rows: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_errors: AtomicU64::new(0),
            dropped_rows: AtomicU64::new(0),
        }
    }

    /// Buffer one row. The row is moved into the buffer, so the producer
    /// keeps no reference to it.
    pub fn append(&self, row: LogRow) {
        let mut buffer = self.buffer.lock().expect("flusher mutex poisoned");
        buffer.push(row);
        self.appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().expect("flusher mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the buffer has reached the batch threshold.
    pub fn should_flush(&self) -> bool {
        self.len() >= self.batch_size
    }

    /// Write the buffered rows through `session` in one round trip.
    ///
    /// The buffer is swapped for an empty one up front, so producers keep
    /// appending while the batch is in flight. All-or-nothing: on success
    /// every row of the batch is committed, on failure the batch is
    /// dropped and `flush_errors` incremented.
    pub fn flush(&self, session: &mut dyn DbSession) -> Result<usize> {
        let _gate = self.flush_gate.lock().expect("flusher gate poisoned");

        let batch = {
            let mut buffer = self.buffer.lock().expect("flusher mutex poisoned");
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        match session.insert_log_rows(&batch) {
            Ok(written) => {
                self.flushes.fetch_add(1, Ordering::Relaxed);
                self.flushed_rows.fetch_add(written as u64, Ordering::Relaxed);
                debug!(rows = written, "log batch flushed");
                Ok(written)
            }
            Err(e) => {
                self.flush_errors.fetch_add(1, Ordering::Relaxed);
                self.dropped_rows
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                warn!(rows = batch.len(), error = %e, "log batch dropped");
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> FlusherStats {
        FlusherStats {
            appended_total: self.appended.load(Ordering::Relaxed),
            flushed_rows_total: self.flushed_rows.load(Ordering::Relaxed),
            flushes_total: self.flushes.load(Ordering::Relaxed),
            flush_errors: self.flush_errors.load(Ordering::Relaxed),
            dropped_rows_total: self.dropped_rows.load(Ordering::Relaxed),
        }
    }
}
