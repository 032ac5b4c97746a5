// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service metrics. Atomics only; rendered in Prometheus text exposition.
//!
//! The registry is passed by [`std::sync::Arc`] into every component; there
//! is no process-wide singleton.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket upper bounds, in seconds.
pub const DURATION_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Bucket labels as rendered in the exposition (kept in sync with
/// [`DURATION_BUCKETS`]).
const BUCKET_LABELS: [&str; 12] = [
    "0.001", "0.005", "0.01", "0.025", "0.05", "0.1", "0.25", "0.5", "1", "2.5", "5", "10",
];

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Read-modify-write gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket duration histogram.
///
/// Buckets are stored cumulatively: an observation increments every bucket
/// whose upper bound is at or above the value, and the implicit `+Inf`
/// bucket equals `count`.
#[derive(Debug)]
pub struct Histogram {
    buckets: [AtomicU64; 12],
    count: AtomicU64,
    sum_nanos: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum_nanos: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    /// Record one observation in seconds.
    pub fn observe(&self, seconds: f64) {
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_nanos
            .fetch_add((seconds * 1e9) as u64, Ordering::Relaxed);
    }

    /// Record one observation from a measured duration.
    pub fn observe_duration(&self, d: Duration) {
        self.observe(d.as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_seconds(&self) -> f64 {
        self.sum_nanos.load(Ordering::Relaxed) as f64 / 1e9
    }

    pub fn bucket(&self, i: usize) -> u64 {
        self.buckets[i].load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        push_line(out, &format!("# HELP {name} {help}"));
        push_line(out, &format!("# TYPE {name} histogram"));
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            push_line(
                out,
                &format!("{name}_bucket{{le=\"{label}\"}} {}", self.bucket(i)),
            );
        }
        push_line(
            out,
            &format!("{name}_bucket{{le=\"+Inf\"}} {}", self.count()),
        );
        push_line(out, &format!("{name}_sum {}", self.sum_seconds()));
        push_line(out, &format!("{name}_count {}", self.count()));
    }
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    out.push('\n');
}

/// The fixed metric catalogue.
#[derive(Debug, Default)]
pub struct Metrics {
    // Counters
    pub requests_total: Counter,
    pub requests_success: Counter,
    pub requests_error: Counter,
    pub queue_events_received_total: Counter,
    pub queue_events_processed_total: Counter,
    pub queue_events_failed_total: Counter,
    pub db_queries_total: Counter,
    pub worker_tasks_total: Counter,

    // Gauges
    pub pool_open_connections: Gauge,
    pub pool_busy_connections: Gauge,
    pub queue_depth: Gauge,
    pub worker_tasks_in_progress: Gauge,
    pub http_requests_in_flight: Gauge,

    // Histograms (seconds)
    pub http_request_duration: Histogram,
    pub db_query_duration: Histogram,
    pub worker_task_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the whole catalogue in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(4096);

        let counters: [(&str, &str, &Counter); 8] = [
            (
                "requests_total",
                "HTTP requests accepted",
                &self.requests_total,
            ),
            (
                "requests_success",
                "HTTP requests answered with 2xx",
                &self.requests_success,
            ),
            (
                "requests_error",
                "HTTP requests answered with 4xx/5xx or failed writes",
                &self.requests_error,
            ),
            (
                "queue_events_received_total",
                "Events dequeued from the AQ queue",
                &self.queue_events_received_total,
            ),
            (
                "queue_events_processed_total",
                "Events dispatched and committed",
                &self.queue_events_processed_total,
            ),
            (
                "queue_events_failed_total",
                "Events whose dispatch or commit failed",
                &self.queue_events_failed_total,
            ),
            (
                "db_queries_total",
                "Database statements issued",
                &self.db_queries_total,
            ),
            (
                "worker_tasks_total",
                "Tasks executed by the worker pool",
                &self.worker_tasks_total,
            ),
        ];
        for (name, help, counter) in counters {
            push_line(&mut out, &format!("# HELP {name} {help}"));
            push_line(&mut out, &format!("# TYPE {name} counter"));
            push_line(&mut out, &format!("{name} {}", counter.get()));
        }

        let gauges: [(&str, &str, &Gauge); 5] = [
            (
                "pool_open_connections",
                "Sessions currently open in the pool",
                &self.pool_open_connections,
            ),
            (
                "pool_busy_connections",
                "Sessions currently lent out",
                &self.pool_busy_connections,
            ),
            ("queue_depth", "Tasks waiting in the queue", &self.queue_depth),
            (
                "worker_tasks_in_progress",
                "Tasks currently executing",
                &self.worker_tasks_in_progress,
            ),
            (
                "http_requests_in_flight",
                "HTTP connections currently being handled",
                &self.http_requests_in_flight,
            ),
        ];
        for (name, help, gauge) in gauges {
            push_line(&mut out, &format!("# HELP {name} {help}"));
            push_line(&mut out, &format!("# TYPE {name} gauge"));
            push_line(&mut out, &format!("{name} {}", gauge.get()));
        }

        self.http_request_duration.render(
            &mut out,
            "http_request_duration",
            "HTTP request handling time in seconds",
        );
        self.db_query_duration.render(
            &mut out,
            "db_query_duration",
            "Database round-trip time in seconds",
        );
        self.worker_task_duration.render(
            &mut out,
            "worker_task_duration",
            "Worker task execution time in seconds",
        );

        out
    }
}
