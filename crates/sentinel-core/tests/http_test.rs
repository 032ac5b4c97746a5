// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface tests over real sockets.

mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::*;
use sentinel_core::db::ProcessStatusRecord;
use sentinel_core::events::{EventType, LogLevel, LogRow};
use sentinel_core::http::{AppState, HttpConfig, HttpServer};
use sentinel_core::metrics::Metrics;

struct TestServer {
    addr: SocketAddr,
    db: FakeDatabase,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
    server: Option<HttpServer>,
}

impl TestServer {
    fn start() -> Self {
        let db = FakeDatabase::new();
        let metrics = Arc::new(Metrics::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AppState {
            db: Arc::new(db.clone()),
            metrics: Arc::clone(&metrics),
            authenticator: accept_all_authenticator(),
            default_query_limit: 100,
            max_query_limit: 1000,
        });
        let server = HttpServer::start(
            HttpConfig::new("127.0.0.1:0".parse().unwrap()),
            state,
            Arc::clone(&shutdown),
        )
        .expect("server start");
        Self {
            addr: server.local_addr(),
            db,
            metrics,
            shutdown,
            server: Some(server),
        }
    }

    fn get(&self, path: &str, headers: &[(&str, &str)]) -> (u16, String) {
        self.request("GET", path, headers)
    }

    fn request(&self, method: &str, path: &str, headers: &[(&str, &str)]) -> (u16, String) {
        let mut stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut head = format!("{method} {path} HTTP/1.1\r\nHost: test\r\n");
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        stream.write_all(head.as_bytes()).expect("write request");

        let mut raw = String::new();
        stream.read_to_string(&mut raw).expect("read response");
        let status: u16 = raw
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| panic!("unparseable response: {raw:?}"));
        let body = raw
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (status, body)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(server) = self.server.take() {
            server.join(Instant::now() + Duration::from_secs(5));
        }
    }
}

fn seed_process(db: &FakeDatabase, process_id: &str, tenant: &str, status: &str) {
    db.seed_status(ProcessStatusRecord {
        process_id: process_id.to_string(),
        tenant_id: tenant.to_string(),
        status: status.to_string(),
        progress_pct: Some(50.0),
        started_at: Some(Utc::now()),
        finished_at: None,
        last_heartbeat: Some(Utc::now()),
        last_message: None,
    });
}

#[test]
fn test_health_endpoints_are_unauthenticated() {
    let server = TestServer::start();
    for path in ["/health", "/healthz"] {
        let (status, body) = server.get(path, &[]);
        assert_eq!(status, 200);
        assert_eq!(body, r#"{"status":"UP"}"#);
    }
}

#[test]
fn test_readiness_reflects_database() {
    let server = TestServer::start();
    let (status, body) = server.get("/ready", &[]);
    assert_eq!(status, 200);
    assert_eq!(body, r#"{"status":"READY"}"#);

    server.db.fail_acquires(true);
    let (status, body) = server.get("/readyz", &[]);
    assert_eq!(status, 503);
    assert_eq!(body, r#"{"reason":"database","status":"DOWN"}"#);
}

#[test]
fn test_metrics_exposition() {
    let server = TestServer::start();
    server.get("/health", &[]);
    let (status, body) = server.get("/metrics", &[]);
    assert_eq!(status, 200);
    assert!(body.contains("# TYPE requests_total counter"));
    assert!(body.contains("# TYPE http_request_duration histogram"));
    assert!(body.contains("http_request_duration_bucket{le=\"+Inf\"}"));
}

#[test]
fn test_query_endpoints_require_bearer_token() {
    let server = TestServer::start();
    for path in ["/status/P1", "/processes", "/logs/P1"] {
        let (status, body) = server.get(path, &[]);
        assert_eq!(status, 401, "{path}");
        assert!(body.contains("error"), "{path}: {body}");
    }

    let (status, _) = server.get("/status/P1", &[("Authorization", "Basic abc")]);
    assert_eq!(status, 401);

    let (status, _) = server.get("/status/P1", &[("Authorization", "Bearer not-a-jwt")]);
    assert_eq!(status, 401);
}

#[test]
fn test_status_endpoint_scoped_by_tenant() {
    let server = TestServer::start();
    seed_process(&server.db, "P1", "T1", "RUNNING");
    seed_process(&server.db, "P2", "T2", "RUNNING");

    let token = make_token(Some("T1"), &[]);
    let auth = ("Authorization", format!("Bearer {token}"));

    let (status, body) = server.get("/status/P1", &[(auth.0, &auth.1)]);
    assert_eq!(status, 200);
    assert!(body.contains(r#""process_id":"P1""#));
    assert!(body.contains(r#""status":"RUNNING""#));

    // Another tenant's process is indistinguishable from a missing one.
    let (status, _) = server.get("/status/P2", &[(auth.0, &auth.1)]);
    assert_eq!(status, 404);

    let (status, _) = server.get("/status/NOPE", &[(auth.0, &auth.1)]);
    assert_eq!(status, 404);
}

#[test]
fn test_admin_reads_across_tenants() {
    let server = TestServer::start();
    seed_process(&server.db, "P1", "T1", "RUNNING");
    seed_process(&server.db, "P2", "T2", "COMPLETED");

    let token = make_token(Some("T9"), &["admin"]);
    let auth = format!("Bearer {token}");

    let (status, body) = server.get("/processes", &[("Authorization", &auth)]);
    assert_eq!(status, 200);
    assert!(body.contains("\"P1\"") && body.contains("\"P2\""));

    let (status, _) = server.get("/status/P2", &[("Authorization", &auth)]);
    assert_eq!(status, 200);
}

#[test]
fn test_cross_tenant_listing_forbidden() {
    let server = TestServer::start();
    seed_process(&server.db, "P1", "T1", "RUNNING");

    let token = make_token(Some("T1"), &[]);
    let auth = format!("Bearer {token}");

    // Own tenant, explicitly named: fine.
    let (status, _) = server.get("/processes?tenant=T1", &[("Authorization", &auth)]);
    assert_eq!(status, 200);

    // Another tenant: 403.
    let (status, body) = server.get("/processes?tenant=T2", &[("Authorization", &auth)]);
    assert_eq!(status, 403);
    assert!(body.contains("cross-tenant"));
}

#[test]
fn test_logs_endpoint_and_limit_validation() {
    let server = TestServer::start();
    let mut row = LogRow::new("P1", "T1", LogLevel::Info, "process P1 reported COMPLETED");
    row.event_type = Some(EventType::Completed);
    server.db.seed_log(row);

    let token = make_token(Some("T1"), &[]);
    let auth = format!("Bearer {token}");

    let (status, body) = server.get("/logs/P1", &[("Authorization", &auth)]);
    assert_eq!(status, 200);
    assert!(body.contains(r#""logs":"#));
    assert!(body.contains("COMPLETED"));

    let (status, _) = server.get("/logs/P1?limit=0", &[("Authorization", &auth)]);
    assert_eq!(status, 400);
    let (status, _) = server.get("/logs/P1?limit=abc", &[("Authorization", &auth)]);
    assert_eq!(status, 400);
}

#[test]
fn test_database_outage_maps_to_503() {
    let server = TestServer::start();
    server.db.fail_acquires(true);

    let token = make_token(Some("T1"), &[]);
    let auth = format!("Bearer {token}");

    let (status, body) = server.get("/status/P1", &[("Authorization", &auth)]);
    assert_eq!(status, 503);
    assert!(body.contains("database unavailable"));
}

#[test]
fn test_unknown_route_and_bad_method() {
    let server = TestServer::start();
    let (status, _) = server.get("/nope", &[]);
    assert_eq!(status, 404);

    let (status, _) = server.request("POST", "/health", &[]);
    assert_eq!(status, 405);
}

#[test]
fn test_request_counters_move() {
    let server = TestServer::start();
    server.get("/health", &[]);
    server.get("/nope", &[]);

    assert_eq!(server.metrics.requests_total.get(), 2);
    assert_eq!(server.metrics.requests_success.get(), 1);
    assert_eq!(server.metrics.requests_error.get(), 1);
    assert_eq!(server.metrics.http_requests_in_flight.get(), 0);
    assert_eq!(server.metrics.http_request_duration.count(), 2);
}

#[test]
fn test_traceparent_header_is_tolerated() {
    let server = TestServer::start();
    let (status, _) = server.get(
        "/health",
        &[(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        )],
    );
    assert_eq!(status, 200);

    // Garbage tracing context never breaks a request.
    let (status, _) = server.get("/health", &[("traceparent", "zz-not-a-trace")]);
    assert_eq!(status, 200);
}
