// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP control plane.
//!
//! A thread-per-connection server over a plain TCP listener. Each handler
//! works exclusively with request-scoped buffers that are freed together
//! when the connection thread returns; there is no shared request state.
//! Overload is not shaped here: it surfaces as pool-exhausted errors from
//! the database layer.

pub mod handlers;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::db::Database;
use crate::error::{Result, ServiceError};
use crate::metrics::Metrics;
use crate::trace::Traceparent;

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub addr: SocketAddr,
    /// Upper bound on the request head (request line + headers).
    pub max_header_size: usize,
    /// Socket read/write timeout.
    pub io_timeout: Duration,
}

impl HttpConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            max_header_size: 8192,
            io_timeout: Duration::from_secs(30),
        }
    }
}

/// State shared by every request handler.
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub metrics: Arc<Metrics>,
    pub authenticator: Authenticator,
    pub default_query_limit: u32,
    pub max_query_limit: u32,
}

/// A parsed request head.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value of a query-string parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

/// A response ready to be written.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    pub fn json(status: u16, value: serde_json::Value) -> Response {
        Response {
            status,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }

    pub fn error(status: u16, message: &str) -> Response {
        Response::json(status, serde_json::json!({ "error": message }))
    }

    pub fn text(status: u16, body: String) -> Response {
        Response {
            status,
            content_type: "text/plain; version=0.0.4",
            body: body.into_bytes(),
        }
    }

    fn reason(status: u16) -> &'static str {
        match status {
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            431 => "Request Header Fields Too Large",
            503 => "Service Unavailable",
            _ => "Internal Server Error",
        }
    }
}

/// Handle to the accept loop.
pub struct HttpServer {
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl HttpServer {
    /// Bind and start accepting. A failed bind is fatal to startup.
    pub fn start(
        cfg: HttpConfig,
        state: Arc<AppState>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<HttpServer> {
        let listener = TcpListener::bind(cfg.addr)
            .map_err(|e| ServiceError::Startup(format!("listen on {}: {e}", cfg.addr)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServiceError::Startup(format!("listener address: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| ServiceError::Startup(format!("listener mode: {e}")))?;

        let handle = std::thread::Builder::new()
            .name("sentinel-http".to_string())
            .spawn(move || accept_loop(listener, cfg, state, shutdown))
            .map_err(|e| ServiceError::Startup(format!("spawn http thread: {e}")))?;

        info!(addr = %local_addr, "http server listening");
        Ok(HttpServer {
            handle: Some(handle),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Join the accept loop, abandoning it past `deadline`.
    pub fn join(mut self, deadline: Instant) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(25));
        }
        if handle.is_finished() {
            let _ = handle.join();
            true
        } else {
            warn!("http acceptor did not exit within the shutdown budget");
            false
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    cfg: HttpConfig,
    state: Arc<AppState>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                // Accepted sockets must block; the listener itself polls.
                let _ = stream.set_nonblocking(false);
                let cfg = cfg.clone();
                let state = Arc::clone(&state);
                let spawned = std::thread::Builder::new()
                    .name("sentinel-http-conn".to_string())
                    .spawn(move || handle_connection(stream, peer, &cfg, &state));
                if let Err(e) = spawned {
                    warn!(error = %e, "could not spawn connection thread");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
    info!("http server stopped");
}

struct InFlightGuard<'a>(&'a Metrics);

impl<'a> InFlightGuard<'a> {
    fn new(metrics: &'a Metrics) -> Self {
        metrics.http_requests_in_flight.inc();
        Self(metrics)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.http_requests_in_flight.dec();
    }
}

fn handle_connection(mut stream: TcpStream, peer: SocketAddr, cfg: &HttpConfig, state: &AppState) {
    let _in_flight = InFlightGuard::new(&state.metrics);
    let _ = stream.set_read_timeout(Some(cfg.io_timeout));
    let _ = stream.set_write_timeout(Some(cfg.io_timeout));

    let request = match read_request(&mut stream, cfg.max_header_size) {
        Ok(Some(request)) => request,
        // Nothing arrived; the peer connected and went away.
        Ok(None) => return,
        Err(response) => {
            state.metrics.requests_total.inc();
            state.metrics.requests_error.inc();
            write_response(&mut stream, &response, &state.metrics);
            return;
        }
    };

    state.metrics.requests_total.inc();
    let started = Instant::now();

    let request_id = Uuid::new_v4();
    let traceparent = request
        .header("traceparent")
        .and_then(|v| Traceparent::parse(v).ok());
    let span = match &traceparent {
        Some(tp) => info_span!(
            "request",
            id = %request_id,
            method = %request.method,
            path = %request.path,
            peer = %peer,
            trace_id = %tp.trace_id,
            parent_id = %tp.parent_id,
        ),
        None => info_span!(
            "request",
            id = %request_id,
            method = %request.method,
            path = %request.path,
            peer = %peer,
        ),
    };
    let _entered = span.enter();

    // Handler faults are caught at the connection boundary and answered
    // with a 500 instead of tearing the thread down.
    let response = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        route(&request, state)
    }))
    .unwrap_or_else(|_| Response::error(500, "internal error"));

    state
        .metrics
        .http_request_duration
        .observe_duration(started.elapsed());
    if response.status < 400 {
        state.metrics.requests_success.inc();
    } else {
        state.metrics.requests_error.inc();
    }

    debug!(status = response.status, elapsed = ?started.elapsed(), "request handled");
    write_response(&mut stream, &response, &state.metrics);
}

/// Read the request head (up to `max_header_size` bytes) and parse it.
/// `Ok(None)` means the peer closed without sending anything.
fn read_request(
    stream: &mut TcpStream,
    max_header_size: usize,
) -> std::result::Result<Option<Request>, Response> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() >= max_header_size {
            return Err(Response::error(431, "request head too large"));
        }
        match stream.read(&mut chunk) {
            Ok(0) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(Response::error(400, "truncated request"));
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return Err(Response::error(400, "read failed")),
        }
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| Response::error(400, "request head is not valid UTF-8"))?;
    parse_request(head).map(Some)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request(head: &str) -> std::result::Result<Request, Response> {
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| Response::error(400, "empty request"))?;

    let mut parts = request_line.split_ascii_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Response::error(400, "malformed request line"));
    };
    if !version.starts_with("HTTP/") {
        return Err(Response::error(400, "malformed request line"));
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target.to_string(), None),
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Response::error(400, "malformed header"));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Request {
        method: method.to_string(),
        path,
        query,
        headers,
    })
}

fn route(request: &Request, state: &AppState) -> Response {
    if request.method != "GET" {
        return Response::error(405, "method not allowed");
    }

    match request.path.as_str() {
        "/health" | "/healthz" => Response::json(200, serde_json::json!({ "status": "UP" })),
        "/ready" | "/readyz" => handlers::ready(state),
        "/metrics" => Response::text(200, state.metrics.render()),
        "/processes" => handlers::with_auth(request, state, handlers::list_processes),
        path if path.starts_with("/status/") => {
            handlers::with_auth(request, state, |request, state, ctx| {
                handlers::process_status(request, state, ctx, &path["/status/".len()..])
            })
        }
        path if path.starts_with("/logs/") => {
            handlers::with_auth(request, state, |request, state, ctx| {
                handlers::process_logs(request, state, ctx, &path["/logs/".len()..])
            })
        }
        _ => Response::error(404, "not found"),
    }
}

fn write_response(stream: &mut TcpStream, response: &Response, metrics: &Metrics) {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        Response::reason(response.status),
        response.content_type,
        response.body.len(),
    );
    let result = stream
        .write_all(head.as_bytes())
        .and_then(|_| stream.write_all(&response.body))
        .and_then(|_| stream.flush());
    if let Err(e) = result {
        // Peers that disconnect mid-response are counted, not propagated.
        metrics.requests_error.inc();
        debug!(error = %e, "response write failed");
    }
}
