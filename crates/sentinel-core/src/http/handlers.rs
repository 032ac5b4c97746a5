// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint handlers.
//!
//! Readiness, and the bearer-authenticated tenant-scoped query endpoints.
//! Every database access borrows a fresh session from the pool for the
//! duration of the request.

use std::time::Instant;

use tracing::{debug, warn};

use crate::auth::TenantContext;
use crate::error::ServiceError;
use crate::http::{AppState, Request, Response};
use crate::tenant;

/// Readiness: borrow a session and give it straight back. Liveness never
/// touches the database; readiness is exactly the database.
pub fn ready(state: &AppState) -> Response {
    match state.db.acquire() {
        Ok(session) => {
            drop(session);
            Response::json(200, serde_json::json!({ "status": "READY" }))
        }
        Err(e) => {
            debug!(error = %e, "readiness probe failed");
            Response::json(
                503,
                serde_json::json!({ "status": "DOWN", "reason": "database" }),
            )
        }
    }
}

/// Authenticate the request, then run the handler with the caller's
/// tenant context.
pub fn with_auth(
    request: &Request,
    state: &AppState,
    handler: impl FnOnce(&Request, &AppState, TenantContext) -> Response,
) -> Response {
    match state.authenticator.authenticate(request.header("authorization")) {
        Ok(ctx) => handler(request, state, ctx),
        Err(e) => {
            debug!(error = %e, "authentication failed");
            Response::error(401, &e.to_string())
        }
    }
}

/// `GET /status/{process_id}`
pub fn process_status(
    _request: &Request,
    state: &AppState,
    ctx: TenantContext,
    process_id: &str,
) -> Response {
    let Some(process_id) = valid_process_id(process_id) else {
        return Response::error(400, "invalid process id");
    };

    let mut session = match state.db.acquire() {
        Ok(session) => session,
        Err(e) => return db_error_response(e),
    };

    let started = Instant::now();
    let result = session.query_status(process_id, &ctx);
    observe_query(state, started);

    match result {
        Ok(Some(record)) => match serde_json::to_value(&record) {
            Ok(body) => Response::json(200, body),
            Err(e) => {
                warn!(error = %e, "status serialization failed");
                Response::error(500, "internal error")
            }
        },
        Ok(None) => Response::error(404, "process not found"),
        Err(e) => db_error_response(e),
    }
}

/// `GET /processes[?tenant=...&limit=...]`
///
/// The `tenant` parameter narrows the listing; callers without the right
/// to cross tenants may only name their own.
pub fn list_processes(request: &Request, state: &AppState, ctx: TenantContext) -> Response {
    let limit = match query_limit(request, state) {
        Ok(limit) => limit,
        Err(response) => return response,
    };

    let effective_ctx = match request.query_param("tenant") {
        Some(target) => match tenant::check_access(&ctx, target) {
            Ok(()) => TenantContext {
                tenant_id: target.to_string(),
                user_id: ctx.user_id.clone(),
                roles: vec![],
                is_system: false,
            },
            Err(e) => return guard_error_response(e),
        },
        None => ctx,
    };

    let mut session = match state.db.acquire() {
        Ok(session) => session,
        Err(e) => return db_error_response(e),
    };

    let started = Instant::now();
    let result = session.list_processes(&effective_ctx, limit);
    observe_query(state, started);

    match result {
        Ok(records) => match serde_json::to_value(&records) {
            Ok(body) => Response::json(200, serde_json::json!({ "processes": body })),
            Err(e) => {
                warn!(error = %e, "process list serialization failed");
                Response::error(500, "internal error")
            }
        },
        Err(e) => db_error_response(e),
    }
}

/// `GET /logs/{process_id}[?limit=...]`
pub fn process_logs(
    request: &Request,
    state: &AppState,
    ctx: TenantContext,
    process_id: &str,
) -> Response {
    let Some(process_id) = valid_process_id(process_id) else {
        return Response::error(400, "invalid process id");
    };
    let limit = match query_limit(request, state) {
        Ok(limit) => limit,
        Err(response) => return response,
    };

    let mut session = match state.db.acquire() {
        Ok(session) => session,
        Err(e) => return db_error_response(e),
    };

    let started = Instant::now();
    let result = session.query_logs(process_id, &ctx, limit);
    observe_query(state, started);

    match result {
        Ok(records) => match serde_json::to_value(&records) {
            Ok(body) => Response::json(200, serde_json::json!({ "logs": body })),
            Err(e) => {
                warn!(error = %e, "log serialization failed");
                Response::error(500, "internal error")
            }
        },
        Err(e) => db_error_response(e),
    }
}

fn valid_process_id(raw: &str) -> Option<&str> {
    let id = raw.trim();
    if id.is_empty() || id.len() > crate::events::PROCESS_ID_WIDTH || id.contains('/') {
        return None;
    }
    Some(id)
}

fn query_limit(request: &Request, state: &AppState) -> Result<u32, Response> {
    match request.query_param("limit") {
        None => Ok(state.default_query_limit),
        Some(raw) => match raw.parse::<u32>() {
            Ok(n) if n > 0 => Ok(n.min(state.max_query_limit)),
            _ => Err(Response::error(400, "invalid limit")),
        },
    }
}

fn observe_query(state: &AppState, started: Instant) {
    state.metrics.db_queries_total.inc();
    state
        .metrics
        .db_query_duration
        .observe_duration(started.elapsed());
}

fn db_error_response(e: ServiceError) -> Response {
    match e {
        ServiceError::PoolExhausted
        | ServiceError::PoolClosed
        | ServiceError::Database { .. } => {
            warn!(error = %e, "database unavailable for request");
            Response::error(503, "database unavailable")
        }
        other => {
            warn!(error = %other, "request failed");
            Response::error(500, "internal error")
        }
    }
}

fn guard_error_response(e: ServiceError) -> Response {
    match e {
        ServiceError::CrossTenantAccess { .. } => Response::error(403, "cross-tenant access denied"),
        other => {
            warn!(error = %other, "tenant guard rejected request");
            Response::error(500, "internal error")
        }
    }
}