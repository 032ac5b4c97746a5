// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! The variable names are part of the deployment contract. Required
//! variables fail startup when absent; everything else carries a default.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::wallet::WalletSource;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TNS alias the driver connects to (resolved through the wallet's
    /// `tnsnames.ora`).
    pub tns_name: String,
    /// Where the wallet comes from: a directory on disk or an inline
    /// base64-encoded ZIP archive.
    pub wallet: WalletSource,
    /// Database account. Empty means the wallet's credential store
    /// authenticates the session (external authentication).
    pub db_username: String,
    /// Password for `db_username`; empty with an auto-login wallet.
    pub db_password: String,
    /// Whether the server certificate DN must match the service name.
    /// Enforced through the wallet's sqlnet parameters; parsed here so a
    /// misconfigured value is caught at startup.
    pub ssl_server_dn_match: bool,

    /// JWK set URI for bearer-token signature verification.
    pub jwk_set_uri: String,
    /// Expected `iss` claim.
    pub issuer: String,
    /// Expected `aud` claim.
    pub audience: String,
    /// Development escape hatch: accept tokens without signature
    /// verification. Defaults to off; with it off and no verifier wired,
    /// token validation fails closed.
    pub insecure_skip_signature: bool,

    /// HTTP listen port.
    pub http_port: u16,
    /// Prometheus metrics port (validated for contract compatibility; the
    /// exposition endpoint is served from the main listener).
    pub metrics_port: u16,
    /// Number of worker threads.
    pub worker_threads: usize,
    /// AQ queue to consume from.
    pub queue_name: String,
    /// Bulk log flush threshold.
    pub log_batch_size: usize,
    /// Tracing filter directive.
    pub log_level: String,

    /// Session pool tuning.
    pub pool: PoolConfig,

    /// AQ dequeue wait per iteration.
    pub dequeue_wait: Duration,
    /// Worker pop timeout.
    pub task_timeout: Duration,
    /// Task queue capacity.
    pub task_queue_capacity: usize,
    /// Upper bound between bulk log flushes.
    pub flush_interval: Duration,
    /// Period of the maintenance scheduler (heartbeat check, cleanup).
    pub maintenance_interval: Duration,
    /// Heartbeats older than this mark the process STALLED.
    pub heartbeat_stale_after: Duration,
    /// Terminal status rows older than this are deleted.
    pub status_retention: Duration,
}

/// Session pool tuning block.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Sessions opened at pool creation.
    pub min_sessions: u32,
    /// Upper bound on open sessions.
    pub max_sessions: u32,
    /// Sessions added when the pool grows.
    pub session_increment: u32,
    /// Idle time after which a session is pinged before reuse.
    pub ping_interval: Duration,
    /// How long an acquire may wait for a free session (timed-wait mode).
    pub wait_timeout: Duration,
    /// Sessions older than this are not handed out again.
    pub max_lifetime: Duration,
    /// Behavior when every session is busy.
    pub get_mode: PoolGetMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: 2,
            max_sessions: 10,
            session_increment: 1,
            ping_interval: Duration::from_secs(60),
            wait_timeout: Duration::from_millis(5000),
            max_lifetime: Duration::from_secs(3600),
            get_mode: PoolGetMode::TimedWait,
        }
    }
}

/// What an acquire does when the pool is fully busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolGetMode {
    /// Block until a session frees up.
    Wait,
    /// Fail immediately.
    NoWait,
    /// Block up to `wait_timeout`, then fail.
    #[default]
    TimedWait,
    /// Open an extra session beyond `max_sessions`.
    ForceGet,
}

impl PoolGetMode {
    fn parse(s: &str) -> Option<PoolGetMode> {
        match s {
            "wait" => Some(PoolGetMode::Wait),
            "no-wait" => Some(PoolGetMode::NoWait),
            "timed-wait" => Some(PoolGetMode::TimedWait),
            "force-get" => Some(PoolGetMode::ForceGet),
            _ => None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// Two mutually exclusive variables were both set.
    #[error("exactly one of {0} and {1} must be set")]
    Conflicting(&'static str, &'static str),

    /// An environment variable has an unparseable value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

impl Config {
    /// Load configuration from process environment variables.
    ///
    /// Required:
    /// - `ORACLE_TNS_NAME`
    /// - exactly one of `ORACLE_WALLET_LOCATION`, `ORACLE_WALLET_BASE64`
    /// - `OAUTH2_JWK_SET_URI`
    /// - `OAUTH2_ISSUER_URI`
    ///
    /// Everything else defaults; see the field docs and `load` for the
    /// variable names.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn load(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tns_name = required(&get, "ORACLE_TNS_NAME")?;

        let wallet_dir = get("ORACLE_WALLET_LOCATION").filter(|v| !v.is_empty());
        let wallet_b64 = get("ORACLE_WALLET_BASE64").filter(|v| !v.is_empty());
        let wallet = match (wallet_dir, wallet_b64) {
            (Some(dir), None) => WalletSource::Directory(PathBuf::from(dir)),
            (None, Some(b64)) => WalletSource::Base64(b64),
            (Some(_), Some(_)) => {
                return Err(ConfigError::Conflicting(
                    "ORACLE_WALLET_LOCATION",
                    "ORACLE_WALLET_BASE64",
                ))
            }
            (None, None) => return Err(ConfigError::Missing("ORACLE_WALLET_LOCATION")),
        };

        let jwk_set_uri = required(&get, "OAUTH2_JWK_SET_URI")?;
        let issuer = required(&get, "OAUTH2_ISSUER_URI")?;

        Ok(Config {
            tns_name,
            wallet,
            db_username: get("ORACLE_USERNAME").unwrap_or_default(),
            db_password: get("ORACLE_PASSWORD").unwrap_or_default(),
            ssl_server_dn_match: parse_bool(&get, "ORACLE_SSL_SERVER_DN_MATCH", true),
            jwk_set_uri,
            issuer,
            audience: get("OAUTH2_AUDIENCE").unwrap_or_else(|| "clm-service".to_string()),
            insecure_skip_signature: parse_bool(
                &get,
                "SENTINEL_INSECURE_SKIP_TOKEN_SIGNATURE",
                false,
            ),
            http_port: parse(&get, "SENTINEL_HTTP_PORT", 8090)?,
            metrics_port: parse(&get, "PROMETHEUS_METRICS_PORT", 9090)?,
            worker_threads: parse(&get, "SENTINEL_WORKER_THREADS", 4)?,
            queue_name: get("SENTINEL_QUEUE_NAME").unwrap_or_else(|| "SENTINEL_QUEUE".to_string()),
            log_batch_size: parse(&get, "SENTINEL_LOG_BATCH_SIZE", 1000)?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            pool: PoolConfig {
                min_sessions: parse(&get, "ORACLE_POOL_MIN_SESSIONS", 2)?,
                max_sessions: parse(&get, "ORACLE_POOL_MAX_SESSIONS", 10)?,
                session_increment: parse(&get, "ORACLE_POOL_SESSION_INCREMENT", 1)?,
                ping_interval: Duration::from_secs(parse(
                    &get,
                    "ORACLE_POOL_PING_INTERVAL_SECONDS",
                    60,
                )?),
                wait_timeout: Duration::from_millis(parse(
                    &get,
                    "ORACLE_POOL_WAIT_TIMEOUT_MS",
                    5000,
                )?),
                max_lifetime: Duration::from_secs(parse(
                    &get,
                    "ORACLE_POOL_MAX_LIFETIME_SECONDS",
                    3600,
                )?),
                get_mode: match get("ORACLE_POOL_GET_MODE") {
                    None => PoolGetMode::TimedWait,
                    Some(v) => PoolGetMode::parse(&v)
                        .ok_or(ConfigError::Invalid("ORACLE_POOL_GET_MODE", v))?,
                },
            },
            dequeue_wait: Duration::from_secs(parse(&get, "SENTINEL_DEQUEUE_WAIT_SECONDS", 5)?),
            task_timeout: Duration::from_millis(parse(&get, "SENTINEL_TASK_TIMEOUT_MS", 1000)?),
            task_queue_capacity: parse(&get, "SENTINEL_TASK_QUEUE_CAPACITY", 1024)?,
            flush_interval: Duration::from_millis(parse(&get, "SENTINEL_FLUSH_INTERVAL_MS", 2000)?),
            maintenance_interval: Duration::from_secs(parse(
                &get,
                "SENTINEL_MAINTENANCE_INTERVAL_SECONDS",
                60,
            )?),
            heartbeat_stale_after: Duration::from_secs(parse(
                &get,
                "SENTINEL_HEARTBEAT_STALE_SECONDS",
                300,
            )?),
            status_retention: Duration::from_secs(
                parse(&get, "SENTINEL_RETENTION_HOURS", 24u64)? * 3600,
            ),
        })
    }
}

fn required(get: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match get(name) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(name) {
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name, v.clone())),
        None => Ok(default),
    }
}

/// Parse a boolean variable. Truthy: `yes`, `true`, `1`, `on`. Falsy: `no`,
/// `false`, `0`, `off`. Anything else warns and falls back to the default.
fn parse_bool(get: &impl Fn(&str) -> Option<String>, name: &'static str, default: bool) -> bool {
    match get(name) {
        None => default,
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "yes" | "true" | "1" | "on" => true,
            "no" | "false" | "0" | "off" => false,
            other => {
                warn!(variable = name, value = other, "unrecognized boolean, using default");
                default
            }
        },
    }
}
