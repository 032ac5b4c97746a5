// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the Sentinel runtime.
//!
//! One crate-wide error enum covers the failure kinds the service
//! distinguishes at runtime. Configuration and wallet failures are fatal at
//! startup; driver errors carry a recoverability flag that decides whether
//! the session they occurred on is retired; queue timeouts are not errors at
//! all and are modelled as `Ok(None)` returns in the database layer.

use crate::config::ConfigError;
use crate::wallet::WalletError;

/// Result type using ServiceError.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors that can occur while the service is running.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// Configuration could not be loaded. Fatal at startup.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The wallet directory or archive was unusable. Fatal at startup.
    #[error(transparent)]
    Wallet(#[from] WalletError),

    /// A database driver or session error.
    ///
    /// `recoverable` mirrors the driver's classification: a recoverable
    /// error leaves the session usable (retry at the next iteration), a
    /// non-recoverable one retires it.
    #[error("database error during {operation}: {details}")]
    Database {
        /// The operation that failed.
        operation: &'static str,
        /// Error details from the driver.
        details: String,
        /// Whether the session that produced the error is still usable.
        recoverable: bool,
    },

    /// No session became free within the pool's wait timeout.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool has been closed; no further sessions can be acquired.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The in-memory task queue rejected a push because it is at capacity.
    #[error("task queue full")]
    QueueFull,

    /// A caller asked for data belonging to another tenant.
    #[error("cross-tenant access denied: context tenant {context} requested {requested}")]
    CrossTenantAccess {
        /// Tenant of the calling context.
        context: String,
        /// Tenant that was requested.
        requested: String,
    },

    /// The tenant guard was invoked incorrectly (empty tenant, unusable
    /// SQL template). This is a programmer error, not a user error.
    #[error("tenant guard misuse: {0}")]
    GuardMisuse(String),

    /// A component could not be started.
    #[error("startup failed: {0}")]
    Startup(String),

    /// The service is shutting down; the operation was not attempted.
    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ServiceError {
    /// Build a non-recoverable database error.
    pub fn database(operation: &'static str, details: impl Into<String>) -> Self {
        ServiceError::Database {
            operation,
            details: details.into(),
            recoverable: false,
        }
    }

    /// Whether a retry against the same session may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ServiceError::Database { recoverable, .. } => *recoverable,
            ServiceError::PoolExhausted | ServiceError::QueueFull => true,
            _ => false,
        }
    }
}
