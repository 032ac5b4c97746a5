// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sentinel Core - service entry point.
//!
//! Loads configuration, materializes the wallet, creates the session pool,
//! starts the runtime, and waits for SIGINT/SIGTERM. Configuration,
//! wallet, pool-creation, and listen-bind failures exit non-zero; a signal
//! exits zero after a graceful shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use sentinel_core::auth::{Authenticator, InsecureAcceptAllVerifier, TokenVerifier, UnavailableVerifier};
use sentinel_core::config::Config;
use sentinel_core::db::oracle::OracleDatabase;
use sentinel_core::db::Database;
use sentinel_core::metrics::Metrics;
use sentinel_core::runtime::{self, Runtime};
use sentinel_core::wallet;

fn main() -> Result<()> {
    // Load .env (development convenience; pods set real environment).
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting sentinel-core");

    let config = Config::from_env().map_err(|e| {
        error!("configuration error: {e}");
        e
    })?;

    // Materialize the wallet and point the driver's name resolution at it.
    let wallet_dir = wallet::prepare(&config.wallet).map_err(|e| {
        error!("wallet error: {e}");
        e
    })?;
    std::env::set_var("TNS_ADMIN", &wallet_dir);
    if !config.ssl_server_dn_match {
        warn!("server certificate DN matching is disabled by configuration");
    }

    info!(
        tns = %config.tns_name,
        http_port = config.http_port,
        workers = config.worker_threads,
        queue = %config.queue_name,
        "configuration loaded"
    );

    let db: Arc<dyn Database> = Arc::new(
        OracleDatabase::connect(
            &config.db_username,
            &config.db_password,
            &config.tns_name,
            &config.pool,
            &config.queue_name,
        )
        .context("session pool creation failed")?,
    );
    info!("session pool created");

    let verifier: Box<dyn TokenVerifier> = if config.insecure_skip_signature {
        warn!("token signature verification DISABLED by configuration");
        Box::new(InsecureAcceptAllVerifier)
    } else {
        // Fail closed until a deployment wires a real key-set verifier.
        Box::new(UnavailableVerifier)
    };
    let authenticator = Authenticator::new(
        config.issuer.clone(),
        config.audience.clone(),
        verifier,
    );

    let metrics = Arc::new(Metrics::new());

    runtime::install_signal_handlers().context("installing signal handlers")?;

    let service = Runtime::start(&config, Arc::clone(&db), metrics, authenticator)
        .context("runtime startup failed")?;
    info!(addr = %service.http_addr(), "sentinel-core ready");

    while runtime::running() {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    info!("shutdown signal received");
    service.shutdown();
    Ok(())
}
