// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vajra Functions - Function Lifecycle & Execution Dispatch
//!
//! Runs the control plane:
//! - Registry (PostgreSQL with in-memory fallback)
//! - Deployment workers, including recovery of unfinished deployments
//! - Execution dispatcher (wasmtime in-process, python/node subprocesses)

use tracing::{info, warn};

use vajra_functions::config::Config;
use vajra_functions::migrations;
use vajra_functions::runtime::FunctionRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vajra_functions=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        data_dir = %config.data_dir.display(),
        workers = config.deploy_workers,
        durable = config.database_url.is_some(),
        "Starting Vajra Functions"
    );

    let mut builder = FunctionRuntime::builder().config(config.clone());

    if let Some(url) = &config.database_url {
        // Lazy so an unreachable database degrades to the in-memory registry
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(config.db_acquire_timeout)
            .connect_lazy(url)?;

        match migrations::run(&pool).await {
            Ok(()) => info!("Database schema verified"),
            Err(e) => warn!(error = %e, "Failed to run migrations, registry will fall back to memory"),
        }

        builder = builder.pool(pool);
    }

    let runtime = builder.build()?.start().await?;

    info!("Vajra Functions ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Vajra Functions shut down");

    Ok(())
}
