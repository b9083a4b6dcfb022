// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vajra Functions - Function Lifecycle & Execution Dispatch
//!
//! This crate is the control plane of the vajra function platform. It stores
//! code bundles, keeps per-tenant function metadata, deploys new versions in
//! the background and runs handlers on demand.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    HTTP / Auth / CLI layers                              │
//! │                 (resolve the tenant, call the service)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   vajra-functions (This Crate)                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Function   │  │ Deployment  │  │  Execution  │  │ Invocation  │     │
//! │  │  Service    │─▶│ Orchestrator│  │ Dispatcher  │  │ Accounting  │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                 │                │
//!           ▼                 ▼                ▼
//! ┌───────────────────┐ ┌───────────────────────┐ ┌─────────────────────────┐
//! │  Artifact Store   │ │   Function Registry   │ │  wasmtime / python3 /   │
//! │  (zip bundles)    │ │ PostgreSQL ─▶ memory  │ │  node subprocesses      │
//! └───────────────────┘ └───────────────────────┘ └─────────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `create_function` | Store a bundle and register version 1 in `deploying` |
//! | `get_function` | Fetch a function with its storage provenance |
//! | `list_functions` | All functions of a tenant |
//! | `invoke_function` | Run the handler with a JSON payload |
//! | `delete_function` | Remove metadata and artifacts (`force` ignores dependents) |
//! | `create_version` | Copy-on-write the next version and deploy it |
//! | `create_alias` / `create_trigger` | Attach dependents to a function |
//! | `function_logs` / `function_metrics` | Invocation history and counters |
//!
//! # Deployment Status State Machine
//!
//! ```text
//!      ┌───────────┐
//!      │ DEPLOYING │  create / new version
//!      └─────┬─────┘
//!            │ worker picks up job
//!            ▼
//!      ┌───────────┐
//!      │ BUILDING  │
//!      └─────┬─────┘
//!            │
//!      ┌─────┴──────┐
//!   ok │            │ build error
//!      ▼            ▼
//! ┌──────────┐ ┌────────┐
//! │ DEPLOYED │ │ FAILED │
//! └──────────┘ └────────┘
//! ```
//!
//! # Runtime Strategies
//!
//! | Runtime | Strategy | Timeout |
//! |---------|----------|---------|
//! | `wasm` | In-process (wasmtime) | None |
//! | `python3.8` .. `python3.12` | Subprocess | `timeout_seconds` |
//! | `nodejs16` .. `nodejs20` | Subprocess | `timeout_seconds` |
//! | go, java, rust, dotnet | Accepted at create, not executable | - |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `VAJRA_DATABASE_URL` | No | - | PostgreSQL connection string (memory-only if unset) |
//! | `DATA_DIR` | No | `.data` | Data directory for artifacts and workspaces |
//! | `VAJRA_DEPLOY_WORKERS` | No | `4` | Deployment worker count |
//! | `VAJRA_BUILD_DELAY_MS` | No | `0` | Simulated build duration |
//! | `VAJRA_ENDPOINT_BASE` | No | `https://functions.vajra.local` | Base URL of deployed endpoints |
//! | `VAJRA_PYTHON_BIN` | No | `python3` | Python interpreter |
//! | `VAJRA_NODE_BIN` | No | `node` | Node.js interpreter |
//! | `VAJRA_LOG_RETENTION` | No | `100` | Log entries kept per function |
//! | `VAJRA_DB_ACQUIRE_TIMEOUT_MS` | No | `2000` | Wait for a database connection before falling back |
//!
//! # Modules
//!
//! - [`accounting`]: Invocation counters and logs
//! - [`artifact`]: Content-addressed bundle storage
//! - [`config`]: Configuration from environment variables
//! - [`dispatcher`]: Handler execution strategies
//! - [`error`]: Error types
//! - [`model`]: Function records, runtimes and statuses
//! - [`orchestrator`]: Background deployment workers
//! - [`registry`]: Durable and in-memory function metadata
//! - [`runtime`]: Embeddable runtime wiring everything together
//! - [`service`]: Public operations

#![deny(missing_docs)]

/// Database migrations for the durable registry.
///
/// ```ignore
/// use vajra_functions::migrations;
///
/// let pool = PgPool::connect(&database_url).await?;
/// migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Invocation counters, logs and metrics.
pub mod accounting;

/// Content-addressed storage for code bundles.
pub mod artifact;

/// Configuration loaded from environment variables.
pub mod config;

/// Handler execution strategies and invocation workspaces.
pub mod dispatcher;

/// Error types for function operations.
pub mod error;

/// Function records, runtimes, statuses and validation.
pub mod model;

/// Background deployment queue and workers.
pub mod orchestrator;

/// Function metadata storage with in-memory fallback.
pub mod registry;

/// Embeddable runtime for vajra-functions.
pub mod runtime;

/// Function lifecycle and invocation operations.
pub mod service;

pub use config::Config;
pub use error::{Error, Result};
