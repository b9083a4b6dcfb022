// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for vajra-functions.
//!
//! Execution-time failures of user code are not errors at this level: the
//! dispatcher reports them as data (see [`crate::dispatcher::ExecutionError`]).

use thiserror::Error;

/// Platform errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Artifact store operation failed.
    #[error("Artifact error: {0}")]
    Artifact(#[from] crate::artifact::ArtifactError),

    /// Function was not found for the tenant.
    #[error("Function not found: {tenant_id}/{name}")]
    NotFound {
        /// Tenant that was searched.
        tenant_id: String,
        /// Function name.
        name: String,
    },

    /// A function with the same name already exists for the tenant.
    #[error("Function already exists: {tenant_id}/{name}")]
    AlreadyExists {
        /// Tenant owning the function.
        tenant_id: String,
        /// Function name.
        name: String,
    },

    /// Runtime identifier is not in the supported set.
    #[error("Unsupported runtime: {0}")]
    UnsupportedRuntime(String),

    /// Both the durable and the in-memory registry failed.
    #[error("Registry backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Function has aliases or active triggers and `force` was not set.
    #[error(
        "Function {name} has {aliases} aliases and {triggers} active triggers. Use force=true to delete anyway."
    )]
    HasDependents {
        /// Function name.
        name: String,
        /// Number of aliases pointing at the function.
        aliases: usize,
        /// Number of active triggers bound to the function.
        triggers: usize,
    },

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The deployment orchestrator is no longer accepting jobs.
    #[error("Deployment orchestrator is shut down")]
    OrchestratorStopped,
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(tenant_id: &str, name: &str) -> Self {
        Error::NotFound {
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
        }
    }
}

/// Result type using vajra-functions Error.
pub type Result<T> = std::result::Result<T, Error>;
