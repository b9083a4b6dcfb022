// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution dispatcher.
//!
//! Resolves a function's runtime family to a [`HandlerLoader`], materialises
//! the function's bundle in a scoped [`Workspace`] and runs the handler.
//!
//! ```text
//! record ──▶ loader for family? ──no──▶ UnsupportedRuntime
//!                 │ yes
//!                 ▼
//!          fetch artifact ──▶ unpack into workspace ──▶ loader.invoke
//!                                                          │
//!                         workspace dropped on every path ◀┘
//! ```
//!
//! User-code failures never surface as [`crate::Error`]; they are returned as
//! [`ExecutionError`] values inside [`Execution`].

mod subprocess;
mod wasm;
mod workspace;

pub use subprocess::{SubprocessLoader, SubprocessRuntime};
pub use wasm::WasmLoader;
pub use workspace::{BundleError, Workspace, list_entries};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;
use crate::config::Config;
use crate::model::{FunctionRecord, RuntimeFamily};

/// Category of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// No loader is registered for the runtime family.
    UnsupportedRuntime,
    /// Entry file or handler symbol is missing from the bundle.
    HandlerNotFound,
    /// The handler ran and raised an error.
    HandlerError,
    /// The platform could not run the handler, or its output was unusable.
    ExecutionFailure,
    /// The handler exceeded its wall-clock limit.
    Timeout,
}

/// Structured execution error returned as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ExecutionError {
    /// Failure category
    pub kind: ExecutionErrorKind,
    /// Human-readable message
    pub message: String,
    /// Captured standard error, when a child process was involved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl ExecutionError {
    /// Create an error without stderr.
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stderr: None,
        }
    }

    /// Attach captured stderr.
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        if !stderr.trim().is_empty() {
            self.stderr = Some(stderr);
        }
        self
    }

    /// `HandlerNotFound` shorthand.
    pub fn handler_not_found(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::HandlerNotFound, message)
    }

    /// `ExecutionFailure` shorthand.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::ExecutionFailure, message)
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Handler output or structured error
    pub result: Result<Value, ExecutionError>,
    /// Wall-clock time including artifact fetch and unpack
    pub duration_ms: u64,
}

impl Execution {
    /// Whether the handler produced a result.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs a handler for one runtime family inside an unpacked workspace.
#[async_trait]
pub trait HandlerLoader: Send + Sync {
    /// Strategy label used in logs, e.g. `wasm` or `subprocess`.
    fn strategy(&self) -> &'static str;

    /// Invoke the record's handler with `payload`.
    async fn invoke(
        &self,
        record: &FunctionRecord,
        workspace: &Workspace,
        payload: &Value,
    ) -> Result<Value, ExecutionError>;
}

/// Dispatches invocations to the loader registered for each runtime family.
pub struct Dispatcher {
    artifacts: Arc<dyn ArtifactStore>,
    loaders: HashMap<RuntimeFamily, Arc<dyn HandlerLoader>>,
    workspace_root: PathBuf,
}

impl Dispatcher {
    /// Dispatcher with no loaders registered.
    pub fn new(artifacts: Arc<dyn ArtifactStore>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            artifacts,
            loaders: HashMap::new(),
            workspace_root: workspace_root.into(),
        }
    }

    /// Dispatcher with the built-in loaders: wasm in-process, python and
    /// nodejs as subprocesses.
    pub fn with_default_loaders(artifacts: Arc<dyn ArtifactStore>, config: &Config) -> Self {
        Self::new(artifacts, config.data_dir.join("workspaces"))
            .with_loader(RuntimeFamily::Wasm, Arc::new(WasmLoader::new()))
            .with_loader(
                RuntimeFamily::Python,
                Arc::new(SubprocessLoader::new(
                    SubprocessRuntime::Python,
                    &config.python_bin,
                )),
            )
            .with_loader(
                RuntimeFamily::Node,
                Arc::new(SubprocessLoader::new(
                    SubprocessRuntime::Node,
                    &config.node_bin,
                )),
            )
    }

    /// Register (or replace) the loader for a runtime family.
    pub fn with_loader(mut self, family: RuntimeFamily, loader: Arc<dyn HandlerLoader>) -> Self {
        self.loaders.insert(family, loader);
        self
    }

    /// Directory under which invocation workspaces are created.
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Whether a loader exists for the family.
    pub fn supports(&self, family: RuntimeFamily) -> bool {
        self.loaders.contains_key(&family)
    }

    /// Run the record's current version with `payload`.
    pub async fn execute(&self, record: &FunctionRecord, payload: &Value) -> Execution {
        let start = Instant::now();
        let result = self.run(record, payload).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => info!(
                tenant_id = %record.tenant_id,
                function = %record.name,
                runtime = %record.runtime,
                duration_ms,
                "Invocation succeeded"
            ),
            Err(e) => warn!(
                tenant_id = %record.tenant_id,
                function = %record.name,
                runtime = %record.runtime,
                kind = ?e.kind,
                error = %e.message,
                duration_ms,
                "Invocation failed"
            ),
        }

        Execution {
            result,
            duration_ms,
        }
    }

    async fn run(&self, record: &FunctionRecord, payload: &Value) -> Result<Value, ExecutionError> {
        let family = record.runtime.family();
        let loader = self.loaders.get(&family).ok_or_else(|| {
            ExecutionError::new(
                ExecutionErrorKind::UnsupportedRuntime,
                format!("No execution strategy for runtime {}", record.runtime),
            )
        })?;

        let bytes = self
            .artifacts
            .get(&record.code_ref)
            .await
            .map_err(|e| ExecutionError::failure(format!("Failed to fetch artifact: {}", e)))?;

        let workspace = Workspace::create(&self.workspace_root)
            .map_err(|e| ExecutionError::failure(format!("Failed to create workspace: {}", e)))?;
        let files = workspace
            .unpack(bytes)
            .await
            .map_err(|e| ExecutionError::failure(format!("Failed to unpack bundle: {}", e)))?;

        debug!(
            function = %record.name,
            workspace = %workspace.path().display(),
            files,
            strategy = loader.strategy(),
            "Workspace ready"
        );

        loader.invoke(record, &workspace, payload).await
    }
}
