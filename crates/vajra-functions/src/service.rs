// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function service.
//!
//! The operations exposed to the HTTP, auth and CLI layers. Every operation
//! receives an already-resolved tenant ID and trusts it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::accounting::{Accounting, FunctionMetrics, LogEntry};
use crate::artifact::ArtifactStore;
use crate::dispatcher::{Dispatcher, ExecutionError};
use crate::error::{Error, Result};
use crate::model::{
    CodeRef, FunctionRecord, FunctionRecordBuilder, FunctionStatus, FunctionVersion, Runtime, Trigger,
    validate_handler, validate_name,
};
use crate::orchestrator::{DeployJob, Orchestrator};
use crate::registry::{Registry, Sourced, StorageSource};

/// Smallest accepted memory envelope.
pub const MIN_MEMORY_MB: u32 = 64;
/// Largest accepted memory envelope.
pub const MAX_MEMORY_MB: u32 = 10240;
/// Largest accepted timeout.
pub const MAX_TIMEOUT_SECONDS: u32 = 900;

/// Input to [`FunctionService::create_function`].
#[derive(Debug, Clone)]
pub struct CreateFunctionRequest {
    /// Function name, unique within the tenant
    pub name: String,
    /// Runtime identifier, e.g. `python3.11`
    pub runtime: String,
    /// Entry point, `symbol` or `module.symbol`
    pub handler: String,
    /// Memory envelope
    pub memory_mb: u32,
    /// Wall-clock limit for subprocess runtimes
    pub timeout_seconds: u32,
    /// Environment passed to the handler
    pub environment: HashMap<String, String>,
    /// Free-form description
    pub description: String,
    /// Zipped code bundle
    pub bundle: Vec<u8>,
}

impl Default for CreateFunctionRequest {
    fn default() -> Self {
        Self {
            name: String::new(),
            runtime: String::new(),
            handler: "main".to_string(),
            memory_mb: 512,
            timeout_seconds: 30,
            environment: HashMap::new(),
            description: String::new(),
            bundle: Vec::new(),
        }
    }
}

/// Result of [`FunctionService::create_function`].
#[derive(Debug, Clone, Serialize)]
pub struct CreateFunctionResponse {
    /// Generated function ID
    pub id: String,
    /// Function name
    pub name: String,
    /// Always `deploying`
    pub status: FunctionStatus,
    /// Always 1
    pub version: u32,
    /// Backend holding the record
    pub source: StorageSource,
}

/// Diagnostics attached to test invocations.
#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
    /// Always true
    pub test_mode: bool,
    /// When the invocation started
    pub timestamp: DateTime<Utc>,
    /// Runtime of the invoked version
    pub runtime: Runtime,
    /// Handler of the invoked version
    pub handler: String,
    /// Memory envelope
    pub memory_mb: u32,
    /// Deployment status at invocation time
    pub function_status: FunctionStatus,
}

/// Result of [`FunctionService::invoke_function`].
///
/// Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize)]
pub struct InvokeResponse {
    /// Function name
    pub function: String,
    /// Version that ran
    pub version: u32,
    /// `success` or `error`
    pub status_label: String,
    /// Handler output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Structured failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Wall-clock time of the execution
    pub execution_time_ms: u64,
    /// Present for test invocations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugInfo>,
}

/// Result of [`FunctionService::delete_function`].
#[derive(Debug, Clone, Serialize)]
pub struct DeleteFunctionResponse {
    /// Always `deleted`
    pub status: String,
    /// Function name
    pub name: String,
    /// Number of artifacts removed
    pub artifacts_removed: usize,
}

/// Result of [`FunctionService::create_version`].
#[derive(Debug, Clone, Serialize)]
pub struct CreateVersionResponse {
    /// New version number
    pub version: u32,
    /// Description of the new version
    pub description: String,
    /// Always `deploying`
    pub status: FunctionStatus,
}

/// Result of [`FunctionService::delete_all_functions`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteAllResponse {
    /// Names deleted
    pub deleted: Vec<String>,
    /// Names that could not be deleted
    pub failed: Vec<String>,
}

/// Function lifecycle and invocation operations.
pub struct FunctionService {
    registry: Arc<dyn Registry>,
    artifacts: Arc<dyn ArtifactStore>,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<Orchestrator>,
    accounting: Accounting,
}

impl FunctionService {
    /// Assemble a service from its components.
    pub fn new(
        registry: Arc<dyn Registry>,
        artifacts: Arc<dyn ArtifactStore>,
        dispatcher: Arc<Dispatcher>,
        orchestrator: Arc<Orchestrator>,
        accounting: Accounting,
    ) -> Self {
        Self {
            registry,
            artifacts,
            dispatcher,
            orchestrator,
            accounting,
        }
    }

    /// Registry used by the service.
    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Artifact store used by the service.
    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Orchestrator used by the service.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    async fn require(&self, tenant_id: &str, name: &str) -> Result<Sourced<FunctionRecord>> {
        let found = self.registry.get(tenant_id, name).await?;
        match found.value {
            Some(record) => Ok(Sourced {
                value: record,
                source: found.source,
            }),
            None => Err(Error::not_found(tenant_id, name)),
        }
    }

    fn schedule(&self, record: &FunctionRecord) {
        if let Err(e) = self
            .orchestrator
            .schedule_deploy(DeployJob::for_record(record))
        {
            // Picked up by recovery on the next start.
            warn!(
                tenant_id = %record.tenant_id,
                function = %record.name,
                version = record.version,
                error = %e,
                "Failed to schedule deployment"
            );
        }
    }

    /// Remove an artifact written by a create that did not win the name,
    /// unless the live record points at the same bytes.
    async fn discard_artifact(&self, code_ref: &CodeRef) {
        if let Ok(found) = self.registry.get(&code_ref.tenant_id, &code_ref.name).await {
            if found.value.is_some_and(|live| live.code_ref == *code_ref) {
                return;
            }
        }
        if let Err(e) = self.artifacts.delete(code_ref).await {
            warn!(key = %code_ref, error = %e, "Failed to remove orphaned artifact");
        }
    }

    /// Upload a bundle and register a new function at version 1.
    pub async fn create_function(
        &self,
        tenant_id: &str,
        request: CreateFunctionRequest,
    ) -> Result<CreateFunctionResponse> {
        validate_name("tenant", tenant_id)?;
        validate_name("function name", &request.name)?;
        let runtime: Runtime = request.runtime.parse()?;
        validate_handler(&request.handler)?;
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&request.memory_mb) {
            return Err(Error::InvalidRequest(format!(
                "memory_mb must be between {} and {}",
                MIN_MEMORY_MB, MAX_MEMORY_MB
            )));
        }
        if !(1..=MAX_TIMEOUT_SECONDS).contains(&request.timeout_seconds) {
            return Err(Error::InvalidRequest(format!(
                "timeout_seconds must be between 1 and {}",
                MAX_TIMEOUT_SECONDS
            )));
        }
        if request.bundle.is_empty() {
            return Err(Error::InvalidRequest("Code bundle is empty".to_string()));
        }
        if self
            .registry
            .get(tenant_id, &request.name)
            .await?
            .value
            .is_some()
        {
            return Err(Error::AlreadyExists {
                tenant_id: tenant_id.to_string(),
                name: request.name,
            });
        }

        let code_ref = self
            .artifacts
            .put(tenant_id, &request.name, 1, &request.bundle)
            .await?;
        let record = FunctionRecordBuilder::new(tenant_id, &request.name, runtime, &request.handler)
            .memory_mb(request.memory_mb)
            .timeout_seconds(request.timeout_seconds)
            .environment(request.environment)
            .description(request.description)
            .build(code_ref);

        let written = match self.registry.insert(&record).await {
            Ok(written) if written.value => written,
            Ok(_) => {
                self.discard_artifact(&record.code_ref).await;
                return Err(Error::AlreadyExists {
                    tenant_id: tenant_id.to_string(),
                    name: record.name,
                });
            }
            Err(e) => {
                self.discard_artifact(&record.code_ref).await;
                return Err(e);
            }
        };
        if let Err(e) = self.registry.put_version(&record.version_snapshot()).await {
            warn!(function = %record.name, error = %e, "Failed to record version history");
        }

        info!(
            tenant_id = %tenant_id,
            function = %record.name,
            runtime = %runtime,
            source = %written.source,
            "Function created"
        );
        self.schedule(&record);

        Ok(CreateFunctionResponse {
            id: record.id,
            name: record.name,
            status: record.status,
            version: record.version,
            source: written.source,
        })
    }

    /// Fetch a function.
    pub async fn get_function(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Sourced<FunctionRecord>> {
        self.require(tenant_id, name).await
    }

    /// All functions of a tenant, order not guaranteed.
    pub async fn list_functions(&self, tenant_id: &str) -> Result<Sourced<Vec<FunctionRecord>>> {
        self.registry.list(tenant_id).await
    }

    /// Run a function with `payload`.
    ///
    /// Handler failures are reported in the response, not as `Err`.
    pub async fn invoke_function(
        &self,
        tenant_id: &str,
        name: &str,
        payload: Value,
        test_mode: bool,
    ) -> Result<InvokeResponse> {
        let record = self.require(tenant_id, name).await?.value;
        let started = Utc::now();

        let payload_size = serde_json::to_vec(&payload).map(|b| b.len()).unwrap_or(0);
        self.accounting
            .record_invocation(tenant_id, name, payload_size, test_mode)
            .await;

        let execution = self.dispatcher.execute(&record, &payload).await;
        let (result, error) = match execution.result {
            Ok(value) => (Some(value), None),
            Err(e) => {
                self.accounting
                    .record_error(tenant_id, name, &e.message)
                    .await;
                (None, Some(e))
            }
        };

        let debug = test_mode.then(|| DebugInfo {
            test_mode: true,
            timestamp: started,
            runtime: record.runtime,
            handler: record.handler.clone(),
            memory_mb: record.memory_mb,
            function_status: record.status,
        });

        Ok(InvokeResponse {
            function: record.name,
            version: record.version,
            status_label: if error.is_none() { "success" } else { "error" }.to_string(),
            result,
            error,
            execution_time_ms: execution.duration_ms,
            debug,
        })
    }

    /// Delete a function, its artifacts, version history and logs.
    ///
    /// Fails with [`Error::HasDependents`] when aliases or active triggers
    /// exist, unless `force` is set.
    pub async fn delete_function(
        &self,
        tenant_id: &str,
        name: &str,
        force: bool,
    ) -> Result<DeleteFunctionResponse> {
        let record = self.require(tenant_id, name).await?.value;

        let (aliases, triggers) = record.dependents();
        if !force && (aliases > 0 || triggers > 0) {
            return Err(Error::HasDependents {
                name: name.to_string(),
                aliases,
                triggers,
            });
        }

        let artifacts_removed = self.artifacts.delete_function(tenant_id, name).await?;
        self.registry.delete(tenant_id, name).await?;
        self.accounting.purge(tenant_id, name).await;

        info!(
            tenant_id = %tenant_id,
            function = %name,
            artifacts_removed,
            aliases,
            triggers,
            force,
            "Function deleted"
        );

        Ok(DeleteFunctionResponse {
            status: "deleted".to_string(),
            name: name.to_string(),
            artifacts_removed,
        })
    }

    /// Copy-on-write a new version of a function and deploy it.
    pub async fn create_version(
        &self,
        tenant_id: &str,
        name: &str,
        description: &str,
    ) -> Result<CreateVersionResponse> {
        let current = self.require(tenant_id, name).await?.value;
        let next = current.next_version(description);

        self.registry.put_version(&next.version_snapshot()).await?;
        self.registry.put(&next).await?;

        info!(
            tenant_id = %tenant_id,
            function = %name,
            version = next.version,
            "Version created"
        );
        self.schedule(&next);

        Ok(CreateVersionResponse {
            version: next.version,
            description: next.description,
            status: next.status,
        })
    }

    /// Version history of a function, oldest first.
    pub async fn list_versions(&self, tenant_id: &str, name: &str) -> Result<Vec<FunctionVersion>> {
        self.require(tenant_id, name).await?;
        Ok(self
            .registry
            .list_versions(tenant_id, name)
            .await?
            .into_inner())
    }

    /// Point `alias` at an existing version.
    pub async fn create_alias(
        &self,
        tenant_id: &str,
        name: &str,
        alias: &str,
        version: u32,
    ) -> Result<FunctionRecord> {
        validate_name("alias", alias)?;
        let record = self.require(tenant_id, name).await?.value;
        if version == 0 || version > record.version {
            return Err(Error::InvalidRequest(format!(
                "Version {} does not exist for {}",
                version, name
            )));
        }

        if !self
            .registry
            .set_alias(tenant_id, name, alias, version)
            .await?
            .value
        {
            return Err(Error::not_found(tenant_id, name));
        }
        info!(tenant_id = %tenant_id, function = %name, alias, version, "Alias created");
        Ok(self.require(tenant_id, name).await?.value)
    }

    /// Bind an active trigger to a function.
    pub async fn create_trigger(
        &self,
        tenant_id: &str,
        name: &str,
        trigger_type: &str,
        config: Value,
    ) -> Result<Trigger> {
        if trigger_type.trim().is_empty() {
            return Err(Error::InvalidRequest("Trigger type is required".to_string()));
        }
        self.require(tenant_id, name).await?;

        let trigger = Trigger {
            trigger_id: uuid::Uuid::new_v4().to_string(),
            trigger_type: trigger_type.to_string(),
            config,
            status: "active".to_string(),
            created_at: Utc::now(),
        };
        if !self
            .registry
            .add_trigger(tenant_id, name, &trigger)
            .await?
            .value
        {
            return Err(Error::not_found(tenant_id, name));
        }
        info!(
            tenant_id = %tenant_id,
            function = %name,
            trigger_id = %trigger.trigger_id,
            trigger_type,
            "Trigger created"
        );
        Ok(trigger)
    }

    /// Recent invocation log entries, newest first.
    pub async fn function_logs(
        &self,
        tenant_id: &str,
        name: &str,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        self.require(tenant_id, name).await?;
        self.accounting.logs(tenant_id, name, limit).await
    }

    /// Counter-derived metrics.
    pub async fn function_metrics(&self, tenant_id: &str, name: &str) -> Result<FunctionMetrics> {
        let record = self.require(tenant_id, name).await?.value;
        Ok(FunctionMetrics::from_record(&record))
    }

    /// Force-delete every function of a tenant.
    pub async fn delete_all_functions(&self, tenant_id: &str) -> Result<DeleteAllResponse> {
        let functions = self.registry.list(tenant_id).await?.value;
        let mut response = DeleteAllResponse::default();

        for record in functions {
            match self.delete_function(tenant_id, &record.name, true).await {
                Ok(_) => response.deleted.push(record.name),
                Err(e) => {
                    warn!(tenant_id = %tenant_id, function = %record.name, error = %e, "Failed to delete function");
                    response.failed.push(record.name);
                }
            }
        }

        info!(
            tenant_id = %tenant_id,
            deleted = response.deleted.len(),
            failed = response.failed.len(),
            "Deleted all functions"
        );
        Ok(response)
    }
}
