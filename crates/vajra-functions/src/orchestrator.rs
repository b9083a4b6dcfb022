// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment orchestrator.
//!
//! Creation and version operations enqueue a [`DeployJob`] and return at once.
//! A pool of workers drains the queue and drives each record through
//!
//! ```text
//! deploying ──▶ building ──┬──▶ deployed   (endpoint set)
//!                          └──▶ failed     (error set)
//! ```
//!
//! Each transition is a single registry write guarded by the version and status
//! it replaces, so it never overwrites a newer version or another writer's
//! aliases and triggers. If the registry fails at any transition the job is
//! abandoned, leaving the record in its last recorded status. Jobs are never retried; [`Orchestrator::recover`]
//! re-enqueues unfinished records when the process starts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactStore;
use crate::dispatcher::list_entries;
use crate::error::{Error, Result};
use crate::model::{FunctionRecord, FunctionStatus};
use crate::registry::{Registry, StatusChange};

/// A request to deploy one version of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployJob {
    /// Owning tenant
    pub tenant_id: String,
    /// Function name
    pub name: String,
    /// Version to deploy; stale jobs are skipped
    pub version: u32,
}

impl DeployJob {
    /// Job for the record's current version.
    pub fn for_record(record: &FunctionRecord) -> Self {
        Self {
            tenant_id: record.tenant_id.clone(),
            name: record.name.clone(),
            version: record.version,
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Record reached `deployed`
    Deployed,
    /// Record reached `failed`
    Failed,
    /// Registry failed mid-way; record left at its last recorded status
    Abandoned,
    /// Nothing to do: record deleted, superseded, or already terminal
    Skipped,
}

/// Build failure, stored on the record's `error` field.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct BuildError(pub String);

/// Performs the build step between `building` and a terminal status.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Build the record's current version.
    async fn build(&self, record: &FunctionRecord) -> std::result::Result<(), BuildError>;
}

/// Default builder: checks the artifact is present, intact and a readable
/// archive, after an optional simulated build delay.
pub struct BundleBuilder {
    artifacts: Arc<dyn ArtifactStore>,
    delay: Duration,
}

impl BundleBuilder {
    /// Create a builder reading from `artifacts`.
    pub fn new(artifacts: Arc<dyn ArtifactStore>, delay: Duration) -> Self {
        Self { artifacts, delay }
    }
}

#[async_trait]
impl Builder for BundleBuilder {
    async fn build(&self, record: &FunctionRecord) -> std::result::Result<(), BuildError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let bytes = self
            .artifacts
            .get(&record.code_ref)
            .await
            .map_err(|e| BuildError(format!("Artifact unavailable: {}", e)))?;
        let entries =
            list_entries(&bytes).map_err(|e| BuildError(format!("Unreadable bundle: {}", e)))?;
        if entries.is_empty() {
            return Err(BuildError("Bundle contains no files".to_string()));
        }

        debug!(
            function = %record.name,
            version = record.version,
            files = entries.len(),
            "Bundle verified"
        );
        Ok(())
    }
}

/// Job queue plus worker pool.
pub struct Orchestrator {
    registry: Arc<dyn Registry>,
    builder: Arc<dyn Builder>,
    endpoint_base: String,
    sender: mpsc::UnboundedSender<DeployJob>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<DeployJob>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    /// Create an orchestrator. No workers run until [`spawn_workers`](Self::spawn_workers).
    pub fn new(
        registry: Arc<dyn Registry>,
        builder: Arc<dyn Builder>,
        endpoint_base: impl Into<String>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            builder,
            endpoint_base: endpoint_base.into().trim_end_matches('/').to_string(),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            shutdown_tx,
        }
    }

    /// Endpoint a deployed version is served at.
    pub fn endpoint_for(&self, record: &FunctionRecord) -> String {
        format!(
            "{}/{}/{}/v{}",
            self.endpoint_base, record.tenant_id, record.name, record.version
        )
    }

    /// Enqueue a deployment. Never waits for the deployment itself.
    pub fn schedule_deploy(&self, job: DeployJob) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(Error::OrchestratorStopped);
        }
        debug!(
            tenant_id = %job.tenant_id,
            function = %job.name,
            version = job.version,
            "Deployment scheduled"
        );
        self.sender
            .send(job)
            .map_err(|_| Error::OrchestratorStopped)
    }

    /// Start `count` workers draining the queue.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        info!(workers = count, "Starting deployment workers");
        (0..count)
            .map(|worker_id| {
                let orchestrator = self.clone();
                tokio::spawn(async move { orchestrator.worker_loop(worker_id).await })
            })
            .collect()
    }

    /// Ask workers to stop after their current job.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Re-enqueue every record left in `deploying` or `building`.
    pub async fn recover(&self) -> Result<usize> {
        let pending = self
            .registry
            .list_by_status(&[FunctionStatus::Deploying, FunctionStatus::Building])
            .await?
            .value;

        for record in &pending {
            info!(
                tenant_id = %record.tenant_id,
                function = %record.name,
                version = record.version,
                status = %record.status,
                "Recovering unfinished deployment"
            );
            self.schedule_deploy(DeployJob::for_record(record))?;
        }
        Ok(pending.len())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        debug!(worker_id, "Deployment worker started");

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            let job = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => None,
                    job = receiver.recv() => job,
                }
            };
            let Some(job) = job else {
                break;
            };

            let outcome = self.process_job(&job).await;
            debug!(
                worker_id,
                tenant_id = %job.tenant_id,
                function = %job.name,
                version = job.version,
                outcome = ?outcome,
                "Deployment job finished"
            );
        }

        debug!(worker_id, "Deployment worker stopped");
    }

    /// Read the job's record if it is still the version the job targets.
    async fn current(&self, job: &DeployJob) -> Result<Option<FunctionRecord>> {
        let record = self
            .registry
            .get(&job.tenant_id, &job.name)
            .await?
            .value;
        Ok(record.filter(|r| r.version == job.version))
    }

    /// Move `record` to `next` if the registry still holds it at its current
    /// status. Returns whether the change was applied.
    async fn transition(
        &self,
        record: &FunctionRecord,
        next: FunctionStatus,
        endpoint: Option<String>,
        error: Option<String>,
    ) -> Result<bool> {
        if !record.status.can_transition_to(next) {
            return Ok(false);
        }

        let change = StatusChange {
            tenant_id: record.tenant_id.clone(),
            name: record.name.clone(),
            version: record.version,
            from: record.status,
            to: next,
            endpoint,
            error,
            updated_at: Utc::now(),
        };
        let written = self.registry.update_status(&change).await?;
        if !written.value {
            debug!(
                function = %record.name,
                version = record.version,
                status = %next,
                "Record changed underneath the job"
            );
            return Ok(false);
        }

        info!(
            tenant_id = %record.tenant_id,
            function = %record.name,
            version = record.version,
            status = %next,
            source = %written.source,
            "Deployment status changed"
        );
        Ok(true)
    }

    /// Drive one job to completion.
    pub async fn process_job(&self, job: &DeployJob) -> JobOutcome {
        let mut record = match self.current(job).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(function = %job.name, version = job.version, "Job superseded or function deleted");
                return JobOutcome::Skipped;
            }
            Err(e) => return self.abandon(job, FunctionStatus::Deploying, e),
        };

        match record.status {
            FunctionStatus::Deploying => {
                match self
                    .transition(&record, FunctionStatus::Building, None, None)
                    .await
                {
                    Ok(true) => record.status = FunctionStatus::Building,
                    Ok(false) => return JobOutcome::Skipped,
                    Err(e) => return self.abandon(job, FunctionStatus::Building, e),
                }
            }
            // Interrupted mid-build by a restart
            FunctionStatus::Building => {}
            FunctionStatus::Deployed | FunctionStatus::Failed => return JobOutcome::Skipped,
        }

        let (next, outcome, endpoint, error) = match self.builder.build(&record).await {
            Ok(()) => (
                FunctionStatus::Deployed,
                JobOutcome::Deployed,
                Some(self.endpoint_for(&record)),
                None,
            ),
            Err(e) => {
                warn!(
                    tenant_id = %job.tenant_id,
                    function = %job.name,
                    version = job.version,
                    error = %e,
                    "Build failed"
                );
                (FunctionStatus::Failed, JobOutcome::Failed, None, Some(e.0))
            }
        };

        match self.transition(&record, next, endpoint, error).await {
            Ok(true) => outcome,
            Ok(false) => JobOutcome::Skipped,
            Err(e) => self.abandon(job, next, e),
        }
    }

    fn abandon(&self, job: &DeployJob, attempted: FunctionStatus, e: Error) -> JobOutcome {
        error!(
            tenant_id = %job.tenant_id,
            function = %job.name,
            version = job.version,
            attempted = %attempted,
            error = %e,
            "Registry unavailable, abandoning deployment"
        );
        JobOutcome::Abandoned
    }
}
