// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for vajra-functions.
//!
//! [`FunctionRuntime`] wires the registry, artifact store, orchestrator,
//! dispatcher and accounting together, recovers unfinished deployments and
//! runs the deployment workers inside an existing tokio application.
//!
//! ```rust,ignore
//! use vajra_functions::runtime::FunctionRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = FunctionRuntime::builder()
//!         .pool(pool)
//!         .data_dir("/var/lib/vajra")
//!         .deploy_workers(8)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let functions = runtime.service();
//!     // ... serve requests ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Without a pool the runtime runs memory-only.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::accounting::{Accounting, LogSink, MemoryLogSink};
use crate::artifact::{ArtifactStore, FsArtifactStore};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, HandlerLoader};
use crate::model::RuntimeFamily;
use crate::orchestrator::{Builder, BundleBuilder, Orchestrator};
use crate::registry::{DurableRegistry, FallbackRegistry, MemoryRegistry, Registry};
use crate::service::FunctionService;

/// Builder for creating a [`FunctionRuntime`].
#[derive(Default)]
pub struct FunctionRuntimeBuilder {
    pool: Option<PgPool>,
    config: Config,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    builder: Option<Arc<dyn Builder>>,
    log_sink: Option<Arc<dyn LogSink>>,
    loaders: Vec<(RuntimeFamily, Arc<dyn HandlerLoader>)>,
}

impl FunctionRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded [`Config`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the PostgreSQL pool for the durable registry.
    ///
    /// The durable registry is wrapped in a fallback to an in-memory registry.
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the data directory for artifacts and workspaces.
    ///
    /// Default: `.data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the number of deployment workers.
    ///
    /// Default: 4
    pub fn deploy_workers(mut self, workers: usize) -> Self {
        self.config.deploy_workers = workers;
        self
    }

    /// Set the simulated build duration.
    ///
    /// Default: zero
    pub fn build_delay(mut self, delay: Duration) -> Self {
        self.config.build_delay = delay;
        self
    }

    /// Set the base URL for deployed endpoints.
    pub fn endpoint_base(mut self, base: impl Into<String>) -> Self {
        self.config.endpoint_base = base.into();
        self
    }

    /// Replace the artifact store.
    ///
    /// Default: [`FsArtifactStore`] under `{data_dir}/artifacts`
    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Replace the build step.
    ///
    /// Default: [`BundleBuilder`]
    pub fn builder(mut self, builder: Arc<dyn Builder>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Replace the invocation log sink.
    ///
    /// Default: [`MemoryLogSink`] retaining `log_retention` entries
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Register an additional (or replacement) handler loader.
    pub fn loader(mut self, family: RuntimeFamily, loader: Arc<dyn HandlerLoader>) -> Self {
        self.loaders.push((family, loader));
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if the settings are unusable.
    pub fn build(self) -> Result<FunctionRuntimeConfig> {
        if self.config.deploy_workers == 0 {
            anyhow::bail!("deploy_workers must be at least 1");
        }

        Ok(FunctionRuntimeConfig {
            pool: self.pool,
            config: self.config,
            artifacts: self.artifacts,
            builder: self.builder,
            log_sink: self.log_sink,
            loaders: self.loaders,
        })
    }
}

/// Configuration for a [`FunctionRuntime`].
pub struct FunctionRuntimeConfig {
    pool: Option<PgPool>,
    config: Config,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    builder: Option<Arc<dyn Builder>>,
    log_sink: Option<Arc<dyn LogSink>>,
    loaders: Vec<(RuntimeFamily, Arc<dyn HandlerLoader>)>,
}

impl FunctionRuntimeConfig {
    /// Wire the components, recover unfinished deployments and start workers.
    pub async fn start(self) -> Result<FunctionRuntime> {
        let config = self.config;

        let registry: Arc<dyn Registry> = match self.pool {
            Some(pool) => Arc::new(FallbackRegistry::new(
                Arc::new(DurableRegistry::new(pool)),
                Arc::new(MemoryRegistry::new()),
            )),
            None => {
                warn!("No database configured, function registry is memory-only");
                Arc::new(MemoryRegistry::new())
            }
        };

        let artifacts: Arc<dyn ArtifactStore> = match self.artifacts {
            Some(artifacts) => artifacts,
            None => Arc::new(FsArtifactStore::in_data_dir(&config.data_dir)),
        };
        let builder: Arc<dyn Builder> = match self.builder {
            Some(builder) => builder,
            None => Arc::new(BundleBuilder::new(artifacts.clone(), config.build_delay)),
        };
        let sink: Arc<dyn LogSink> = match self.log_sink {
            Some(sink) => sink,
            None => Arc::new(MemoryLogSink::new(config.log_retention)),
        };

        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            builder,
            &config.endpoint_base,
        ));

        let dispatcher = self.loaders.into_iter().fold(
            Dispatcher::with_default_loaders(artifacts.clone(), &config),
            |dispatcher, (family, loader)| dispatcher.with_loader(family, loader),
        );

        let service = Arc::new(FunctionService::new(
            registry.clone(),
            artifacts,
            Arc::new(dispatcher),
            orchestrator.clone(),
            Accounting::new(registry, sink),
        ));

        match orchestrator.recover().await {
            Ok(0) => {}
            Ok(count) => info!(count, "Re-enqueued unfinished deployments"),
            Err(e) => warn!(error = %e, "Failed to recover unfinished deployments"),
        }

        let workers = orchestrator.spawn_workers(config.deploy_workers);

        info!(
            data_dir = %config.data_dir.display(),
            workers = config.deploy_workers,
            "FunctionRuntime started"
        );

        Ok(FunctionRuntime {
            service,
            orchestrator,
            workers,
        })
    }
}

/// A running vajra-functions instance that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FunctionRuntime {
    service: Arc<FunctionService>,
    orchestrator: Arc<Orchestrator>,
    workers: Vec<JoinHandle<()>>,
}

impl FunctionRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FunctionRuntimeBuilder {
        FunctionRuntimeBuilder::new()
    }

    /// The function service.
    pub fn service(&self) -> Arc<FunctionService> {
        self.service.clone()
    }

    /// Check if all deployment workers are still running.
    pub fn is_running(&self) -> bool {
        self.workers.iter().all(|worker| !worker.is_finished())
    }

    /// Stop the deployment workers after their current jobs.
    pub async fn shutdown(self) -> Result<()> {
        info!("FunctionRuntime shutting down...");
        self.orchestrator.shutdown();

        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Deployment worker task panicked: {}", e);
            }
        }

        info!("FunctionRuntime shutdown complete");
        Ok(())
    }
}
