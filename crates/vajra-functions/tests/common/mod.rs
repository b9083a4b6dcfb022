// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for vajra-functions integration tests.
//!
//! Provides TestContext wiring a memory-backed service with live deployment
//! workers, plus bundle and wasm module fixtures.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use vajra_functions::accounting::{Accounting, MemoryLogSink};
use vajra_functions::artifact::{ArtifactStore, MemoryArtifactStore};
use vajra_functions::config::Config;
use vajra_functions::dispatcher::Dispatcher;
use vajra_functions::error::{Error, Result};
use vajra_functions::model::{FunctionRecord, FunctionStatus, FunctionVersion, Trigger};
use vajra_functions::orchestrator::{BundleBuilder, Orchestrator};
use vajra_functions::registry::{Counter, MemoryRegistry, Registry, Sourced, StatusChange};
use vajra_functions::service::{CreateFunctionRequest, FunctionService};

/// Tenant used by most tests.
pub const TENANT: &str = "tenant-a";

/// Echoes its JSON payload back from `main`.
pub const ECHO_WAT: &str = r#"
    (module
      (memory (export "memory") 1)
      (global $heap (mut i32) (i32.const 1024))
      (func (export "alloc") (param $len i32) (result i32)
        (local $ptr i32)
        (local.set $ptr (global.get $heap))
        (global.set $heap (i32.add (global.get $heap) (local.get $len)))
        (local.get $ptr))
      (func (export "main") (param $ptr i32) (param $len i32) (result i64)
        (i64.or
          (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
          (i64.extend_i32_u (local.get $len))))
      (func (export "crash") (param i32 i32) (result i64)
        unreachable))
"#;

/// `main` returns `{"message":"Hello Vajra!"}` (26 bytes at offset 16).
pub const HELLO_WAT: &str = r##"
    (module
      (memory (export "memory") 1)
      (data (i32.const 16) "{\"message\":\"Hello Vajra!\"}")
      (global $heap (mut i32) (i32.const 1024))
      (func (export "alloc") (param $len i32) (result i32)
        (local $ptr i32)
        (local.set $ptr (global.get $heap))
        (global.set $heap (i32.add (global.get $heap) (local.get $len)))
        (local.get $ptr))
      (func (export "main") (param i32 i32) (result i64)
        (i64.const 68719476762)))
"##;

/// Zip `files` (path, contents) into a bundle.
pub fn bundle(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (path, contents) in files {
        writer.start_file(*path, options).expect("Failed to start zip entry");
        writer.write_all(contents).expect("Failed to write zip entry");
    }
    writer
        .finish()
        .expect("Failed to finish zip")
        .into_inner()
}

/// Bundle holding `main.wasm` compiled from WAT text.
pub fn wasm_bundle(wat: &str) -> Vec<u8> {
    bundle(&[("main.wasm", wat.as_bytes())])
}

/// Create request for a wasm function.
pub fn wasm_request(name: &str, wat: &str) -> CreateFunctionRequest {
    CreateFunctionRequest {
        name: name.to_string(),
        runtime: "wasm".to_string(),
        bundle: wasm_bundle(wat),
        ..Default::default()
    }
}

/// Whether an interpreter can be spawned.
pub fn interpreter_available(bin: &str) -> bool {
    std::process::Command::new(bin)
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Memory-backed service with running deployment workers.
pub struct TestContext {
    pub service: Arc<FunctionService>,
    pub registry: Arc<dyn Registry>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub workers: Vec<JoinHandle<()>>,
    pub config: Config,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Context over a fresh [`MemoryRegistry`].
    pub fn new() -> Self {
        Self::with_registry(Arc::new(MemoryRegistry::new()))
    }

    /// Context over the given registry.
    pub fn with_registry(registry: Arc<dyn Registry>) -> Self {
        Self::build(registry, 2)
    }

    /// Context with no deployment workers; jobs only run through
    /// `orchestrator.process_job`.
    pub fn idle(registry: Arc<dyn Registry>) -> Self {
        Self::build(registry, 0)
    }

    fn build(registry: Arc<dyn Registry>, deploy_workers: usize) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            deploy_workers,
            ..Config::default()
        };

        let artifacts = Arc::new(MemoryArtifactStore::new());
        let store: Arc<dyn ArtifactStore> = artifacts.clone();

        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            Arc::new(BundleBuilder::new(store.clone(), Duration::ZERO)),
            &config.endpoint_base,
        ));
        let dispatcher = Arc::new(Dispatcher::with_default_loaders(store.clone(), &config));
        let accounting = Accounting::new(
            registry.clone(),
            Arc::new(MemoryLogSink::new(config.log_retention)),
        );
        let service = Arc::new(FunctionService::new(
            registry.clone(),
            store,
            dispatcher,
            orchestrator.clone(),
            accounting,
        ));
        let workers = orchestrator.spawn_workers(config.deploy_workers);

        Self {
            service,
            registry,
            artifacts,
            orchestrator,
            workers,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Poll until the function reaches `deployed` or `failed`.
    pub async fn settled(&self, name: &str) -> FunctionRecord {
        for _ in 0..400 {
            let record = self
                .service
                .get_function(TENANT, name)
                .await
                .expect("Failed to get function")
                .value;
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("Function {} never settled", name);
    }

    /// Stop the workers and wait for them.
    pub async fn shutdown(self) {
        self.orchestrator.shutdown();
        for worker in self.workers {
            worker.await.expect("Worker panicked");
        }
    }
}

/// Memory registry whose writes can be switched to fail and whose reads can
/// be held back after they are taken.
#[derive(Default)]
pub struct FlakyRegistry {
    inner: MemoryRegistry,
    fail_writes: AtomicBool,
    read_delay_ms: AtomicU64,
}

impl FlakyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay returning each `get` result by `delay`.
    pub fn delay_reads(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable("write rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for FlakyRegistry {
    async fn put(&self, record: &FunctionRecord) -> Result<Sourced<()>> {
        self.check()?;
        self.inner.put(record).await
    }

    async fn insert(&self, record: &FunctionRecord) -> Result<Sourced<bool>> {
        self.check()?;
        self.inner.insert(record).await
    }

    async fn update_status(&self, change: &StatusChange) -> Result<Sourced<bool>> {
        self.check()?;
        self.inner.update_status(change).await
    }

    async fn set_alias(
        &self,
        tenant_id: &str,
        name: &str,
        alias: &str,
        version: u32,
    ) -> Result<Sourced<bool>> {
        self.check()?;
        self.inner.set_alias(tenant_id, name, alias, version).await
    }

    async fn add_trigger(
        &self,
        tenant_id: &str,
        name: &str,
        trigger: &Trigger,
    ) -> Result<Sourced<bool>> {
        self.check()?;
        self.inner.add_trigger(tenant_id, name, trigger).await
    }

    async fn get(&self, tenant_id: &str, name: &str) -> Result<Sourced<Option<FunctionRecord>>> {
        let found = self.inner.get(tenant_id, name).await;
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        found
    }

    async fn list(&self, tenant_id: &str) -> Result<Sourced<Vec<FunctionRecord>>> {
        self.inner.list(tenant_id).await
    }

    async fn delete(&self, tenant_id: &str, name: &str) -> Result<Sourced<bool>> {
        self.check()?;
        self.inner.delete(tenant_id, name).await
    }

    async fn increment_counter(
        &self,
        tenant_id: &str,
        name: &str,
        counter: Counter,
    ) -> Result<Sourced<bool>> {
        self.check()?;
        self.inner.increment_counter(tenant_id, name, counter).await
    }

    async fn put_version(&self, version: &FunctionVersion) -> Result<Sourced<()>> {
        self.check()?;
        self.inner.put_version(version).await
    }

    async fn list_versions(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Sourced<Vec<FunctionVersion>>> {
        self.inner.list_versions(tenant_id, name).await
    }

    async fn list_by_status(
        &self,
        statuses: &[FunctionStatus],
    ) -> Result<Sourced<Vec<FunctionRecord>>> {
        self.inner.list_by_status(statuses).await
    }
}
