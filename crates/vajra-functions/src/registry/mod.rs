// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function registry.
//!
//! Every component reads and writes function metadata through [`Registry`].
//! Implementations tag each result with the backend that served it:
//!
//! - [`DurableRegistry`]: PostgreSQL, source `durable`
//! - [`MemoryRegistry`]: per-tenant in-process partitions, source `memory`
//! - [`FallbackRegistry`]: tries a primary, retries once on a fallback
//!
//! Writes never lower a record's `version` and never lower its counters, so a
//! stale read-modify-write cannot undo a newer version or lose increments.
//! Status, aliases and triggers have their own targeted writes
//! ([`Registry::update_status`], [`Registry::set_alias`],
//! [`Registry::add_trigger`]) so concurrent writers never overwrite each
//! other's fields.

mod fallback;
mod memory;
mod postgres;

pub use fallback::FallbackRegistry;
pub use memory::MemoryRegistry;
pub use postgres::DurableRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{FunctionRecord, FunctionStatus, FunctionVersion, Trigger};

/// Backend that served a registry operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageSource {
    /// PostgreSQL
    Durable,
    /// In-memory partition
    Memory,
}

impl std::fmt::Display for StorageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageSource::Durable => write!(f, "durable"),
            StorageSource::Memory => write!(f, "memory"),
        }
    }
}

/// A registry result together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    /// The result
    pub value: T,
    /// Backend that produced it
    pub source: StorageSource,
}

impl<T> Sourced<T> {
    /// Tag a value as served by the durable backend
    pub fn durable(value: T) -> Self {
        Self {
            value,
            source: StorageSource::Durable,
        }
    }

    /// Tag a value as served by the memory backend
    pub fn memory(value: T) -> Self {
        Self {
            value,
            source: StorageSource::Memory,
        }
    }

    /// Drop the provenance.
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Monotonic counters on a function record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// `invocation_count`
    Invocations,
    /// `error_count`
    Errors,
}

impl Counter {
    /// Column / field name.
    pub fn column(&self) -> &'static str {
        match self {
            Counter::Invocations => "invocation_count",
            Counter::Errors => "error_count",
        }
    }
}

/// A status write guarded by the version and status it expects to replace.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    /// Owning tenant
    pub tenant_id: String,
    /// Function name
    pub name: String,
    /// Version the change applies to
    pub version: u32,
    /// Status the stored record must hold
    pub from: FunctionStatus,
    /// Status to write
    pub to: FunctionStatus,
    /// Endpoint stored with `to`
    pub endpoint: Option<String>,
    /// Error stored with `to`
    pub error: Option<String>,
    /// New `updated_at`
    pub updated_at: DateTime<Utc>,
}

impl StatusChange {
    /// Whether `record` is the version and status this change expects.
    pub fn applies_to(&self, record: &FunctionRecord) -> bool {
        record.version == self.version && record.status == self.from
    }

    /// Write the change onto `record`.
    pub fn apply(&self, record: &mut FunctionRecord) {
        record.status = self.to;
        record.endpoint = self.endpoint.clone();
        record.error = self.error.clone();
        record.updated_at = self.updated_at;
    }
}

/// Storage for function records, partitioned by tenant.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Insert or replace a record.
    ///
    /// A write carrying a lower version than the stored record is ignored.
    /// Counters are merged by taking the larger value. Aliases and triggers
    /// are merged with the stored ones. At the stored version, status,
    /// endpoint and error are only replaced by a legal successor status.
    async fn put(&self, record: &FunctionRecord) -> Result<Sourced<()>>;

    /// Insert a record unless the tenant already holds a function of that
    /// name. Returns whether the record was inserted.
    async fn insert(&self, record: &FunctionRecord) -> Result<Sourced<bool>>;

    /// Apply a guarded status change. Returns whether it was applied.
    async fn update_status(&self, change: &StatusChange) -> Result<Sourced<bool>>;

    /// Point `alias` at `version`. Returns whether the record existed.
    async fn set_alias(
        &self,
        tenant_id: &str,
        name: &str,
        alias: &str,
        version: u32,
    ) -> Result<Sourced<bool>>;

    /// Append a trigger. Returns whether the record existed.
    async fn add_trigger(
        &self,
        tenant_id: &str,
        name: &str,
        trigger: &Trigger,
    ) -> Result<Sourced<bool>>;

    /// Fetch a record.
    async fn get(&self, tenant_id: &str, name: &str) -> Result<Sourced<Option<FunctionRecord>>>;

    /// All records of a tenant, order not guaranteed.
    async fn list(&self, tenant_id: &str) -> Result<Sourced<Vec<FunctionRecord>>>;

    /// Remove a record and its version history. Returns whether it existed.
    async fn delete(&self, tenant_id: &str, name: &str) -> Result<Sourced<bool>>;

    /// Add one to a counter. Returns whether the record existed.
    async fn increment_counter(
        &self,
        tenant_id: &str,
        name: &str,
        counter: Counter,
    ) -> Result<Sourced<bool>>;

    /// Append a version history entry. Existing entries are left untouched.
    async fn put_version(&self, version: &FunctionVersion) -> Result<Sourced<()>>;

    /// Version history of a function, oldest first.
    async fn list_versions(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Sourced<Vec<FunctionVersion>>>;

    /// Records of every tenant whose status is one of `statuses`.
    async fn list_by_status(
        &self,
        statuses: &[FunctionStatus],
    ) -> Result<Sourced<Vec<FunctionRecord>>>;
}
