// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory registry, partitioned by tenant.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{Counter, Registry, Sourced, StatusChange};
use crate::error::Result;
use crate::model::{FunctionRecord, FunctionStatus, FunctionVersion, Trigger};

/// `incoming` written over `stored` at the same or a newer version.
fn merge(stored: &FunctionRecord, incoming: &FunctionRecord) -> FunctionRecord {
    let mut merged = incoming.clone();
    merged.invocation_count = stored.invocation_count.max(incoming.invocation_count);
    merged.error_count = stored.error_count.max(incoming.error_count);

    for (alias, version) in &stored.aliases {
        merged
            .aliases
            .entry(alias.clone())
            .or_insert(*version);
    }
    let extra: Vec<Trigger> = stored
        .triggers
        .iter()
        .filter(|t| !incoming.triggers.iter().any(|i| i.trigger_id == t.trigger_id))
        .cloned()
        .collect();
    merged.triggers.extend(extra);

    if stored.version == incoming.version && !stored.status.can_transition_to(incoming.status) {
        merged.status = stored.status;
        merged.endpoint = stored.endpoint.clone();
        merged.error = stored.error.clone();
    }
    merged
}

#[derive(Default)]
struct Partition {
    functions: HashMap<String, FunctionRecord>,
    versions: HashMap<String, Vec<FunctionVersion>>,
}

/// Registry held in process memory.
///
/// Counter increments happen under the partition's write lock, so concurrent
/// invocations never lose an increment against this backend.
#[derive(Default)]
pub struct MemoryRegistry {
    tenants: RwLock<HashMap<String, Partition>>,
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Tenants that currently hold at least one record.
    pub async fn tenants(&self) -> Vec<String> {
        self.tenants
            .read()
            .await
            .iter()
            .filter(|(_, partition)| !partition.functions.is_empty())
            .map(|(tenant, _)| tenant.clone())
            .collect()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn put(&self, record: &FunctionRecord) -> Result<Sourced<()>> {
        let mut tenants = self.tenants.write().await;
        let partition = tenants.entry(record.tenant_id.clone()).or_default();

        match partition.functions.get_mut(&record.name) {
            Some(existing) if existing.version > record.version => {
                tracing::debug!(
                    tenant_id = %record.tenant_id,
                    function = %record.name,
                    version = record.version,
                    "Ignored write for superseded version"
                );
            }
            Some(existing) => {
                let merged = merge(existing, record);
                *existing = merged;
            }
            None => {
                partition
                    .functions
                    .insert(record.name.clone(), record.clone());
            }
        }

        Ok(Sourced::memory(()))
    }

    async fn insert(&self, record: &FunctionRecord) -> Result<Sourced<bool>> {
        let mut tenants = self.tenants.write().await;
        let partition = tenants.entry(record.tenant_id.clone()).or_default();

        match partition.functions.entry(record.name.clone()) {
            Entry::Occupied(_) => Ok(Sourced::memory(false)),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(Sourced::memory(true))
            }
        }
    }

    async fn update_status(&self, change: &StatusChange) -> Result<Sourced<bool>> {
        let mut tenants = self.tenants.write().await;
        let record = tenants
            .get_mut(&change.tenant_id)
            .and_then(|partition| partition.functions.get_mut(&change.name));

        match record {
            Some(record) if change.applies_to(record) => {
                change.apply(record);
                Ok(Sourced::memory(true))
            }
            _ => Ok(Sourced::memory(false)),
        }
    }

    async fn set_alias(
        &self,
        tenant_id: &str,
        name: &str,
        alias: &str,
        version: u32,
    ) -> Result<Sourced<bool>> {
        let mut tenants = self.tenants.write().await;
        let Some(record) = tenants
            .get_mut(tenant_id)
            .and_then(|partition| partition.functions.get_mut(name))
        else {
            return Ok(Sourced::memory(false));
        };
        record.aliases.insert(alias.to_string(), version);
        record.updated_at = Utc::now();
        Ok(Sourced::memory(true))
    }

    async fn add_trigger(
        &self,
        tenant_id: &str,
        name: &str,
        trigger: &Trigger,
    ) -> Result<Sourced<bool>> {
        let mut tenants = self.tenants.write().await;
        let Some(record) = tenants
            .get_mut(tenant_id)
            .and_then(|partition| partition.functions.get_mut(name))
        else {
            return Ok(Sourced::memory(false));
        };
        record.triggers.push(trigger.clone());
        record.updated_at = Utc::now();
        Ok(Sourced::memory(true))
    }

    async fn get(&self, tenant_id: &str, name: &str) -> Result<Sourced<Option<FunctionRecord>>> {
        let tenants = self.tenants.read().await;
        let record = tenants
            .get(tenant_id)
            .and_then(|partition| partition.functions.get(name))
            .cloned();
        Ok(Sourced::memory(record))
    }

    async fn list(&self, tenant_id: &str) -> Result<Sourced<Vec<FunctionRecord>>> {
        let tenants = self.tenants.read().await;
        let records = tenants
            .get(tenant_id)
            .map(|partition| partition.functions.values().cloned().collect())
            .unwrap_or_default();
        Ok(Sourced::memory(records))
    }

    async fn delete(&self, tenant_id: &str, name: &str) -> Result<Sourced<bool>> {
        let mut tenants = self.tenants.write().await;
        let removed = match tenants.get_mut(tenant_id) {
            Some(partition) => {
                partition.versions.remove(name);
                partition.functions.remove(name).is_some()
            }
            None => false,
        };
        Ok(Sourced::memory(removed))
    }

    async fn increment_counter(
        &self,
        tenant_id: &str,
        name: &str,
        counter: Counter,
    ) -> Result<Sourced<bool>> {
        let mut tenants = self.tenants.write().await;
        let record = tenants
            .get_mut(tenant_id)
            .and_then(|partition| partition.functions.get_mut(name));

        let Some(record) = record else {
            return Ok(Sourced::memory(false));
        };
        match counter {
            Counter::Invocations => record.invocation_count += 1,
            Counter::Errors => record.error_count += 1,
        }
        Ok(Sourced::memory(true))
    }

    async fn put_version(&self, version: &FunctionVersion) -> Result<Sourced<()>> {
        let mut tenants = self.tenants.write().await;
        let history = tenants
            .entry(version.tenant_id.clone())
            .or_default()
            .versions
            .entry(version.name.clone())
            .or_default();

        if !history.iter().any(|v| v.version == version.version) {
            history.push(version.clone());
            history.sort_by_key(|v| v.version);
        }
        Ok(Sourced::memory(()))
    }

    async fn list_versions(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Sourced<Vec<FunctionVersion>>> {
        let tenants = self.tenants.read().await;
        let versions = tenants
            .get(tenant_id)
            .and_then(|partition| partition.versions.get(name))
            .cloned()
            .unwrap_or_default();
        Ok(Sourced::memory(versions))
    }

    async fn list_by_status(
        &self,
        statuses: &[FunctionStatus],
    ) -> Result<Sourced<Vec<FunctionRecord>>> {
        let tenants = self.tenants.read().await;
        let records = tenants
            .values()
            .flat_map(|partition| partition.functions.values())
            .filter(|record| statuses.contains(&record.status))
            .cloned()
            .collect();
        Ok(Sourced::memory(records))
    }
}
