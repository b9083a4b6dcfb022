// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fallback registry decorator.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{Counter, Registry, Sourced, StatusChange, StorageSource};
use crate::error::{Error, Result};
use crate::model::{FunctionRecord, FunctionStatus, FunctionVersion, Trigger};

/// Tries `primary` first; on any error retries once against `fallback`.
///
/// The two backends are never reconciled. Records written to the fallback
/// stay visible there until a later write to the primary succeeds, at which
/// point the fallback copy is dropped.
pub struct FallbackRegistry {
    primary: Arc<dyn Registry>,
    fallback: Arc<dyn Registry>,
}

impl FallbackRegistry {
    /// Compose two registries.
    pub fn new(primary: Arc<dyn Registry>, fallback: Arc<dyn Registry>) -> Self {
        Self { primary, fallback }
    }

    fn exhausted(op: &str, primary: Error, fallback: Error) -> Error {
        Error::BackendUnavailable(format!(
            "{} failed on primary ({}) and fallback ({})",
            op, primary, fallback
        ))
    }
}

/// Records from the primary plus fallback records the primary does not hold.
fn merge(
    primary: Sourced<Vec<FunctionRecord>>,
    fallback: Vec<FunctionRecord>,
) -> Sourced<Vec<FunctionRecord>> {
    let known: HashSet<(String, String)> = primary
        .value
        .iter()
        .map(|r| (r.tenant_id.clone(), r.name.clone()))
        .collect();
    let extra: Vec<FunctionRecord> = fallback
        .into_iter()
        .filter(|r| !known.contains(&(r.tenant_id.clone(), r.name.clone())))
        .collect();

    let source = if extra.is_empty() {
        primary.source
    } else {
        StorageSource::Memory
    };
    let mut records = primary.value;
    records.extend(extra);
    Sourced {
        value: records,
        source,
    }
}

#[async_trait]
impl Registry for FallbackRegistry {
    async fn put(&self, record: &FunctionRecord) -> Result<Sourced<()>> {
        match self.primary.put(record).await {
            Ok(result) => {
                if let Err(e) = self.fallback.delete(&record.tenant_id, &record.name).await {
                    warn!(error = %e, "Failed to drop fallback copy after primary write");
                }
                Ok(result)
            }
            Err(primary) => {
                warn!(
                    tenant_id = %record.tenant_id,
                    function = %record.name,
                    error = %primary,
                    "Primary registry write failed, using fallback"
                );
                self.fallback
                    .put(record)
                    .await
                    .map_err(|fallback| Self::exhausted("put", primary, fallback))
            }
        }
    }

    async fn insert(&self, record: &FunctionRecord) -> Result<Sourced<bool>> {
        match self.primary.insert(record).await {
            Ok(result) => Ok(result),
            Err(primary) => {
                warn!(
                    tenant_id = %record.tenant_id,
                    function = %record.name,
                    error = %primary,
                    "Primary registry insert failed, using fallback"
                );
                self.fallback
                    .insert(record)
                    .await
                    .map_err(|fallback| Self::exhausted("insert", primary, fallback))
            }
        }
    }

    async fn update_status(&self, change: &StatusChange) -> Result<Sourced<bool>> {
        match self.primary.update_status(change).await {
            Ok(applied) if applied.value => Ok(applied),
            Ok(skipped) => match self.fallback.update_status(change).await {
                Ok(applied) if applied.value => Ok(applied),
                _ => Ok(skipped),
            },
            Err(primary) => {
                warn!(
                    tenant_id = %change.tenant_id,
                    function = %change.name,
                    status = %change.to,
                    error = %primary,
                    "Primary status update failed, using fallback"
                );
                self.fallback
                    .update_status(change)
                    .await
                    .map_err(|fallback| Self::exhausted("update_status", primary, fallback))
            }
        }
    }

    async fn set_alias(
        &self,
        tenant_id: &str,
        name: &str,
        alias: &str,
        version: u32,
    ) -> Result<Sourced<bool>> {
        match self.primary.set_alias(tenant_id, name, alias, version).await {
            Ok(updated) if updated.value => Ok(updated),
            Ok(missing) => match self.fallback.set_alias(tenant_id, name, alias, version).await {
                Ok(updated) if updated.value => Ok(updated),
                _ => Ok(missing),
            },
            Err(primary) => {
                warn!(tenant_id = %tenant_id, function = %name, error = %primary, "Primary alias write failed, using fallback");
                self.fallback
                    .set_alias(tenant_id, name, alias, version)
                    .await
                    .map_err(|fallback| Self::exhausted("set_alias", primary, fallback))
            }
        }
    }

    async fn add_trigger(
        &self,
        tenant_id: &str,
        name: &str,
        trigger: &Trigger,
    ) -> Result<Sourced<bool>> {
        match self.primary.add_trigger(tenant_id, name, trigger).await {
            Ok(updated) if updated.value => Ok(updated),
            Ok(missing) => match self.fallback.add_trigger(tenant_id, name, trigger).await {
                Ok(updated) if updated.value => Ok(updated),
                _ => Ok(missing),
            },
            Err(primary) => {
                warn!(tenant_id = %tenant_id, function = %name, error = %primary, "Primary trigger write failed, using fallback");
                self.fallback
                    .add_trigger(tenant_id, name, trigger)
                    .await
                    .map_err(|fallback| Self::exhausted("add_trigger", primary, fallback))
            }
        }
    }

    async fn get(&self, tenant_id: &str, name: &str) -> Result<Sourced<Option<FunctionRecord>>> {
        match self.primary.get(tenant_id, name).await {
            Ok(found) if found.value.is_some() => Ok(found),
            Ok(missing) => match self.fallback.get(tenant_id, name).await {
                Ok(found) if found.value.is_some() => Ok(found),
                _ => Ok(missing),
            },
            Err(primary) => {
                warn!(
                    tenant_id = %tenant_id,
                    function = %name,
                    error = %primary,
                    "Primary registry read failed, using fallback"
                );
                self.fallback
                    .get(tenant_id, name)
                    .await
                    .map_err(|fallback| Self::exhausted("get", primary, fallback))
            }
        }
    }

    async fn list(&self, tenant_id: &str) -> Result<Sourced<Vec<FunctionRecord>>> {
        match self.primary.list(tenant_id).await {
            Ok(primary) => {
                let fallback = self
                    .fallback
                    .list(tenant_id)
                    .await
                    .map(Sourced::into_inner)
                    .unwrap_or_default();
                Ok(merge(primary, fallback))
            }
            Err(primary) => {
                warn!(tenant_id = %tenant_id, error = %primary, "Primary registry list failed, using fallback");
                self.fallback
                    .list(tenant_id)
                    .await
                    .map_err(|fallback| Self::exhausted("list", primary, fallback))
            }
        }
    }

    async fn delete(&self, tenant_id: &str, name: &str) -> Result<Sourced<bool>> {
        let primary = self.primary.delete(tenant_id, name).await;
        let fallback = self.fallback.delete(tenant_id, name).await;

        match (primary, fallback) {
            (Ok(p), Ok(f)) => Ok(Sourced {
                value: p.value || f.value,
                source: if p.value || !f.value {
                    p.source
                } else {
                    f.source
                },
            }),
            (Ok(p), Err(e)) => {
                warn!(error = %e, "Fallback registry delete failed");
                Ok(p)
            }
            (Err(e), Ok(f)) => {
                warn!(tenant_id = %tenant_id, function = %name, error = %e, "Primary registry delete failed, using fallback");
                Ok(f)
            }
            (Err(primary), Err(fallback)) => Err(Self::exhausted("delete", primary, fallback)),
        }
    }

    async fn increment_counter(
        &self,
        tenant_id: &str,
        name: &str,
        counter: Counter,
    ) -> Result<Sourced<bool>> {
        match self.primary.increment_counter(tenant_id, name, counter).await {
            Ok(updated) if updated.value => Ok(updated),
            Ok(missing) => match self.fallback.increment_counter(tenant_id, name, counter).await {
                Ok(updated) if updated.value => Ok(updated),
                _ => Ok(missing),
            },
            Err(primary) => {
                warn!(
                    tenant_id = %tenant_id,
                    function = %name,
                    counter = counter.column(),
                    error = %primary,
                    "Primary counter increment failed, using fallback"
                );
                self.fallback
                    .increment_counter(tenant_id, name, counter)
                    .await
                    .map_err(|fallback| Self::exhausted("increment_counter", primary, fallback))
            }
        }
    }

    async fn put_version(&self, version: &FunctionVersion) -> Result<Sourced<()>> {
        match self.primary.put_version(version).await {
            Ok(result) => Ok(result),
            Err(primary) => {
                warn!(
                    tenant_id = %version.tenant_id,
                    function = %version.name,
                    version = version.version,
                    error = %primary,
                    "Primary version write failed, using fallback"
                );
                self.fallback
                    .put_version(version)
                    .await
                    .map_err(|fallback| Self::exhausted("put_version", primary, fallback))
            }
        }
    }

    async fn list_versions(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Sourced<Vec<FunctionVersion>>> {
        match self.primary.list_versions(tenant_id, name).await {
            Ok(primary) => {
                let fallback = self
                    .fallback
                    .list_versions(tenant_id, name)
                    .await
                    .map(Sourced::into_inner)
                    .unwrap_or_default();
                let extra: Vec<FunctionVersion> = fallback
                    .into_iter()
                    .filter(|f| !primary.value.iter().any(|p| p.version == f.version))
                    .collect();
                if extra.is_empty() {
                    return Ok(primary);
                }
                let mut versions = primary.value;
                versions.extend(extra);
                versions.sort_by_key(|v| v.version);
                Ok(Sourced::memory(versions))
            }
            Err(primary) => self
                .fallback
                .list_versions(tenant_id, name)
                .await
                .map_err(|fallback| Self::exhausted("list_versions", primary, fallback)),
        }
    }

    async fn list_by_status(
        &self,
        statuses: &[FunctionStatus],
    ) -> Result<Sourced<Vec<FunctionRecord>>> {
        match self.primary.list_by_status(statuses).await {
            Ok(primary) => {
                let fallback = self
                    .fallback
                    .list_by_status(statuses)
                    .await
                    .map(Sourced::into_inner)
                    .unwrap_or_default();
                Ok(merge(primary, fallback))
            }
            Err(primary) => {
                warn!(error = %primary, "Primary status scan failed, using fallback");
                self.fallback
                    .list_by_status(statuses)
                    .await
                    .map_err(|fallback| Self::exhausted("list_by_status", primary, fallback))
            }
        }
    }
}
