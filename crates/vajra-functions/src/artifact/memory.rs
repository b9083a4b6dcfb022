// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory artifact store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ArtifactError, ArtifactStore, code_ref_for, verify};
use crate::model::CodeRef;

/// Artifact store backed by a map. Tracks total bytes written.
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<String, Vec<u8>>>,
    bytes_written: AtomicU64,
}

impl MemoryArtifactStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes accepted by `put` since creation.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    /// Number of stored artifacts.
    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }

    /// Whether the store holds no artifacts.
    pub async fn is_empty(&self) -> bool {
        self.artifacts.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        tenant_id: &str,
        name: &str,
        version: u32,
        bytes: &[u8],
    ) -> Result<CodeRef, ArtifactError> {
        let code_ref = code_ref_for(tenant_id, name, version, bytes)?;
        let mut artifacts = self.artifacts.write().await;
        if !artifacts.contains_key(&code_ref.key()) {
            artifacts.insert(code_ref.key(), bytes.to_vec());
            self.bytes_written
                .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        }
        Ok(code_ref)
    }

    async fn get(&self, code_ref: &CodeRef) -> Result<Vec<u8>, ArtifactError> {
        let artifacts = self.artifacts.read().await;
        let bytes = artifacts
            .get(&code_ref.key())
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(code_ref.key()))?;
        verify(code_ref, &bytes)?;
        Ok(bytes)
    }

    async fn exists(&self, code_ref: &CodeRef) -> Result<bool, ArtifactError> {
        Ok(self.artifacts.read().await.contains_key(&code_ref.key()))
    }

    async fn delete(&self, code_ref: &CodeRef) -> Result<bool, ArtifactError> {
        Ok(self.artifacts.write().await.remove(&code_ref.key()).is_some())
    }

    async fn delete_function(&self, tenant_id: &str, name: &str) -> Result<usize, ArtifactError> {
        let prefix = format!("{}/{}/", tenant_id, name);
        let mut artifacts = self.artifacts.write().await;
        let before = artifacts.len();
        artifacts.retain(|key, _| !key.starts_with(&prefix));
        Ok(before - artifacts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_bytes_once_per_artifact() {
        let store = MemoryArtifactStore::new();
        store.put("alice", "hello", 1, b"abcd").await.unwrap();
        store.put("alice", "hello", 1, b"abcd").await.unwrap();
        assert_eq!(store.bytes_written(), 4);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_function_keeps_prefix_siblings() {
        let store = MemoryArtifactStore::new();
        store.put("alice", "hello", 1, b"a").await.unwrap();
        let sibling = store.put("alice", "hello2", 1, b"b").await.unwrap();

        assert_eq!(store.delete_function("alice", "hello").await.unwrap(), 1);
        assert!(store.exists(&sibling).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_single_artifact() {
        let store = MemoryArtifactStore::new();
        let first = store.put("alice", "hello", 1, b"a").await.unwrap();
        let second = store.put("alice", "hello", 1, b"b").await.unwrap();

        assert!(store.delete(&second).await.unwrap());
        assert!(!store.delete(&second).await.unwrap());
        assert!(store.exists(&first).await.unwrap());
    }
}
