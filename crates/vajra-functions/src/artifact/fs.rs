// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem artifact store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ArtifactError, ArtifactStore, code_ref_for, verify};
use crate::model::CodeRef;

/// Artifacts stored as `{root}/{tenant}/{name}/v{version}/{digest}.zip`.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `{data_dir}/artifacts`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("artifacts"))
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, code_ref: &CodeRef) -> PathBuf {
        self.root
            .join(&code_ref.tenant_id)
            .join(&code_ref.name)
            .join(format!("v{}", code_ref.version))
            .join(format!("{}.zip", code_ref.digest))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        tenant_id: &str,
        name: &str,
        version: u32,
        bytes: &[u8],
    ) -> Result<CodeRef, ArtifactError> {
        let code_ref = code_ref_for(tenant_id, name, version, bytes)?;
        let path = self.path_for(&code_ref);

        if tokio::fs::try_exists(&path).await? {
            debug!(key = %code_ref, "Artifact already stored");
            return Ok(code_ref);
        }

        let dir = path
            .parent()
            .ok_or_else(|| ArtifactError::InvalidKey(code_ref.key()))?;
        tokio::fs::create_dir_all(dir).await?;

        // Write under a temporary name, then rename into place.
        let tmp = dir.join(format!(".{}.tmp-{}", code_ref.digest, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        info!(key = %code_ref, size = bytes.len(), "Stored artifact");
        Ok(code_ref)
    }

    async fn get(&self, code_ref: &CodeRef) -> Result<Vec<u8>, ArtifactError> {
        let bytes = match tokio::fs::read(self.path_for(code_ref)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(code_ref.key()));
            }
            Err(e) => return Err(e.into()),
        };
        verify(code_ref, &bytes)?;
        Ok(bytes)
    }

    async fn exists(&self, code_ref: &CodeRef) -> Result<bool, ArtifactError> {
        Ok(tokio::fs::try_exists(self.path_for(code_ref)).await?)
    }

    async fn delete(&self, code_ref: &CodeRef) -> Result<bool, ArtifactError> {
        match tokio::fs::remove_file(self.path_for(code_ref)).await {
            Ok(()) => {
                info!(key = %code_ref, "Removed artifact");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_function(&self, tenant_id: &str, name: &str) -> Result<usize, ArtifactError> {
        code_ref_for(tenant_id, name, 0, &[])?;
        let dir = self.root.join(tenant_id).join(name);

        let mut removed = 0;
        let mut versions = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(version_dir) = versions.next_entry().await? {
            if !version_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(version_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if file.file_name().to_string_lossy().ends_with(".zip") {
                    removed += 1;
                }
            }
        }

        tokio::fs::remove_dir_all(&dir).await?;
        info!(tenant_id = %tenant_id, name = %name, removed, "Deleted function artifacts");
        Ok(removed)
    }
}
