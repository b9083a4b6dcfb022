// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact store.
//!
//! Holds immutable code bundles keyed by tenant, function and version. Every
//! artifact is content-addressed by its SHA-256 digest, so a [`CodeRef`] pins
//! exactly the bytes that were uploaded.
//!
//! Two implementations:
//! - [`FsArtifactStore`]: files under `{data_dir}/artifacts`
//! - [`MemoryArtifactStore`]: in-process map, used in tests and memory-only mode

mod fs;
mod memory;

pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::model::CodeRef;

/// Errors from artifact operations.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// No artifact stored under the reference.
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// Stored bytes do not hash to the referenced digest.
    #[error("Artifact digest mismatch for {key}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Storage key.
        key: String,
        /// Digest in the reference.
        expected: String,
        /// Digest of the bytes read.
        actual: String,
    },

    /// Key component is not a safe path segment.
    #[error("Invalid artifact key: {0}")]
    InvalidKey(String),

    /// Underlying I/O failed.
    #[error("Artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage for function code bundles.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` for `tenant_id/name` at `version` and return its reference.
    ///
    /// Storing the same bytes twice for the same version is a no-op.
    async fn put(
        &self,
        tenant_id: &str,
        name: &str,
        version: u32,
        bytes: &[u8],
    ) -> Result<CodeRef, ArtifactError>;

    /// Read the bytes for a reference, verifying the digest.
    async fn get(&self, code_ref: &CodeRef) -> Result<Vec<u8>, ArtifactError>;

    /// Whether an artifact exists for the reference.
    async fn exists(&self, code_ref: &CodeRef) -> Result<bool, ArtifactError>;

    /// Remove one artifact. Returns whether it existed.
    async fn delete(&self, code_ref: &CodeRef) -> Result<bool, ArtifactError>;

    /// Remove every artifact of a function. Returns how many were removed.
    async fn delete_function(&self, tenant_id: &str, name: &str) -> Result<usize, ArtifactError>;
}

/// Hex SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Build a reference, rejecting components that would escape the store root.
pub(crate) fn code_ref_for(
    tenant_id: &str,
    name: &str,
    version: u32,
    bytes: &[u8],
) -> Result<CodeRef, ArtifactError> {
    for segment in [tenant_id, name] {
        if segment.is_empty()
            || segment.starts_with('.')
            || segment.contains(['/', '\\', '\0'])
        {
            return Err(ArtifactError::InvalidKey(segment.to_string()));
        }
    }
    Ok(CodeRef {
        tenant_id: tenant_id.to_string(),
        name: name.to_string(),
        version,
        digest: digest(bytes),
    })
}

/// Check `bytes` hash to the digest in `code_ref`.
pub(crate) fn verify(code_ref: &CodeRef, bytes: &[u8]) -> Result<(), ArtifactError> {
    let actual = digest(bytes);
    if actual != code_ref.digest {
        return Err(ArtifactError::DigestMismatch {
            key: code_ref.key(),
            expected: code_ref.digest.clone(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_hex_sha256() {
        assert_eq!(
            digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_code_ref_for_rejects_traversal() {
        assert!(code_ref_for("..", "fn", 1, b"x").is_err());
        assert!(code_ref_for("alice", "a/b", 1, b"x").is_err());
        assert!(code_ref_for("", "fn", 1, b"x").is_err());

        let code_ref = code_ref_for("alice", "fn", 2, b"x").unwrap();
        assert_eq!(code_ref.version, 2);
        assert!(verify(&code_ref, b"x").is_ok());
        assert!(matches!(
            verify(&code_ref, b"y"),
            Err(ArtifactError::DigestMismatch { .. })
        ));
    }
}
