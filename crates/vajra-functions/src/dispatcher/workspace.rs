// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation workspaces and bundle unpacking.
//!
//! A [`Workspace`] is a temporary directory owned by exactly one invocation.
//! It is removed when dropped, whichever way the invocation ends.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

/// Errors reading or unpacking a code bundle.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// Bytes are not a readable zip archive.
    #[error("Invalid bundle archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Entry path would land outside the workspace.
    #[error("Bundle entry escapes workspace: {0}")]
    UnsafePath(String),

    /// Writing unpacked files failed.
    #[error("Bundle I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking unpack task did not complete.
    #[error("Unpack task failed: {0}")]
    Task(String),
}

/// File names contained in a bundle, without extracting it.
pub fn list_entries(bytes: &[u8]) -> Result<Vec<String>, BundleError> {
    let archive = ZipArchive::new(Cursor::new(bytes))?;
    Ok(archive.file_names().map(str::to_string).collect())
}

fn extract(bytes: &[u8], dest: &Path) -> Result<usize, BundleError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut written = 0;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let relative = file
            .enclosed_name()
            .ok_or_else(|| BundleError::UnsafePath(file.name().to_string()))?;
        let target = dest.join(relative);

        if file.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut file, &mut out)?;
        written += 1;
    }

    Ok(written)
}

/// Scoped temporary directory for one invocation.
pub struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    /// Create a fresh workspace under `root`.
    pub fn create(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix("invoke-").tempdir_in(root)?;
        Ok(Self { dir })
    }

    /// Workspace directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path of a bundle-relative file.
    pub fn file(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Unpack a zip bundle into the workspace. Returns the number of files written.
    pub async fn unpack(&self, bytes: Vec<u8>) -> Result<usize, BundleError> {
        let dest = self.dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || extract(&bytes, &dest))
            .await
            .map_err(|e| BundleError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn bundle(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn test_unpack_nested_files() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();

        let bytes = bundle(&[("main.py", b"x = 1"), ("lib/util.py", b"y = 2")]);
        assert_eq!(workspace.unpack(bytes).await.unwrap(), 2);
        assert!(workspace.file("main.py").exists());
        assert_eq!(
            std::fs::read_to_string(workspace.file("lib/util.py")).unwrap(),
            "y = 2"
        );
    }

    #[tokio::test]
    async fn test_workspace_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let workspace = Workspace::create(root.path()).unwrap();
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();

        let bytes = bundle(&[("../escape.py", b"boom")]);
        let err = workspace.unpack(bytes).await.unwrap_err();
        assert!(matches!(err, BundleError::UnsafePath(_)));
        assert!(!root.path().join("escape.py").exists());
    }

    #[test]
    fn test_list_entries_rejects_garbage() {
        assert!(list_entries(b"not a zip").is_err());
        let names = list_entries(&bundle(&[("index.js", b"")])).unwrap();
        assert_eq!(names, vec!["index.js"]);
    }

    #[tokio::test]
    async fn test_declared_size_is_not_trusted() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();

        // Claim an uncompressed size near 4 GiB in the central directory
        let mut bytes = bundle(&[("main.py", b"x = 1")]);
        let central = bytes
            .windows(4)
            .position(|w| w == b"PK\x01\x02")
            .unwrap();
        bytes[central + 24..central + 28].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());

        match workspace.unpack(bytes).await {
            Ok(_) => assert_eq!(std::fs::read(workspace.file("main.py")).unwrap(), b"x = 1"),
            Err(e) => assert!(!matches!(e, BundleError::Task(_)), "unpack panicked: {}", e),
        }
    }
}
