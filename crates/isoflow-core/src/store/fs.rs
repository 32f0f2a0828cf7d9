// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local directory store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use super::{ArtifactStore, StoreError, validate_key};

/// Filesystem-backed store rooted at a directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so
/// readers never observe a partially written artifact.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn tmp_path_for(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".tmp-{}", uuid::Uuid::new_v4()));
        path.with_file_name(name)
    }

    async fn prepare_parent(path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Rename a written temporary into place, removing it if either step failed.
    async fn commit(tmp: &Path, path: &Path, written: std::io::Result<()>) -> Result<(), StoreError> {
        let outcome = match written {
            Ok(()) => tokio::fs::rename(tmp, path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            if let Err(cleanup) = tokio::fs::remove_file(tmp).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temporary file");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        Self::prepare_parent(&path).await?;
        let tmp = Self::tmp_path_for(&path);
        let written = tokio::fs::write(&tmp, bytes).await;
        Self::commit(&tmp, &path, written).await
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        Self::prepare_parent(&path).await?;
        let tmp = Self::tmp_path_for(&path);
        let written = tokio::fs::copy(source, &tmp).await.map(|_| ());
        Self::commit(&tmp, &path, written).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}
