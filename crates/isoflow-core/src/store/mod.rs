// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact storage for finished access grids and detached scenarios.
//!
//! Stores are addressed by flat, slash-separated keys such as
//! `job-123.access` or `bundle-7_scenario-1.json`. The backend is chosen from
//! a URL:
//!
//! - `file:///var/lib/isoflow/results` or `file://relative/dir` → [`FsArtifactStore`]
//! - `s3://bucket/prefix` → `S3ArtifactStore` (feature `s3`)
//!
//! [`MemoryArtifactStore`] keeps everything in a map and is meant for tests.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::retry::Transient;

mod fs;
mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;
#[cfg(feature = "s3")]
pub use s3::S3ArtifactStore;

/// Artifact storage errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Local I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The key is empty or tries to escape the store root.
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    /// No object under this key.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store URL could not be understood.
    #[error("Unsupported store URL: {0}")]
    UnsupportedUrl(String),

    /// The remote backend failed.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_))
            || matches!(
                self,
                StoreError::Io(e) if matches!(
                    e.kind(),
                    std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                )
            )
    }
}

/// Object storage for artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Store the contents of a local file under `key`.
    ///
    /// The default implementation reads the file into memory; backends that
    /// can stream from disk override it.
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StoreError> {
        let bytes = tokio::fs::read(path).await?;
        self.put(key, bytes).await
    }

    /// Fetch the object under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Remove the object under `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Short description for logs, e.g. `file:///data/results`.
    fn describe(&self) -> String;
}

/// Open a store from a `file://` or `s3://` URL.
pub async fn from_url(url: &str) -> Result<Arc<dyn ArtifactStore>, StoreError> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Ok(Arc::new(FsArtifactStore::new(rest)?));
    }
    if let Some(rest) = url.strip_prefix("s3://") {
        #[cfg(feature = "s3")]
        {
            return Ok(Arc::new(S3ArtifactStore::from_env_url(rest).await?));
        }
        #[cfg(not(feature = "s3"))]
        {
            let _ = rest;
            return Err(StoreError::UnsupportedUrl(format!(
                "{url} (built without the `s3` feature)"
            )));
        }
    }
    Err(StoreError::UnsupportedUrl(url.to_string()))
}

/// Reject keys that are empty, absolute, or contain `.`/`..` segments.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
