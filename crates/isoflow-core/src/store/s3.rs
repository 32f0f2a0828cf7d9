// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! S3-compatible artifact store.
//!
//! Credentials and region come from the standard AWS environment.
//! `ISOFLOW_S3_ENDPOINT_URL` points the client at a compatible service
//! (MinIO, Ceph), and `ISOFLOW_S3_FORCE_PATH_STYLE` overrides path-style
//! addressing, which defaults to on whenever a custom endpoint is set.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;

use super::{ArtifactStore, StoreError, validate_key};

/// Store backed by one bucket and an optional key prefix.
#[derive(Debug, Clone)]
pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3ArtifactStore {
    /// Create a store from an `s3://bucket/prefix` URL with the scheme
    /// stripped (i.e. pass `bucket/prefix`).
    pub async fn from_env_url(rest: &str) -> Result<Self, StoreError> {
        let (bucket, prefix) = parse_bucket_prefix(rest)?;
        let client = client_from_env().await?;
        Ok(Self::new(client, bucket, prefix))
    }

    /// Create a store around an existing client.
    pub fn new(client: aws_sdk_s3::Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    fn object_key(&self, key: &str) -> Result<String, StoreError> {
        validate_key(key)?;
        if self.prefix.is_empty() {
            Ok(key.to_string())
        } else {
            Ok(format!("{}/{}", self.prefix, key))
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let object_key = self.object_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| map_sdk_err("put_object", e))?;
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StoreError> {
        let object_key = self.object_key(key)?;
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StoreError::Backend(format!("open {} for upload: {e}", path.display())))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(body)
            .send()
            .await
            .map_err(|e| map_sdk_err("put_object", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let object_key = self.object_key(key)?;
        let out = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
        {
            Ok(out) => out,
            Err(SdkError::ServiceError(se)) if se.err().is_no_such_key() => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(map_sdk_err("get_object", e)),
        };
        let bytes = out
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(format!("get_object body collect failed: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let object_key = self.object_key(key)?;
        // S3 delete is already idempotent
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| map_sdk_err("delete_object", e))?;
        Ok(())
    }

    fn describe(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.prefix)
        }
    }
}

fn parse_bucket_prefix(rest: &str) -> Result<(String, String), StoreError> {
    let s = rest.trim().trim_matches('/');
    let (bucket, prefix) = s.split_once('/').unwrap_or((s, ""));
    if bucket.is_empty() {
        return Err(StoreError::UnsupportedUrl(format!("s3://{rest}")));
    }
    Ok((bucket.to_string(), prefix.trim_matches('/').to_string()))
}

async fn client_from_env() -> Result<aws_sdk_s3::Client, StoreError> {
    let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let endpoint_url = std::env::var("ISOFLOW_S3_ENDPOINT_URL").ok();
    let force_path_style = match std::env::var("ISOFLOW_S3_FORCE_PATH_STYLE") {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => endpoint_url.is_some(),
    };

    let mut builder = aws_sdk_s3::config::Builder::from(&cfg);
    if let Some(url) = endpoint_url {
        builder = builder.endpoint_url(url);
    }
    if force_path_style {
        builder = builder.force_path_style(true);
    }
    Ok(aws_sdk_s3::Client::from_conf(builder.build()))
}

fn map_sdk_err<E: std::fmt::Debug>(operation: &str, err: SdkError<E>) -> StoreError {
    StoreError::Backend(format!("s3 {operation} failed: {err:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bucket_prefix() {
        assert_eq!(
            parse_bucket_prefix("results/grids/v1/").unwrap(),
            ("results".to_string(), "grids/v1".to_string())
        );
        assert_eq!(
            parse_bucket_prefix("results").unwrap(),
            ("results".to_string(), String::new())
        );
        assert!(parse_bucket_prefix("/").is_err());
    }
}
