// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP broker client.
//!
//! - `POST {base}/enqueue/regional` with a JSON array of tasks
//! - `DELETE {base}/jobs/{jobId}`

use std::time::Duration;

use async_trait::async_trait;
use isoflow_protocol::RegionalTask;
use reqwest::StatusCode;
use tracing::debug;

use super::{Broker, BrokerError};

const MAX_ERROR_BODY: usize = 512;

/// Broker reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBroker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBroker {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a client for the broker at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, BrokerError> {
        Self::with_timeout(base_url, Self::DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Transient(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(response: reqwest::Response) -> Result<(), BrokerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BrokerError::Transient(format!("status {status}: {body}")));
        }
        Err(BrokerError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

fn send_error(e: reqwest::Error) -> BrokerError {
    BrokerError::Transient(e.to_string())
}

#[async_trait]
impl Broker for HttpBroker {
    async fn enqueue_regional(&self, tasks: &[RegionalTask]) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(tasks)?;
        let url = format!("{}/enqueue/regional", self.base_url);
        debug!(url = %url, tasks = tasks.len(), bytes = body.len(), "Publishing task batch");

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(send_error)?;
        Self::check(response).await
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let response = self.client.delete(&url).send().await.map_err(send_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(job_id = %job_id, "Broker does not know job, nothing to delete");
            return Ok(());
        }
        Self::check(response).await
    }
}
