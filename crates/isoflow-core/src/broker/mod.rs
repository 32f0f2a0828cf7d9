// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker client.
//!
//! The broker is the external component that matches published tasks to
//! compatible workers and redelivers tasks whose results go missing. The
//! orchestrator only ever publishes task batches and asks for jobs to be
//! dropped.

use async_trait::async_trait;
use isoflow_protocol::RegionalTask;
use thiserror::Error;

use crate::retry::Transient;

pub mod http;
pub mod mock;

pub use http::HttpBroker;
pub use mock::MockBroker;

/// Broker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// The broker was unreachable, timed out or reported overload; retrying may help.
    #[error("Broker unavailable: {0}")]
    Transient(String),

    /// The broker refused the request.
    #[error("Broker rejected request with status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The request could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

/// Task intake and job control on the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a job's complete task batch in one request.
    async fn enqueue_regional(&self, tasks: &[RegionalTask]) -> Result<(), BrokerError>;

    /// Drop every not-yet-delivered task of a job. Unknown jobs are not an error.
    async fn delete_job(&self, job_id: &str) -> Result<(), BrokerError>;
}
