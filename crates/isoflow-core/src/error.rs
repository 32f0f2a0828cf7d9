// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for isoflow-core.

use thiserror::Error;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Spatial input was rejected.
    #[error("Grid error: {0}")]
    Grid(#[from] isoflow_grid::GridError),

    /// Result assembly failed.
    #[error("Assembly error: {0}")]
    Assembly(#[from] crate::assembler::AssemblyError),

    /// The broker could not be reached or refused a request.
    #[error("Broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),

    /// Artifact storage failed.
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The dispatch queue is full; retry later.
    #[error("Dispatch queue is full ({capacity} pending); retry later")]
    Overloaded {
        /// Queue capacity that was exhausted.
        capacity: usize,
    },

    /// No live job has this id.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The runtime is shutting down and accepts no new work.
    #[error("Shutting down")]
    ShuttingDown,
}

/// Result type using isoflow-core Error.
pub type Result<T> = std::result::Result<T, Error>;
