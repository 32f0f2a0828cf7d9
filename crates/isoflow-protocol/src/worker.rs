// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker identity, heartbeats and the messages workers publish.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::RegionalWorkResult;

/// Compatibility class of a worker: the network it has loaded and the
/// executable version it runs. Tasks are only routed to workers of the
/// matching category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCategory {
    /// Transport network (bundle) identifier.
    pub graph_id: String,
    /// Worker executable version.
    pub worker_version: String,
}

impl WorkerCategory {
    /// Create a category.
    pub fn new(graph_id: impl Into<String>, worker_version: impl Into<String>) -> Self {
        Self {
            graph_id: graph_id.into(),
            worker_version: worker_version.into(),
        }
    }
}

impl fmt::Display for WorkerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.graph_id, self.worker_version)
    }
}

/// Status record a worker sends every time it contacts the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Stable worker identifier.
    pub worker_id: String,
    /// Network currently loaded.
    pub graph_id: String,
    /// Executable version.
    pub worker_version: String,
}

impl WorkerStatus {
    /// Category the worker currently belongs to.
    pub fn category(&self) -> WorkerCategory {
        WorkerCategory::new(self.graph_id.clone(), self.worker_version.clone())
    }
}

/// Anything a worker sends back on its output queue.
///
/// Tagged on the wire with `"type": "result"` or `"type": "status"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// Outcome of one task.
    Result(RegionalWorkResult),
    /// Heartbeat.
    Status(WorkerStatus),
}

impl From<RegionalWorkResult> for WorkerMessage {
    fn from(result: RegionalWorkResult) -> Self {
        Self::Result(result)
    }
}

impl From<WorkerStatus> for WorkerMessage {
    fn from(status: WorkerStatus) -> Self {
        Self::Status(status)
    }
}
