// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job progress as reported to status queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job's result assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Results are arriving.
    Accumulating,
    /// Every position is in; the artifact is being compressed and persisted.
    Finishing,
    /// The artifact is persisted.
    Finished,
    /// A corrupting failure occurred; the job will never finish.
    Errored,
    /// The job was deleted; late results are ignored.
    Aborted,
}

impl JobState {
    /// True once no further result can change the job.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Errored | Self::Aborted)
    }
}

/// Progress of a live job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    /// Job identifier.
    pub job_id: String,
    /// Number of tasks in the job.
    pub total: u64,
    /// Number of distinct task positions received.
    pub complete: u64,
    /// Assembly state.
    pub state: JobState,
    /// When the job's assembler was created.
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
