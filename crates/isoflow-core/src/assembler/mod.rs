// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result assembly.
//!
//! A job's results arrive one origin at a time, in any order, possibly more
//! than once. An assembler places each result at its absolute position in a
//! preallocated scratch file, counts distinct positions, and finalizes the
//! artifact exactly once when every position is in.
//!
//! ```text
//!              handle_result (n < total)
//!                 ┌──────┐
//!                 ▼      │
//!  create ──► Accumulating ──(n == total)──► Finishing ──► Finished
//!                 │  │                           │
//!     abort ◄─────┘  └── mismatch ──► Errored    └──(upload failed)──► Errored
//!       │                               │
//!       ▼                               │ abort (reaper / delete)
//!    Aborted ◄──────────────────────────┘
//! ```
//!
//! Scratch files are released on every exit path: after a successful upload,
//! after a failed upload, on abort, and when the assembler is dropped.

use std::time::Instant;

use async_trait::async_trait;
use isoflow_protocol::{JobState, JobStatus, RegionalWorkResult};
use thiserror::Error;

use crate::store::StoreError;

mod access_grid;
mod scratch;

pub use access_grid::AccessGridAssembler;
pub use scratch::human_bytes;

/// Result assembly errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AssemblyError {
    /// A result's shape disagrees with what the job expects.
    #[error(
        "Job {job_id}: result has {actual} {dimension}, expected {expected}"
    )]
    DimensionMismatch {
        /// Job the result belongs to.
        job_id: String,
        /// Which dimension disagreed.
        dimension: &'static str,
        /// Size the job expects.
        expected: usize,
        /// Size the result carried.
        actual: usize,
    },

    /// A result names a position outside the job's grid.
    #[error("Job {job_id}: task {task_id} is outside 0..{total}")]
    TaskIndexOutOfRange {
        /// Job the result belongs to.
        job_id: String,
        /// Offending task position.
        task_id: u64,
        /// Number of tasks in the job.
        total: u64,
    },

    /// Scratch file I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisting the finished artifact failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What happened to a delivered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written and counted.
    Accepted,
    /// Written and counted, and it was the last missing position.
    Completed,
    /// The position was already complete; nothing changed.
    Duplicate,
    /// The job no longer accepts results (aborted, errored or finished).
    Ignored(JobState),
}

/// Turns a stream of per-origin results into one artifact.
///
/// One implementation exists per output format; dispatch and consumption
/// only see this trait.
#[async_trait]
pub trait ResultAssembler: Send + Sync {
    /// Job this assembler belongs to.
    fn job_id(&self) -> &str;

    /// Validate, place and count one result.
    ///
    /// When the result completes the job, finalization runs before this returns.
    /// Results for jobs that no longer accept them are ignored without error.
    async fn handle_result(&self, result: &RegionalWorkResult) -> Result<Delivery, AssemblyError>;

    /// Finalize a fully received job: compress, persist and release scratch space.
    ///
    /// Runs at most once; later or concurrent calls, and calls while the job is
    /// still accumulating, return immediately.
    async fn finish(&self) -> Result<(), AssemblyError>;

    /// Stop accepting results and release scratch space without persisting.
    ///
    /// Returns false when the job was already finishing or terminal-and-clean.
    fn abort(&self) -> bool;

    /// Delete the scratch file of an errored job, leaving it errored.
    ///
    /// Returns false when the job is not errored or holds no scratch file.
    fn release_scratch(&self) -> bool;

    /// Progress snapshot.
    fn status(&self) -> JobStatus;

    /// When the job reached a terminal state.
    fn terminal_since(&self) -> Option<Instant>;
}
