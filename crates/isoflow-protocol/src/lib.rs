// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Isoflow Protocol - wire types for regional analyses
//!
//! Everything that crosses a process boundary between the orchestrator, the
//! broker and the workers is defined here and serialized as camelCase JSON:
//!
//! ```text
//!  orchestrator ──[RegionalTask; N]──► broker ──► worker
//!       ▲                                  ▲         │
//!       │                        WorkerStatus        │
//!       └────────────── RegionalWorkResult ◄─────────┘
//! ```
//!
//! - [`RegionalAnalysis`] is the dispatch input: one rectangular sub-grid to evaluate.
//! - [`RegionalTask`] is one origin cell of that grid.
//! - [`RegionalWorkResult`] is what a worker publishes for one task.
//! - [`WorkerStatus`] is the record a worker sends on every contact.
//! - [`WorkerMessage`] wraps either of the two on a worker's output queue.
//! - [`JobStatus`] is the progress report for a job.

mod analysis;
mod status;
mod worker;

pub use analysis::{RegionalAnalysis, RegionalTask, RegionalWorkResult, RoutingRequest};
pub use status::{JobState, JobStatus};
pub use worker::{WorkerCategory, WorkerMessage, WorkerStatus};
