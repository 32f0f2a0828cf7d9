// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live jobs and their assemblers.
//!
//! Created once at startup and handed to the dispatcher, the result
//! consumers and the reaper. The dispatcher inserts an assembler before a
//! job's first task is published, so any result that can arrive already
//! finds its assembler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use isoflow_protocol::JobStatus;
use tracing::{debug, info};

use crate::assembler::ResultAssembler;

/// Job id → assembler map.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Arc<dyn ResultAssembler>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an assembler under its job id.
    ///
    /// Returns false, leaving the registry unchanged, if the id is taken.
    pub fn register(&self, assembler: Arc<dyn ResultAssembler>) -> bool {
        let job_id = assembler.job_id().to_string();
        match self.jobs.entry(job_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                debug!(job_id = %slot.key(), "Registered job");
                slot.insert(assembler);
                true
            }
        }
    }

    /// Assembler of a live job.
    pub fn get(&self, job_id: &str) -> Option<Arc<dyn ResultAssembler>> {
        self.jobs.get(job_id).map(|entry| entry.value().clone())
    }

    /// Remove a job, returning its assembler.
    pub fn remove(&self, job_id: &str) -> Option<Arc<dyn ResultAssembler>> {
        self.jobs.remove(job_id).map(|(_, assembler)| assembler)
    }

    /// Progress of a live job.
    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|entry| entry.value().status())
    }

    /// Progress of every live job, sorted by id.
    pub fn list(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self.jobs.iter().map(|entry| entry.value().status()).collect();
        all.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        all
    }

    /// Number of live jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is live.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Abort every job still accepting results. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        let assemblers: Vec<_> = self.jobs.iter().map(|e| e.value().clone()).collect();
        assemblers.iter().filter(|a| a.abort()).count()
    }

    /// Release errored jobs' scratch files and evict terminal jobs older
    /// than `retention`.
    ///
    /// Errored jobs give up their scratch files right away but stay errored,
    /// and queryable as such, until the retention window passes. Returns how
    /// many jobs were evicted.
    pub fn reap(&self, retention: Duration, now: Instant) -> usize {
        let assemblers: Vec<_> = self.jobs.iter().map(|e| e.value().clone()).collect();
        let mut evicted = 0;
        for assembler in assemblers {
            if assembler.release_scratch() {
                info!(job_id = %assembler.job_id(), "Released scratch space of errored job");
            }
            let expired = assembler
                .terminal_since()
                .is_some_and(|since| now.saturating_duration_since(since) > retention);
            // Terminal jobs hold no scratch space by now
            let state = assembler.status().state;
            if expired && state.is_terminal() {
                self.jobs.remove(assembler.job_id());
                evicted += 1;
                debug!(job_id = %assembler.job_id(), state = ?state, "Evicted job");
            }
        }
        evicted
    }
}
