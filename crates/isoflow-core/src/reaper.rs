// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that releases errored jobs and forgets old ones.
//!
//! An errored job never finalizes, so nothing else would ever delete its
//! scratch file. The reaper deletes it on its next pass; the job itself stays
//! errored. Terminal jobs stay queryable for the retention window, then are
//! evicted from the registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::registry::JobRegistry;

/// Configuration for the job reaper.
#[derive(Debug, Clone)]
pub struct JobReaperConfig {
    /// How often to scan the registry.
    pub poll_interval: Duration,
    /// How long terminal jobs stay queryable.
    pub retention: Duration,
}

impl Default for JobReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 3600), // 24 hours
        }
    }
}

/// Periodically reaps the job registry.
pub struct JobReaper {
    registry: Arc<JobRegistry>,
    config: JobReaperConfig,
    shutdown: Arc<Notify>,
}

impl JobReaper {
    /// Create a new reaper.
    pub fn new(registry: Arc<JobRegistry>, config: JobReaperConfig) -> Self {
        Self {
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Job reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let evicted = self.registry.reap(self.config.retention, Instant::now());
                    if evicted > 0 {
                        info!(evicted, live = self.registry.len(), "Evicted expired jobs");
                    } else {
                        debug!(live = self.registry.len(), "No expired jobs");
                    }
                }
            }
        }

        info!("Job reaper stopped");
    }
}
