// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that purges dead workers from the catalog.
//!
//! Workers announce themselves on every contact. One that stops contacting
//! the broker (crashed, scaled down, partitioned) stays in the catalog until
//! this monitor notices its last sighting is older than the catalog's
//! staleness window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::catalog::WorkerCatalog;

/// Configuration for the catalog monitor.
#[derive(Debug, Clone)]
pub struct CatalogMonitorConfig {
    /// How often to purge.
    pub poll_interval: Duration,
}

impl Default for CatalogMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30), // Check every 30 seconds
        }
    }
}

/// Background worker that periodically purges dead workers.
pub struct CatalogMonitor {
    catalog: Arc<WorkerCatalog>,
    config: CatalogMonitorConfig,
    shutdown: Arc<Notify>,
}

impl CatalogMonitor {
    /// Create a new catalog monitor.
    pub fn new(catalog: Arc<WorkerCatalog>, config: CatalogMonitorConfig) -> Self {
        Self {
            catalog,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Catalog monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Catalog monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let purged = self.catalog.purge_dead_workers();
                    if purged == 0 {
                        debug!(workers = self.catalog.size(), "No dead workers");
                    }
                }
            }
        }

        info!("Catalog monitor stopped");
    }
}
