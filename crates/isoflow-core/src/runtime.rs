// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the isoflow orchestrator.
//!
//! [`AnalysisRuntime`] owns every long-lived piece: the job registry, the
//! worker catalog, the dispatcher pool, the result consumers and the
//! background monitor and reaper. Nothing starts as a side effect; it all
//! starts in [`AnalysisRuntimeConfig::start`] and stops in
//! [`AnalysisRuntime::shutdown`].
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use isoflow_core::broker::HttpBroker;
//! use isoflow_core::consumer::SpoolResultSource;
//! use isoflow_core::runtime::AnalysisRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = AnalysisRuntime::builder()
//!         .broker(Arc::new(HttpBroker::new("http://localhost:6001")?))
//!         .results_store(isoflow_core::store::from_url("file://.data/results").await?)
//!         .bundle_store(isoflow_core::store::from_url("file://.data/bundles").await?)
//!         .result_source(Arc::new(SpoolResultSource::open(".data/results-spool").await?))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let ticket = runtime.dispatcher().enqueue(analysis)?;
//!     ticket.outcome().await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::Broker;
use crate::catalog::{WORKER_RECORD_DURATION, WorkerCatalog};
use crate::catalog_monitor::{CatalogMonitor, CatalogMonitorConfig};
use crate::config::Config;
use crate::consumer::{ConsumerConfig, ResultConsumer, ResultSource};
use crate::dispatcher::{DispatchConfig, JobDispatcher};
use crate::reaper::{JobReaper, JobReaperConfig};
use crate::registry::JobRegistry;
use crate::store::ArtifactStore;

/// Builder for creating an [`AnalysisRuntime`].
pub struct AnalysisRuntimeBuilder {
    broker: Option<Arc<dyn Broker>>,
    results_store: Option<Arc<dyn ArtifactStore>>,
    bundle_store: Option<Arc<dyn ArtifactStore>>,
    result_source: Option<Arc<dyn ResultSource>>,
    dispatch_config: DispatchConfig,
    consumer_config: ConsumerConfig,
    monitor_config: CatalogMonitorConfig,
    reaper_config: JobReaperConfig,
    worker_stale_after: Duration,
}

impl Default for AnalysisRuntimeBuilder {
    fn default() -> Self {
        Self {
            broker: None,
            results_store: None,
            bundle_store: None,
            result_source: None,
            dispatch_config: DispatchConfig::default(),
            consumer_config: ConsumerConfig::default(),
            monitor_config: CatalogMonitorConfig::default(),
            reaper_config: JobReaperConfig::default(),
            worker_stale_after: WORKER_RECORD_DURATION,
        }
    }
}

impl AnalysisRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every tunable from the service configuration.
    pub fn config(mut self, config: &Config) -> Self {
        self.dispatch_config = DispatchConfig::from_config(config);
        self.consumer_config.consumers = config.consumers;
        self.reaper_config.retention = config.job_retention;
        self.worker_stale_after = config.worker_stale_after;
        self
    }

    /// Set the broker client (required).
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the store finished grids are persisted to (required).
    pub fn results_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.results_store = Some(store);
        self
    }

    /// Set the store detached scenarios are uploaded to (required).
    pub fn bundle_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.bundle_store = Some(store);
        self
    }

    /// Set the queue worker messages are read from (required).
    pub fn result_source(mut self, source: Arc<dyn ResultSource>) -> Self {
        self.result_source = Some(source);
        self
    }

    /// Set the dispatcher configuration.
    pub fn dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch_config = config;
        self
    }

    /// Set the result consumer configuration.
    ///
    /// Default: 2 consumers, 1 second receive timeout
    pub fn consumer_config(mut self, config: ConsumerConfig) -> Self {
        self.consumer_config = config;
        self
    }

    /// Set the catalog monitor configuration.
    ///
    /// Default: purge every 30 seconds
    pub fn monitor_config(mut self, config: CatalogMonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    /// Set the job reaper configuration.
    ///
    /// Default: scan every minute, keep terminal jobs for 24 hours
    pub fn reaper_config(mut self, config: JobReaperConfig) -> Self {
        self.reaper_config = config;
        self
    }

    /// Set how long a silent worker stays in the catalog.
    ///
    /// Default: 2 minutes
    pub fn worker_stale_after(mut self, window: Duration) -> Self {
        self.worker_stale_after = window;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<AnalysisRuntimeConfig> {
        let broker = self
            .broker
            .ok_or_else(|| anyhow::anyhow!("broker is required"))?;
        let results_store = self
            .results_store
            .ok_or_else(|| anyhow::anyhow!("results_store is required"))?;
        let bundle_store = self
            .bundle_store
            .ok_or_else(|| anyhow::anyhow!("bundle_store is required"))?;
        let result_source = self
            .result_source
            .ok_or_else(|| anyhow::anyhow!("result_source is required"))?;

        Ok(AnalysisRuntimeConfig {
            broker,
            results_store,
            bundle_store,
            result_source,
            dispatch_config: self.dispatch_config,
            consumer_config: self.consumer_config,
            monitor_config: self.monitor_config,
            reaper_config: self.reaper_config,
            worker_stale_after: self.worker_stale_after,
        })
    }
}

/// Configuration for an [`AnalysisRuntime`].
pub struct AnalysisRuntimeConfig {
    broker: Arc<dyn Broker>,
    results_store: Arc<dyn ArtifactStore>,
    bundle_store: Arc<dyn ArtifactStore>,
    result_source: Arc<dyn ResultSource>,
    dispatch_config: DispatchConfig,
    consumer_config: ConsumerConfig,
    monitor_config: CatalogMonitorConfig,
    reaper_config: JobReaperConfig,
    worker_stale_after: Duration,
}

impl AnalysisRuntimeConfig {
    /// Start the runtime, spawning the dispatcher pool, consumers, monitor and reaper.
    pub async fn start(self) -> Result<AnalysisRuntime> {
        tokio::fs::create_dir_all(&self.dispatch_config.scratch_dir).await?;
        tokio::fs::create_dir_all(&self.dispatch_config.local_cache).await?;

        let registry = Arc::new(JobRegistry::new());
        let catalog = Arc::new(WorkerCatalog::new(
            self.worker_stale_after,
            self.dispatch_config.offline,
        ));

        let dispatcher = Arc::new(JobDispatcher::start(
            self.dispatch_config.clone(),
            self.broker.clone(),
            self.bundle_store.clone(),
            self.results_store.clone(),
            registry.clone(),
            catalog.clone(),
        ));

        // Create result consumer
        let consumer = Arc::new(ResultConsumer::new(
            self.result_source.clone(),
            registry.clone(),
            catalog.clone(),
            self.consumer_config.clone(),
        ));
        let consumer_shutdown = consumer.shutdown_handle();
        let consumer_handle = tokio::spawn(consumer.run());

        // Create catalog monitor
        let monitor = CatalogMonitor::new(catalog.clone(), self.monitor_config.clone());
        let monitor_shutdown = monitor.shutdown_handle();
        let monitor_handle = tokio::spawn(async move {
            monitor.run().await;
        });

        // Create job reaper
        let reaper = JobReaper::new(registry.clone(), self.reaper_config.clone());
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(async move {
            reaper.run().await;
        });

        info!(
            results_store = %self.results_store.describe(),
            bundle_store = %self.bundle_store.describe(),
            consumers = self.consumer_config.consumers,
            offline = self.dispatch_config.offline,
            "AnalysisRuntime started"
        );

        Ok(AnalysisRuntime {
            registry,
            catalog,
            dispatcher,
            consumer_handle,
            monitor_handle,
            reaper_handle,
            consumer_shutdown,
            monitor_shutdown,
            reaper_shutdown,
        })
    }
}

/// A running orchestrator that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct AnalysisRuntime {
    registry: Arc<JobRegistry>,
    catalog: Arc<WorkerCatalog>,
    dispatcher: Arc<JobDispatcher>,
    consumer_handle: JoinHandle<()>,
    monitor_handle: JoinHandle<()>,
    reaper_handle: JoinHandle<()>,
    consumer_shutdown: CancellationToken,
    monitor_shutdown: Arc<Notify>,
    reaper_shutdown: Arc<Notify>,
}

impl AnalysisRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> AnalysisRuntimeBuilder {
        AnalysisRuntimeBuilder::new()
    }

    /// Job intake, deletion and status.
    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    /// Live jobs.
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Live workers.
    pub fn catalog(&self) -> &Arc<WorkerCatalog> {
        &self.catalog
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops intake first, then the consumers, monitor and reaper, and finally
    /// aborts every job still accumulating so its scratch file is removed.
    pub async fn shutdown(self) -> Result<()> {
        info!("AnalysisRuntime shutting down...");

        self.dispatcher.shutdown().await;

        self.consumer_shutdown.cancel();
        self.monitor_shutdown.notify_one();
        self.reaper_shutdown.notify_one();

        if let Err(e) = self.consumer_handle.await {
            error!("Result consumer task panicked: {}", e);
        }
        if let Err(e) = self.monitor_handle.await {
            error!("Catalog monitor task panicked: {}", e);
        }
        if let Err(e) = self.reaper_handle.await {
            error!("Job reaper task panicked: {}", e);
        }

        let aborted = self.registry.abort_all();
        info!(aborted, "AnalysisRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.consumer_handle.is_finished()
            && !self.monitor_handle.is_finished()
            && !self.reaper_handle.is_finished()
    }
}
