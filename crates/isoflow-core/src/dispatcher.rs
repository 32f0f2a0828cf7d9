// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job dispatch.
//!
//! [`JobDispatcher::enqueue`] validates a regional analysis and queues it for
//! a bounded pool; it never waits for the dispatch itself. A pool slot then:
//!
//! 1. detaches the inline scenario and stores it under `{bundle}_{scenario}.json`
//!    in the local cache and (unless offline) the bundle store,
//! 2. registers an assembler sized to `width × height`,
//! 3. builds one task per origin cell,
//! 4. publishes the whole batch to the broker in one request.
//!
//! The assembler is registered before anything is published, so no result
//! can arrive for a job the registry does not know.
//!
//! A job stays in the pending table, with a cancellation token, from
//! `enqueue` until its batch is published. [`JobDispatcher::delete_job`]
//! cancels that token, and the dispatch checks it after registering the
//! assembler and again after publishing, so a deleted job is never brought
//! back by its own dispatch.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use isoflow_grid::AccessGridHeader;
use isoflow_protocol::{JobStatus, RegionalAnalysis, RegionalTask, WorkerCategory};
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assembler::{AccessGridAssembler, ResultAssembler};
use crate::broker::Broker;
use crate::catalog::WorkerCatalog;
use crate::config::{Config, MAX_DISPATCH_CONCURRENCY};
use crate::error::{Error, Result};
use crate::registry::JobRegistry;
use crate::retry::{RetryPolicy, retry_transient};
use crate::store::{ArtifactStore, validate_key};

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Concurrent dispatches, clamped to `1..=20`.
    pub concurrency: usize,
    /// Dispatches that may wait for a slot before `enqueue` reports overload.
    pub queue_capacity: usize,
    /// Local scenario cache.
    pub local_cache: PathBuf,
    /// Directory for assembler scratch files.
    pub scratch_dir: PathBuf,
    /// Queue reference stamped on every task for workers to publish results to.
    pub output_queue: String,
    /// Skip uploading scenarios to the bundle store.
    pub offline: bool,
    /// Retry schedule for broker calls and uploads.
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: MAX_DISPATCH_CONCURRENCY,
            queue_capacity: 512,
            local_cache: PathBuf::from(".data/cache"),
            scratch_dir: std::env::temp_dir(),
            output_queue: ".data/results-spool".to_string(),
            offline: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    /// Dispatcher settings from the service configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.dispatch_concurrency,
            queue_capacity: config.dispatch_queue,
            local_cache: config.local_cache.clone(),
            scratch_dir: config.scratch_dir.clone(),
            output_queue: config.results_spool.display().to_string(),
            offline: config.offline,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of a queued dispatch.
///
/// Dropping the ticket does not cancel the dispatch.
#[derive(Debug)]
pub struct DispatchTicket {
    job_id: String,
    outcome: oneshot::Receiver<Result<()>>,
}

impl DispatchTicket {
    /// Job the ticket belongs to.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait until the job's tasks are published, or dispatch failed.
    pub async fn outcome(self) -> Result<()> {
        self.outcome.await.unwrap_or(Err(Error::ShuttingDown))
    }
}

struct PendingDispatch {
    analysis: RegionalAnalysis,
    reply: oneshot::Sender<Result<()>>,
}

/// Everything a dispatch needs, shared by all pool slots.
struct DispatchContext {
    config: DispatchConfig,
    broker: Arc<dyn Broker>,
    bundle_store: Arc<dyn ArtifactStore>,
    results_store: Arc<dyn ArtifactStore>,
    registry: Arc<JobRegistry>,
    catalog: Arc<WorkerCatalog>,
    /// Jobs accepted by `enqueue` whose batch is not published yet.
    pending: DashMap<String, CancellationToken>,
}

/// Decomposes regional analyses into tasks and publishes them.
pub struct JobDispatcher {
    ctx: Arc<DispatchContext>,
    tx: mpsc::Sender<PendingDispatch>,
    cancel: CancellationToken,
    pool: Mutex<Option<JoinHandle<()>>>,
}

impl JobDispatcher {
    /// Create the dispatcher and start its pool.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        config: DispatchConfig,
        broker: Arc<dyn Broker>,
        bundle_store: Arc<dyn ArtifactStore>,
        results_store: Arc<dyn ArtifactStore>,
        registry: Arc<JobRegistry>,
        catalog: Arc<WorkerCatalog>,
    ) -> Self {
        let concurrency = config.concurrency.clamp(1, MAX_DISPATCH_CONCURRENCY);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();

        info!(
            concurrency,
            queue_capacity = config.queue_capacity,
            offline = config.offline,
            "Job dispatcher started"
        );

        let ctx = Arc::new(DispatchContext {
            config,
            broker,
            bundle_store,
            results_store,
            registry,
            catalog,
            pending: DashMap::new(),
        });
        let pool = tokio::spawn(run_pool(
            ctx.clone(),
            rx,
            Arc::new(Semaphore::new(concurrency)),
            cancel.clone(),
        ));

        Self {
            ctx,
            tx,
            cancel,
            pool: Mutex::new(Some(pool)),
        }
    }

    /// Validate `analysis` and queue it for dispatch.
    ///
    /// Returns [`Error::Overloaded`] immediately when the pending queue is
    /// full, and [`Error::InvalidRequest`] for a malformed request or a job id
    /// that is already live.
    pub fn enqueue(&self, analysis: RegionalAnalysis) -> Result<DispatchTicket> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        validate(&analysis)?;

        let job_id = analysis.id.clone();
        if self.ctx.registry.get(&job_id).is_some() || self.ctx.pending.contains_key(&job_id) {
            return Err(Error::InvalidRequest(format!("job {job_id} already exists")));
        }

        self.ctx
            .pending
            .insert(job_id.clone(), CancellationToken::new());
        let (reply, outcome) = oneshot::channel();
        match self.tx.try_send(PendingDispatch { analysis, reply }) {
            Ok(()) => {
                debug!(job_id = %job_id, "Queued regional analysis for dispatch");
                Ok(DispatchTicket { job_id, outcome })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.ctx.pending.remove(&job_id);
                warn!(
                    job_id = %job_id,
                    capacity = self.ctx.config.queue_capacity,
                    "Dispatch queue full, rejecting regional analysis"
                );
                Err(Error::Overloaded {
                    capacity: self.ctx.config.queue_capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.ctx.pending.remove(&job_id);
                Err(Error::ShuttingDown)
            }
        }
    }

    /// Delete a job: abort and forget it locally, then ask the broker to drop
    /// its outstanding tasks.
    ///
    /// A dispatch still in progress is cancelled and releases whatever it
    /// registered. Local cleanup always happens, even when the broker is
    /// unreachable; the broker failure is returned afterwards. Deleting an
    /// unknown job is not an error.
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        // Cancel before unregistering; dispatch registers before checking
        let was_pending = match self.ctx.pending.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        let assembler = self.ctx.registry.remove(job_id);
        let aborted = assembler.as_ref().is_some_and(|a| a.abort());
        info!(
            job_id = %job_id,
            was_pending,
            was_live = assembler.is_some(),
            aborted,
            "Deleting regional analysis"
        );

        let ctx = &self.ctx;
        retry_transient(&ctx.config.retry, "delete job on broker", || {
            ctx.broker.delete_job(job_id)
        })
        .await
        .map_err(|e| {
            warn!(job_id = %job_id, error = %e, "Broker did not confirm job deletion");
            Error::Broker(e)
        })
    }

    /// Progress of a live job.
    pub fn get_status(&self, job_id: &str) -> Result<JobStatus> {
        self.ctx
            .registry
            .status(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    /// Stop accepting work, fail queued dispatches and stop the pool.
    ///
    /// Dispatches already running are cancelled; their jobs stay registered
    /// and are released by the caller.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool
            && let Err(e) = pool.await
        {
            error!("Dispatch pool task panicked: {}", e);
        }
        info!("Job dispatcher stopped");
    }
}

/// Request checks that need nothing but the request.
fn validate(analysis: &RegionalAnalysis) -> Result<()> {
    let id_ok = !analysis.id.is_empty()
        && !analysis.id.starts_with('.')
        && analysis
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !id_ok {
        return Err(Error::InvalidRequest(format!(
            "job id {:?} must be non-empty and use only [A-Za-z0-9._-]",
            analysis.id
        )));
    }
    if analysis.width <= 0 || analysis.height <= 0 {
        return Err(Error::InvalidRequest(format!(
            "grid is {}x{}, both dimensions must be positive",
            analysis.width, analysis.height
        )));
    }
    if analysis.bundle_id.is_empty() || analysis.worker_version.is_empty() {
        return Err(Error::InvalidRequest(
            "bundleId and workerVersion are required".to_string(),
        ));
    }
    // Without an id the scenario cannot be detached and would ride on every task
    if let Some(scenario) = &analysis.request.scenario
        && !scenario.get("id").is_some_and(serde_json::Value::is_string)
    {
        return Err(Error::InvalidRequest(
            "inline scenario must carry a string id".to_string(),
        ));
    }
    Ok(())
}

async fn run_pool(
    ctx: Arc<DispatchContext>,
    mut rx: mpsc::Receiver<PendingDispatch>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let mut in_flight = JoinSet::new();

    loop {
        let pending = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!("Dispatch task panicked: {}", e);
                }
                continue;
            }

            next = rx.recv() => match next {
                Some(pending) => pending,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = pending.reply.send(Err(Error::ShuttingDown));
                break;
            }
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let ctx = ctx.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            let job_id = pending.analysis.id.clone();
            let outcome = ctx.dispatch(pending.analysis).await;
            if let Err(e) = &outcome {
                error!(job_id = %job_id, error = %e, "Dispatch failed");
            }
            let _ = pending.reply.send(outcome);
        });
    }

    rx.close();
    while let Ok(pending) = rx.try_recv() {
        ctx.pending.remove(&pending.analysis.id);
        let _ = pending.reply.send(Err(Error::ShuttingDown));
    }
    in_flight.shutdown().await;
}

impl DispatchContext {
    async fn dispatch(&self, analysis: RegionalAnalysis) -> Result<()> {
        let job_id = analysis.id.clone();
        let Some(deleted) = self.pending.get(&job_id).map(|entry| entry.value().clone()) else {
            return Ok(());
        };
        let _pending = PendingEntry {
            pending: &self.pending,
            job_id: &job_id,
        };
        if deleted.is_cancelled() {
            info!(job_id = %job_id, "Regional analysis was deleted before dispatch");
            return Ok(());
        }

        // Tasks share one scenario-free copy of the routing request
        let mut request = analysis.request.clone();
        if let Some((scenario_id, scenario)) = request.detach_scenario() {
            let key = analysis.scenario_key(&scenario_id);
            self.store_scenario(&key, serde_json::to_vec(&scenario)?)
                .await?;
        }

        let header = AccessGridHeader {
            zoom: analysis.zoom,
            west: analysis.west,
            north: analysis.north,
            width: analysis.width,
            height: analysis.height,
            values_per_pixel: 1,
        };
        let assembler = {
            let job_id = job_id.clone();
            let scratch_dir = self.config.scratch_dir.clone();
            let store = self.results_store.clone();
            let retry = self.config.retry.clone();
            tokio::task::spawn_blocking(move || {
                AccessGridAssembler::create(job_id, header, &scratch_dir, store, retry)
            })
            .await
            .map_err(std::io::Error::other)??
        };
        let assembler: Arc<dyn ResultAssembler> = Arc::new(assembler);
        if !self.registry.register(assembler.clone()) {
            return Err(Error::InvalidRequest(format!("job {job_id} already exists")));
        }
        if deleted.is_cancelled() {
            self.release(&job_id, &assembler);
            info!(job_id = %job_id, "Regional analysis was deleted during dispatch");
            return Ok(());
        }

        let tasks = build_tasks(&analysis, &request, &self.config.output_queue);

        let published = retry_transient(&self.config.retry, "publish task batch", || {
            self.broker.enqueue_regional(&tasks)
        })
        .await;
        if let Err(e) = published {
            // Nothing was published, so no result will ever arrive
            self.release(&job_id, &assembler);
            return Err(e.into());
        }
        if deleted.is_cancelled() {
            // The broker-side delete may have run before this batch landed
            self.release(&job_id, &assembler);
            warn!(job_id = %job_id, "Regional analysis was deleted while publishing, deleting again");
            retry_transient(&self.config.retry, "delete job on broker", || {
                self.broker.delete_job(&job_id)
            })
            .await?;
            return Ok(());
        }

        let category = WorkerCategory::new(analysis.bundle_id.clone(), analysis.worker_version.clone());
        info!(
            job_id = %job_id,
            tasks = tasks.len(),
            category = %category,
            live_workers = self.catalog.workers_in_category(&category).len(),
            "Enqueued regional analysis"
        );
        if !self.catalog.can_serve(&category) {
            warn!(
                job_id = %job_id,
                category = %category,
                "No live worker serves this category yet, tasks wait at the broker"
            );
        }
        Ok(())
    }

    /// Unregister and abort a job this dispatch registered.
    ///
    /// The pending entry keeps the id from being reused until the dispatch
    /// ends, so the registry entry can only be this dispatch's assembler.
    fn release(&self, job_id: &str, assembler: &Arc<dyn ResultAssembler>) {
        self.registry.remove(job_id);
        assembler.abort();
    }

    async fn store_scenario(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let local = self.config.local_cache.join(key);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, &bytes).await?;
        debug!(path = %local.display(), "Cached scenario locally");

        if !self.config.offline {
            retry_transient(&self.config.retry, "upload scenario", || {
                self.bundle_store.put(key, bytes.clone())
            })
            .await?;
            debug!(key, store = %self.bundle_store.describe(), "Uploaded scenario");
        }
        Ok(())
    }
}

/// Drops a job's pending entry when its dispatch ends, however it ends.
struct PendingEntry<'a> {
    pending: &'a DashMap<String, CancellationToken>,
    job_id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.job_id);
    }
}

/// One task per origin cell, columns outer and rows inner.
fn build_tasks(
    analysis: &RegionalAnalysis,
    request: &isoflow_protocol::RoutingRequest,
    output_queue: &str,
) -> Vec<RegionalTask> {
    let mut tasks = Vec::with_capacity(analysis.task_count() as usize);
    for x in 0..analysis.width {
        for y in 0..analysis.height {
            tasks.push(analysis.task(x, y, request, output_queue));
        }
    }
    tasks
}
