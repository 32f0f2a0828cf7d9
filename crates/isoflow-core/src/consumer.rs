// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result intake.
//!
//! Workers publish [`WorkerMessage`]s to a queue. A [`ResultConsumer`] runs
//! several tasks that pull from a [`ResultSource`], hand results to the
//! matching job's assembler and heartbeats to the worker catalog, then
//! acknowledge the message.
//!
//! Every message is acknowledged once processed, including results for
//! unknown or deleted jobs and results the assembler rejected. Redelivery of
//! lost results is the broker's business, not the queue's.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use isoflow_protocol::{RegionalWorkResult, WorkerMessage};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assembler::Delivery;
use crate::catalog::WorkerCatalog;
use crate::error::Result;
use crate::registry::JobRegistry;

/// A received message and the token that acknowledges it.
#[derive(Debug)]
pub struct Envelope {
    /// The message itself.
    pub message: WorkerMessage,
    /// Source-specific acknowledgement token.
    pub receipt: String,
}

/// A queue of worker messages.
#[async_trait]
pub trait ResultSource: Send + Sync {
    /// Wait up to `timeout` for the next message.
    async fn receive(&self, timeout: Duration) -> Result<Option<Envelope>>;

    /// Remove a processed message for good.
    async fn ack(&self, receipt: &str) -> Result<()>;
}

/// In-process source fed through an mpsc channel. Acks are no-ops.
pub struct ChannelResultSource {
    rx: Mutex<mpsc::Receiver<WorkerMessage>>,
}

impl ChannelResultSource {
    /// Create the source and the sender workers publish to.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<WorkerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { rx: Mutex::new(rx) }, tx)
    }
}

#[async_trait]
impl ResultSource for ChannelResultSource {
    async fn receive(&self, timeout: Duration) -> Result<Option<Envelope>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(message)) => Ok(Some(Envelope {
                message,
                receipt: String::new(),
            })),
            Ok(None) => {
                // Every sender is gone; behave like an empty queue
                drop(rx);
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    async fn ack(&self, _receipt: &str) -> Result<()> {
        Ok(())
    }
}

/// Directory-backed queue: one JSON [`WorkerMessage`] per `*.json` file.
///
/// Producers must write under another name and rename into place. A consumer
/// claims a file by renaming it to `*.json.claimed`, so concurrent consumers
/// never process the same file; acknowledging deletes it. Claimed files left
/// behind by a crash are put back on [`open`](Self::open).
pub struct SpoolResultSource {
    dir: PathBuf,
    poll_interval: Duration,
}

const SPOOL_EXT: &str = "json";
const CLAIMED_EXT: &str = "claimed";

impl SpoolResultSource {
    /// Open (creating if needed) the spool directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut restored = 0;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == CLAIMED_EXT) {
                tokio::fs::rename(&path, path.with_extension("")).await?;
                restored += 1;
            }
        }
        if restored > 0 {
            info!(dir = %dir.display(), restored, "Returned unacknowledged messages to the spool");
        }

        Ok(Self {
            dir,
            poll_interval: Duration::from_millis(100),
        })
    }

    /// Override how often an empty spool is rescanned.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spool directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn pending(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == SPOOL_EXT) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Claim and parse the oldest-named pending file, if any.
    async fn try_claim(&self) -> Result<Option<Envelope>> {
        for path in self.pending().await? {
            let mut claimed = path.clone().into_os_string();
            claimed.push(".");
            claimed.push(CLAIMED_EXT);
            let claimed = PathBuf::from(claimed);

            match tokio::fs::rename(&path, &claimed).await {
                Ok(()) => {}
                // Another consumer got there first
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let bytes = tokio::fs::read(&claimed).await?;
            match serde_json::from_slice::<WorkerMessage>(&bytes) {
                Ok(message) => {
                    return Ok(Some(Envelope {
                        message,
                        receipt: claimed.display().to_string(),
                    }));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding malformed spool message");
                    tokio::fs::remove_file(&claimed).await?;
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ResultSource for SpoolResultSource {
    async fn receive(&self, timeout: Duration) -> Result<Option<Envelope>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.try_claim().await? {
                return Ok(Some(envelope));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        match tokio::fs::remove_file(receipt).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of concurrent consumer tasks.
    pub consumers: usize,
    /// How long one receive call waits before checking for shutdown.
    pub receive_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumers: 2,
            receive_timeout: Duration::from_secs(1),
        }
    }
}

/// Feeds worker messages to assemblers and the catalog.
pub struct ResultConsumer {
    source: Arc<dyn ResultSource>,
    registry: Arc<JobRegistry>,
    catalog: Arc<WorkerCatalog>,
    config: ConsumerConfig,
    cancel: CancellationToken,
}

impl ResultConsumer {
    /// Create a consumer.
    pub fn new(
        source: Arc<dyn ResultSource>,
        registry: Arc<JobRegistry>,
        catalog: Arc<WorkerCatalog>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            source,
            registry,
            catalog,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops every consumer task when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the consumer tasks until shutdown.
    pub async fn run(self: Arc<Self>) {
        let consumers = self.config.consumers.max(1);
        info!(consumers, "Result consumer started");

        let mut tasks = JoinSet::new();
        for index in 0..consumers {
            let this = self.clone();
            tasks.spawn(async move { this.consume(index).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Result consumer task panicked: {}", e);
            }
        }

        info!("Result consumer stopped");
    }

    async fn consume(&self, index: usize) {
        loop {
            let received = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                received = self.source.receive(self.config.receive_timeout) => received,
            };

            match received {
                Ok(Some(envelope)) => {
                    self.process(envelope.message).await;
                    if let Err(e) = self.source.ack(&envelope.receipt).await {
                        warn!(consumer = index, error = %e, "Failed to acknowledge message");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(consumer = index, error = %e, "Failed to receive from result queue");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.receive_timeout) => {}
                    }
                }
            }
        }
        debug!(consumer = index, "Consumer task stopped");
    }

    /// Route one message.
    pub async fn process(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::Status(status) => self.catalog.catalog(&status),
            WorkerMessage::Result(result) => self.deliver(&result).await,
        }
    }

    async fn deliver(&self, result: &RegionalWorkResult) {
        let Some(assembler) = self.registry.get(&result.job_id) else {
            debug!(
                job_id = %result.job_id,
                task_id = result.task_id,
                "Result for unknown or deleted job, dropping"
            );
            return;
        };

        match assembler.handle_result(result).await {
            Ok(Delivery::Accepted | Delivery::Completed) => {}
            Ok(Delivery::Duplicate) => {
                debug!(job_id = %result.job_id, task_id = result.task_id, "Duplicate result");
            }
            Ok(Delivery::Ignored(state)) => {
                debug!(
                    job_id = %result.job_id,
                    task_id = result.task_id,
                    state = ?state,
                    "Result for job no longer accepting results"
                );
            }
            Err(e) => {
                error!(job_id = %result.job_id, task_id = result.task_id, error = %e, "Result rejected");
            }
        }
    }
}
