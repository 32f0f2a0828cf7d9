// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for isoflow-core integration tests.
//!
//! Provides TestContext, which starts a full runtime against in-memory
//! stores, a mock or custom broker, and an in-process result channel.

#![allow(dead_code)]

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;

use isoflow_core::broker::Broker;
use isoflow_core::consumer::{ChannelResultSource, ConsumerConfig};
use isoflow_core::dispatcher::DispatchConfig;
use isoflow_core::retry::RetryPolicy;
use isoflow_core::runtime::AnalysisRuntime;
use isoflow_core::store::{ArtifactStore, MemoryArtifactStore};
use isoflow_grid::{AccessGridHeader, read_access_grid};
use isoflow_protocol::{JobState, RegionalAnalysis, WorkerMessage};

/// A running runtime plus handles to everything around it.
pub struct TestContext {
    pub dir: TempDir,
    pub results: MemoryArtifactStore,
    pub bundles: MemoryArtifactStore,
    pub sender: mpsc::Sender<WorkerMessage>,
    pub runtime: AnalysisRuntime,
}

impl TestContext {
    /// Start a runtime with `consumers` consumer tasks.
    pub async fn start(broker: Arc<dyn Broker>, consumers: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let results = MemoryArtifactStore::new();
        let bundles = MemoryArtifactStore::new();
        let (source, sender) = ChannelResultSource::new(1024);

        let runtime = AnalysisRuntime::builder()
            .broker(broker)
            .results_store(Arc::new(results.clone()))
            .bundle_store(Arc::new(bundles.clone()))
            .result_source(Arc::new(source))
            .dispatch_config(DispatchConfig {
                concurrency: 4,
                queue_capacity: 16,
                local_cache: dir.path().join("cache"),
                scratch_dir: dir.path().join("scratch"),
                output_queue: "results".to_string(),
                offline: false,
                retry: RetryPolicy::new(5, Duration::from_millis(2), Duration::from_millis(20)),
            })
            .consumer_config(ConsumerConfig {
                consumers,
                receive_timeout: Duration::from_millis(20),
            })
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        Self {
            dir,
            results,
            bundles,
            sender,
            runtime,
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    /// Files currently in the scratch directory.
    pub fn scratch_files(&self) -> usize {
        std::fs::read_dir(self.scratch_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    pub async fn send(&self, message: impl Into<WorkerMessage>) {
        self.sender.send(message.into()).await.unwrap();
    }

    /// Wait until a job reaches `state`, panicking after five seconds.
    pub async fn wait_for_state(&self, job_id: &str, state: JobState) {
        let dispatcher = self.runtime.dispatcher().clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if dispatcher.get_status(job_id).is_ok_and(|s| s.state == state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "job {job_id} did not reach {state:?}, status: {:?}",
                dispatcher.get_status(job_id)
            )
        });
    }

    /// Decode the finished artifact of a job.
    pub async fn artifact(&self, job_id: &str) -> (AccessGridHeader, Vec<i32>) {
        let gz = self.results.get(&format!("{job_id}.access")).await.unwrap();
        let mut raw = Vec::new();
        GzDecoder::new(gz.as_slice()).read_to_end(&mut raw).unwrap();
        let (header, records) = read_access_grid(raw.as_slice()).unwrap();
        (header, records.into_iter().flatten().collect())
    }

    /// Shut the runtime down, handing back the working directory for inspection.
    pub async fn shutdown(self) -> TempDir {
        tokio::time::timeout(Duration::from_secs(10), self.runtime.shutdown())
            .await
            .expect("runtime shutdown hung")
            .unwrap();
        self.dir
    }
}

/// A regional analysis over a `width × height` grid at zoom 9.
pub fn analysis(id: &str, width: i32, height: i32) -> RegionalAnalysis {
    serde_json::from_value(json!({
        "id": id,
        "bundleId": "bundle-7",
        "projectId": "proj-3",
        "workerVersion": "v4.2.0",
        "zoom": 9,
        "west": 130,
        "north": 170,
        "width": width,
        "height": height,
        "cutoffMinutes": 60,
        "grid": "jobs",
        "request": {
            "fromTime": 25200,
            "toTime": 28800,
            "walkSpeed": 1.3,
            "scenario": { "id": "baseline", "modifications": [] }
        }
    }))
    .unwrap()
}

/// The value a well-behaved worker computes for a task.
pub fn expected_value(job_id: &str, task_id: u64) -> i32 {
    let salt: i32 = job_id.bytes().map(i32::from).sum();
    salt * 1000 + task_id as i32 * 7
}
