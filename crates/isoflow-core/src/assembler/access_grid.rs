// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Assembler producing access-grid files.
//!
//! Each task contributes one fixed-size record at
//! `AccessGridHeader::LENGTH + task_id × record_len`. The finished file is
//! gzipped and stored under `{job_id}.access`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use isoflow_grid::AccessGridHeader;
use isoflow_protocol::{JobState, JobStatus, RegionalWorkResult};
use tracing::{debug, error, info, warn};

use super::scratch::{ScratchFile, human_bytes, write_at};
use super::{AssemblyError, Delivery, ResultAssembler};
use crate::retry::{RetryPolicy, retry_transient};
use crate::store::ArtifactStore;

/// Fixed-size set of completed task positions.
#[derive(Debug)]
struct CompletionSet {
    words: Vec<u64>,
}

impl CompletionSet {
    fn new(len: u64) -> Self {
        Self {
            words: vec![0; len.div_ceil(64) as usize],
        }
    }

    /// Mark `index`; false if it was already marked.
    fn insert(&mut self, index: u64) -> bool {
        let (word, bit) = ((index / 64) as usize, index % 64);
        let mask = 1u64 << bit;
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }

    fn contains(&self, index: u64) -> bool {
        let (word, bit) = ((index / 64) as usize, index % 64);
        self.words[word] & (1u64 << bit) != 0
    }
}

#[derive(Debug)]
struct AssemblyState {
    phase: JobState,
    completed: CompletionSet,
    n_complete: u64,
    scratch: Option<ScratchFile>,
    terminal_since: Option<Instant>,
    finished_at: Option<DateTime<Utc>>,
}

impl AssemblyState {
    fn enter(&mut self, phase: JobState) {
        self.phase = phase;
        if phase.is_terminal() && self.terminal_since.is_none() {
            self.terminal_since = Some(Instant::now());
            self.finished_at = Some(Utc::now());
        }
    }
}

/// Assembles single-value-per-origin results into an access grid.
pub struct AccessGridAssembler {
    job_id: String,
    header: AccessGridHeader,
    total: u64,
    created_at: DateTime<Utc>,
    store: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
    state: Mutex<AssemblyState>,
}

impl AccessGridAssembler {
    /// Expected number of destination pointsets per result.
    const POINTSETS: usize = 1;
    /// Expected number of percentiles per pointset.
    const PERCENTILES: usize = 1;

    /// Create the assembler and its presized scratch file in `scratch_dir`.
    pub fn create(
        job_id: impl Into<String>,
        header: AccessGridHeader,
        scratch_dir: &Path,
        store: Arc<dyn ArtifactStore>,
        retry: RetryPolicy,
    ) -> Result<Self, AssemblyError> {
        let job_id = job_id.into();
        let total = header.pixel_count();

        info!(
            job_id = %job_id,
            width = header.width,
            height = header.height,
            values_per_pixel = header.values_per_pixel,
            "Expecting results for regional analysis"
        );

        std::fs::create_dir_all(scratch_dir)?;
        let path = scratch_dir.join(format!("{}-{}.access_grid", job_id, uuid::Uuid::new_v4()));
        let scratch = ScratchFile::create(path, &header.to_bytes(), header.file_len())?;

        info!(
            job_id = %job_id,
            path = %scratch.path().display(),
            size = %human_bytes(header.file_len()),
            "Created scratch file to accumulate results"
        );

        Ok(Self {
            job_id,
            header,
            total,
            created_at: Utc::now(),
            store,
            retry,
            state: Mutex::new(AssemblyState {
                phase: JobState::Accumulating,
                completed: CompletionSet::new(total),
                n_complete: 0,
                scratch: Some(scratch),
                terminal_since: None,
                finished_at: None,
            }),
        })
    }

    /// Storage key of the finished artifact.
    pub fn artifact_key(&self) -> String {
        format!("{}.access", self.job_id)
    }

    /// Header written at the start of the artifact.
    pub fn header(&self) -> &AccessGridHeader {
        &self.header
    }

    fn lock(&self) -> MutexGuard<'_, AssemblyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_errored(&self, reason: &AssemblyError) {
        let mut state = self.lock();
        if state.phase == JobState::Accumulating {
            state.enter(JobState::Errored);
            error!(job_id = %self.job_id, error = %reason, "Regional analysis errored, it will not be finalized");
        }
    }

    fn check_dimension(
        &self,
        dimension: &'static str,
        actual: usize,
        expected: usize,
    ) -> Result<(), AssemblyError> {
        if actual == expected {
            return Ok(());
        }
        Err(AssemblyError::DimensionMismatch {
            job_id: self.job_id.clone(),
            dimension,
            expected,
            actual,
        })
    }

    /// Flatten the result into its on-disk record, checking every dimension.
    fn encode_record(&self, result: &RegionalWorkResult) -> Result<Vec<u8>, AssemblyError> {
        let cutoffs = self.header.values_per_pixel.max(0) as usize;
        self.check_dimension(
            "destination pointsets",
            result.accessibility_values.len(),
            Self::POINTSETS,
        )?;
        let mut record = Vec::with_capacity(self.header.record_len() as usize);
        for pointset in &result.accessibility_values {
            self.check_dimension("percentiles", pointset.len(), Self::PERCENTILES)?;
            for percentile in pointset {
                self.check_dimension("cutoffs", percentile.len(), cutoffs)?;
                for value in percentile {
                    record.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
        Ok(record)
    }

    async fn persist(&self, scratch: ScratchFile) -> Result<(), AssemblyError> {
        let raw_len = scratch.len()?;
        let compressed = tokio::task::spawn_blocking(move || scratch.compress())
            .await
            .map_err(std::io::Error::other)??;
        let gz_len = compressed.len()?;

        info!(
            job_id = %self.job_id,
            raw = %human_bytes(raw_len),
            compressed = %human_bytes(gz_len),
            ratio = format!("{:.1}x", raw_len as f64 / gz_len.max(1) as f64),
            "Compressed access grid"
        );

        let key = self.artifact_key();
        retry_transient(&self.retry, "upload access grid", || {
            self.store.put_file(&key, compressed.path())
        })
        .await?;

        info!(
            job_id = %self.job_id,
            key = %key,
            store = %self.store.describe(),
            "Stored finished access grid"
        );
        // Dropping `compressed` removes the local copy
        Ok(())
    }
}

#[async_trait]
impl ResultAssembler for AccessGridAssembler {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    async fn handle_result(&self, result: &RegionalWorkResult) -> Result<Delivery, AssemblyError> {
        let task_id = result.task_id;

        let (handle, offset, record) = {
            let mut state = self.lock();
            if state.phase != JobState::Accumulating {
                debug!(job_id = %self.job_id, task_id, phase = ?state.phase, "Ignoring late result");
                return Ok(Delivery::Ignored(state.phase));
            }
            if task_id >= self.total {
                let err = AssemblyError::TaskIndexOutOfRange {
                    job_id: self.job_id.clone(),
                    task_id,
                    total: self.total,
                };
                state.enter(JobState::Errored);
                error!(job_id = %self.job_id, error = %err, "Regional analysis errored, it will not be finalized");
                return Err(err);
            }
            if state.completed.contains(task_id) {
                debug!(job_id = %self.job_id, task_id, "Duplicate result");
                return Ok(Delivery::Duplicate);
            }
            let record = match self.encode_record(result) {
                Ok(record) => record,
                Err(err) => {
                    drop(state);
                    self.mark_errored(&err);
                    return Err(err);
                }
            };
            let Some(scratch) = state.scratch.as_ref() else {
                return Ok(Delivery::Ignored(state.phase));
            };
            (scratch.handle(), self.header.record_offset(task_id), record)
        };

        // Records of distinct tasks never overlap, so the write happens unlocked
        let written = tokio::task::spawn_blocking(move || write_at(&handle, offset, &record))
            .await
            .map_err(std::io::Error::other)
            .and_then(|r| r);
        if let Err(e) = written {
            let err = AssemblyError::Io(e);
            self.mark_errored(&err);
            return Err(err);
        }

        let delivery = {
            let mut state = self.lock();
            if state.phase != JobState::Accumulating {
                // Aborted while the write was in flight; the file is already gone
                return Ok(Delivery::Ignored(state.phase));
            }
            if !state.completed.insert(task_id) {
                return Ok(Delivery::Duplicate);
            }
            state.n_complete += 1;
            debug!(
                job_id = %self.job_id,
                task_id,
                complete = state.n_complete,
                total = self.total,
                "Result placed"
            );
            if state.n_complete == self.total {
                state.enter(JobState::Finishing);
                Delivery::Completed
            } else {
                Delivery::Accepted
            }
        };

        if delivery == Delivery::Completed {
            info!(job_id = %self.job_id, total = self.total, "Finished receiving results");
            self.finish().await?;
        }
        Ok(delivery)
    }

    async fn finish(&self) -> Result<(), AssemblyError> {
        let scratch = {
            let mut state = self.lock();
            if state.phase != JobState::Finishing {
                return Ok(());
            }
            match state.scratch.take() {
                Some(scratch) => scratch,
                // Another caller is already finalizing
                None => return Ok(()),
            }
        };

        let outcome = self.persist(scratch).await;

        let mut state = self.lock();
        match &outcome {
            Ok(()) => state.enter(JobState::Finished),
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "Failed to persist finished access grid");
                state.enter(JobState::Errored);
            }
        }
        outcome
    }

    fn abort(&self) -> bool {
        let released = {
            let mut state = self.lock();
            match state.phase {
                JobState::Accumulating | JobState::Errored => {
                    state.enter(JobState::Aborted);
                    state.scratch.take()
                }
                JobState::Finishing => {
                    warn!(job_id = %self.job_id, "Abort requested while finishing, letting it complete");
                    return false;
                }
                JobState::Finished | JobState::Aborted => return false,
            }
        };
        info!(
            job_id = %self.job_id,
            released_scratch = released.is_some(),
            "Regional analysis aborted"
        );
        // Dropping outside the lock deletes the scratch file
        drop(released);
        true
    }

    fn release_scratch(&self) -> bool {
        let released = {
            let mut state = self.lock();
            if state.phase != JobState::Errored {
                return false;
            }
            state.scratch.take()
        };
        let Some(scratch) = released else {
            return false;
        };
        drop(scratch);
        debug!(job_id = %self.job_id, "Released scratch file of errored job");
        true
    }

    fn status(&self) -> JobStatus {
        let state = self.lock();
        JobStatus {
            job_id: self.job_id.clone(),
            total: self.total,
            complete: state.n_complete,
            state: state.phase,
            created_at: self.created_at,
            finished_at: state.finished_at,
        }
    }

    fn terminal_since(&self) -> Option<Instant> {
        self.lock().terminal_since
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryArtifactStore;
    use flate2::read::GzDecoder;
    use isoflow_grid::read_access_grid;
    use std::io::Read;
    use std::time::Duration;
    use tempfile::TempDir;

    fn header(width: i32, height: i32) -> AccessGridHeader {
        AccessGridHeader {
            zoom: 9,
            west: 100,
            north: 200,
            width,
            height,
            values_per_pixel: 1,
        }
    }

    fn assembler(dir: &TempDir, store: &MemoryArtifactStore, width: i32, height: i32) -> AccessGridAssembler {
        AccessGridAssembler::create(
            "job-1",
            header(width, height),
            dir.path(),
            Arc::new(store.clone()),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        )
        .unwrap()
    }

    fn scratch_files(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    async fn stored_values(store: &MemoryArtifactStore) -> (AccessGridHeader, Vec<i32>) {
        let gz = store.get("job-1.access").await.unwrap();
        let mut raw = Vec::new();
        GzDecoder::new(gz.as_slice()).read_to_end(&mut raw).unwrap();
        let (header, records) = read_access_grid(raw.as_slice()).unwrap();
        (header, records.into_iter().flatten().collect())
    }

    #[test]
    fn test_completion_set() {
        let mut set = CompletionSet::new(130);
        assert!(set.insert(0));
        assert!(set.insert(129));
        assert!(!set.insert(129));
        assert!(set.contains(0) && set.contains(129));
        assert!(!set.contains(64));
    }

    #[tokio::test]
    async fn test_permutation_with_duplicates_finishes_once() {
        let dir = TempDir::new().unwrap();
        let store = MemoryArtifactStore::new();
        let asm = assembler(&dir, &store, 4, 3);
        assert_eq!(scratch_files(&dir), 1);

        // Stride permutation of 0..12, every other position delivered twice
        let order: Vec<u64> = (0..12).map(|i| (i * 5) % 12).collect();
        let mut completions = 0;
        for (n, &task) in order.iter().enumerate() {
            let result = RegionalWorkResult::single("job-1", task, task as i32 * 10);
            if asm.handle_result(&result).await.unwrap() == Delivery::Completed {
                completions += 1;
            }
            if n % 2 == 0 {
                let again = asm.handle_result(&result).await.unwrap();
                assert!(matches!(again, Delivery::Duplicate | Delivery::Ignored(_)));
            }
            assert!(asm.status().complete <= 12);
        }

        assert_eq!(completions, 1);
        let status = asm.status();
        assert_eq!((status.total, status.complete), (12, 12));
        assert_eq!(status.state, JobState::Finished);
        assert!(asm.terminal_since().is_some());
        assert!(status.finished_at.is_some_and(|at| at >= status.created_at));
        assert_eq!(store.put_count(), 1);
        assert_eq!(scratch_files(&dir), 0);

        let (h, values) = stored_values(&store).await;
        assert_eq!(h, header(4, 3));
        assert_eq!(values, (0..12).map(|v| v * 10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrent_delivery() {
        let dir = TempDir::new().unwrap();
        let store = MemoryArtifactStore::new();
        let asm = Arc::new(assembler(&dir, &store, 16, 16));

        let handles: Vec<_> = (0..4u64)
            .map(|worker| {
                let asm = asm.clone();
                tokio::spawn(async move {
                    // Every worker delivers every position, in its own order
                    for i in 0..256u64 {
                        let task = (i * 7 + worker * 64) % 256;
                        let result = RegionalWorkResult::single("job-1", task, -(task as i32));
                        asm.handle_result(&result).await.unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(asm.status().complete, 256);
        assert_eq!(asm.status().state, JobState::Finished);
        assert_eq!(store.put_count(), 1);
        let (_, values) = stored_values(&store).await;
        assert_eq!(values, (0..256).map(|v| -v).collect::<Vec<i32>>());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_errors_job() {
        let dir = TempDir::new().unwrap();
        let store = MemoryArtifactStore::new();
        let asm = assembler(&dir, &store, 2, 1);

        let bad = RegionalWorkResult {
            job_id: "job-1".into(),
            task_id: 0,
            accessibility_values: vec![vec![vec![1, 2]]],
        };
        let err = asm.handle_result(&bad).await.unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::DimensionMismatch { dimension: "cutoffs", expected: 1, actual: 2, .. }
        ));
        assert_eq!(asm.status().state, JobState::Errored);

        // Errored jobs never finalize, and later results are ignored
        for task in 0..2 {
            let d = asm.handle_result(&RegionalWorkResult::single("job-1", task, 1)).await.unwrap();
            assert_eq!(d, Delivery::Ignored(JobState::Errored));
        }
        assert_eq!(store.put_count(), 0);
        // Scratch stays until the job is reaped or deleted
        assert_eq!(scratch_files(&dir), 1);
        assert!(asm.abort());
        assert_eq!(scratch_files(&dir), 0);
        assert_eq!(asm.status().state, JobState::Aborted);
    }

    #[tokio::test]
    async fn test_release_scratch_keeps_job_errored() {
        let dir = TempDir::new().unwrap();
        let store = MemoryArtifactStore::new();
        let asm = assembler(&dir, &store, 2, 1);

        // Only errored jobs give up their scratch this way
        assert!(!asm.release_scratch());
        assert_eq!(scratch_files(&dir), 1);

        asm.handle_result(&RegionalWorkResult::single("job-1", 5, 1))
            .await
            .unwrap_err();
        assert!(asm.release_scratch());
        assert_eq!(scratch_files(&dir), 0);
        assert_eq!(asm.status().state, JobState::Errored);
        assert!(!asm.release_scratch());

        // Deleting it afterwards still works
        assert!(asm.abort());
        assert_eq!(asm.status().state, JobState::Aborted);
    }

    #[tokio::test]
    async fn test_out_of_range_task_errors_job() {
        let dir = TempDir::new().unwrap();
        let store = MemoryArtifactStore::new();
        let asm = assembler(&dir, &store, 2, 2);
        let err = asm
            .handle_result(&RegionalWorkResult::single("job-1", 4, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AssemblyError::TaskIndexOutOfRange { task_id: 4, total: 4, .. }));
        assert_eq!(asm.status().state, JobState::Errored);
    }

    #[tokio::test]
    async fn test_abort_then_stale_result_is_silent() {
        let dir = TempDir::new().unwrap();
        let store = MemoryArtifactStore::new();
        let asm = assembler(&dir, &store, 2, 2);
        asm.handle_result(&RegionalWorkResult::single("job-1", 0, 5)).await.unwrap();

        assert!(asm.abort());
        assert!(!asm.abort());
        assert_eq!(scratch_files(&dir), 0);

        let d = asm
            .handle_result(&RegionalWorkResult::single("job-1", 1, 5))
            .await
            .unwrap();
        assert_eq!(d, Delivery::Ignored(JobState::Aborted));
        assert_eq!(scratch_files(&dir), 0);
        let status = asm.status();
        assert_eq!((status.complete, status.state), (1, JobState::Aborted));
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_upload_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        let store = MemoryArtifactStore::new();
        store.fail_next_puts(2);
        let asm = assembler(&dir, &store, 1, 1);

        let d = asm
            .handle_result(&RegionalWorkResult::single("job-1", 0, 42))
            .await
            .unwrap();
        assert_eq!(d, Delivery::Completed);
        assert_eq!(asm.status().state, JobState::Finished);
        assert_eq!(stored_values(&store).await.1, vec![42]);
    }

    #[tokio::test]
    async fn test_exhausted_upload_errors_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let store = MemoryArtifactStore::new();
        store.fail_next_puts(10);
        let asm = assembler(&dir, &store, 1, 1);

        let err = asm
            .handle_result(&RegionalWorkResult::single("job-1", 0, 42))
            .await
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Store(_)));
        assert_eq!(asm.status().state, JobState::Errored);
        assert_eq!(scratch_files(&dir), 0);
        // A second finish attempt has nothing to do
        asm.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases_scratch() {
        let dir = TempDir::new().unwrap();
        let store = MemoryArtifactStore::new();
        let asm = assembler(&dir, &store, 8, 8);
        assert_eq!(scratch_files(&dir), 1);
        drop(asm);
        assert_eq!(scratch_files(&dir), 0);
    }
}
