// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redelivery contract tests.
//!
//! The broker in this file re-enqueues every task whose result it has not
//! seen within a deadline. Simulated workers lose about a fifth of their
//! results and sometimes send a late duplicate. Whatever the loss pattern,
//! every job must finish exactly once with the right values.

mod common;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use isoflow_core::broker::{Broker, BrokerError};
use isoflow_protocol::{JobState, RegionalTask, RegionalWorkResult, WorkerMessage};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;

const REDELIVERY_DEADLINE: Duration = Duration::from_millis(150);

struct Outstanding {
    task: RegionalTask,
    handed_out: Option<tokio::time::Instant>,
}

/// Broker that hands tasks to workers and redelivers the ones whose results
/// never came back.
#[derive(Default)]
struct RedeliveringBroker {
    queue: Mutex<VecDeque<RegionalTask>>,
    outstanding: Mutex<HashMap<(String, u64), Outstanding>>,
    available: Notify,
    redelivered: AtomicU64,
}

impl RedeliveringBroker {
    async fn next_task(&self, cancel: &CancellationToken) -> Option<RegionalTask> {
        loop {
            let next = self.queue.lock().await.pop_front();
            if let Some(task) = next {
                let key = (task.job_id.clone(), task.task_id);
                if let Some(entry) = self.outstanding.lock().await.get_mut(&key) {
                    entry.handed_out = Some(tokio::time::Instant::now());
                    return Some(task);
                }
                // Completed or deleted while queued
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.available.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    async fn result_seen(&self, job_id: &str, task_id: u64) {
        self.outstanding
            .lock()
            .await
            .remove(&(job_id.to_string(), task_id));
    }

    /// Requeue every task handed out longer ago than the deadline.
    async fn redeliver_overdue(&self) {
        let now = tokio::time::Instant::now();
        let mut overdue = Vec::new();
        for entry in self.outstanding.lock().await.values_mut() {
            if entry
                .handed_out
                .is_some_and(|at| now.duration_since(at) > REDELIVERY_DEADLINE)
            {
                entry.handed_out = None;
                overdue.push(entry.task.clone());
            }
        }
        if !overdue.is_empty() {
            self.redelivered.fetch_add(overdue.len() as u64, Ordering::SeqCst);
            self.queue.lock().await.extend(overdue);
            self.available.notify_waiters();
        }
    }

    async fn outstanding(&self) -> usize {
        self.outstanding.lock().await.len()
    }
}

#[async_trait]
impl Broker for RedeliveringBroker {
    async fn enqueue_regional(&self, tasks: &[RegionalTask]) -> Result<(), BrokerError> {
        let mut outstanding = self.outstanding.lock().await;
        for task in tasks {
            outstanding.insert(
                (task.job_id.clone(), task.task_id),
                Outstanding {
                    task: task.clone(),
                    handed_out: None,
                },
            );
        }
        drop(outstanding);
        self.queue.lock().await.extend(tasks.iter().cloned());
        self.available.notify_waiters();
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), BrokerError> {
        self.outstanding.lock().await.retain(|(job, _), _| job != job_id);
        Ok(())
    }
}

/// Small deterministic generator so every run exercises the same losses.
struct XorShift(u64);

impl XorShift {
    fn next_percent(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0 % 100
    }
}

/// A worker that loses about 20% of its results and sends late duplicates of about 10%.
async fn run_worker(
    seed: u64,
    broker: Arc<RedeliveringBroker>,
    wire: mpsc::UnboundedSender<RegionalWorkResult>,
    cancel: CancellationToken,
) {
    let mut rng = XorShift(seed);
    while let Some(task) = broker.next_task(&cancel).await {
        tokio::time::sleep(Duration::from_millis(rng.next_percent() % 3)).await;
        let result = RegionalWorkResult::single(
            task.job_id.clone(),
            task.task_id,
            expected_value(&task.job_id, task.task_id),
        );
        if rng.next_percent() < 20 {
            continue;
        }
        if rng.next_percent() < 10 {
            let late = wire.clone();
            let duplicate = result.clone();
            let delay = Duration::from_millis(50 + rng.next_percent());
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = late.send(duplicate);
            });
        }
        let _ = wire.send(result);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lossy_workers_two_jobs_finish_exactly_once() {
    let broker = Arc::new(RedeliveringBroker::default());
    let ctx = TestContext::start(broker.clone(), 3).await;
    let cancel = CancellationToken::new();

    // Results pass the broker on their way to the queue, the way a worker
    // reports completion before its result is forwarded
    let (wire_tx, mut wire_rx) = mpsc::unbounded_channel::<RegionalWorkResult>();
    let tap = {
        let broker = broker.clone();
        let sender = ctx.sender.clone();
        tokio::spawn(async move {
            while let Some(result) = wire_rx.recv().await {
                broker.result_seen(&result.job_id, result.task_id).await;
                if sender.send(WorkerMessage::Result(result)).await.is_err() {
                    break;
                }
            }
        })
    };

    let redelivery = {
        let broker = broker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => broker.redeliver_overdue().await,
                }
            }
        })
    };

    let workers: Vec<_> = (1..=4u64)
        .map(|n| {
            tokio::spawn(run_worker(
                0x9E37_79B9_7F4A_7C15 ^ n,
                broker.clone(),
                wire_tx.clone(),
                cancel.clone(),
            ))
        })
        .collect();

    let jobs = [("job-north", 6, 5), ("job-south", 9, 4)];
    let tickets: Vec<_> = jobs
        .iter()
        .map(|&(id, w, h)| ctx.runtime.dispatcher().enqueue(analysis(id, w, h)).unwrap())
        .collect();
    for ticket in tickets {
        ticket.outcome().await.unwrap();
    }

    for &(id, _, _) in &jobs {
        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                let status = ctx.runtime.dispatcher().get_status(id).unwrap();
                assert!(status.complete <= status.total);
                assert_ne!(status.state, JobState::Errored);
                if status.state == JobState::Finished {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{id} did not finish"));
    }

    // Let stray duplicates land before checking nothing was written twice
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.results.put_count(), 2);
    assert!(broker.redelivered.load(Ordering::SeqCst) > 0, "no task was ever lost");
    assert_eq!(broker.outstanding().await, 0);

    for &(id, w, h) in &jobs {
        let status = ctx.runtime.dispatcher().get_status(id).unwrap();
        let total = (w * h) as u64;
        assert_eq!((status.total, status.complete), (total, total));

        let (header, values) = ctx.artifact(id).await;
        assert_eq!((header.width, header.height), (w, h));
        let expected: Vec<i32> = (0..total).map(|t| expected_value(id, t)).collect();
        assert_eq!(values, expected);
    }
    assert_eq!(ctx.scratch_files(), 0);

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
    redelivery.await.unwrap();
    drop(wire_tx);
    ctx.shutdown().await;
    tap.await.unwrap();
}
