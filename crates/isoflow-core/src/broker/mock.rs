// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock broker for testing.
//!
//! Records every published batch and deletion. Optionally forwards published
//! tasks to a channel so tests can play the part of workers, and can be told
//! to fail calls to exercise retry and cleanup paths.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use isoflow_protocol::RegionalTask;
use tokio::sync::{Mutex, mpsc};

use super::{Broker, BrokerError};

/// Mock broker for testing.
#[derive(Clone, Default)]
pub struct MockBroker {
    batches: Arc<Mutex<Vec<Vec<RegionalTask>>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    task_sink: Option<mpsc::UnboundedSender<RegionalTask>>,
    fail_next_enqueues: Arc<AtomicU32>,
    unreachable: Arc<AtomicBool>,
}

impl MockBroker {
    /// Create a mock broker that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock broker that also forwards every published task to the
    /// returned receiver.
    pub fn with_task_sink() -> (Self, mpsc::UnboundedReceiver<RegionalTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = Self {
            task_sink: Some(tx),
            ..Self::default()
        };
        (broker, rx)
    }

    /// Make the next `n` enqueue calls fail transiently.
    pub fn fail_next_enqueues(&self, n: u32) {
        self.fail_next_enqueues.store(n, Ordering::SeqCst);
    }

    /// Make every call fail transiently until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Batches published so far.
    pub async fn batches(&self) -> Vec<Vec<RegionalTask>> {
        self.batches.lock().await.clone()
    }

    /// Job ids the broker was asked to delete.
    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn enqueue_regional(&self, tasks: &[RegionalTask]) -> Result<(), BrokerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Transient("mock broker unreachable".to_string()));
        }
        let failing = self
            .fail_next_enqueues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BrokerError::Transient("injected enqueue failure".to_string()));
        }

        self.batches.lock().await.push(tasks.to_vec());
        if let Some(sink) = &self.task_sink {
            for task in tasks {
                // Receiver gone means the test stopped simulating workers
                let _ = sink.send(task.clone());
            }
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), BrokerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Transient("mock broker unreachable".to_string()));
        }
        self.deleted.lock().await.push(job_id.to_string());
        Ok(())
    }
}
