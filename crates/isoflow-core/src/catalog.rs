// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catalog of recently seen workers.
//!
//! Every contact from a worker files it under its current category (network +
//! executable version) and under its network alone. The broker asks the
//! catalog whether any live worker can serve a category before routing a
//! batch. Sightings older than the staleness window are purged.
//!
//! All three indices live behind one lock and are updated together, so a
//! worker is never visible in one index and missing from another.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use isoflow_protocol::{WorkerCategory, WorkerStatus};
use tracing::{debug, info};

/// Default staleness window.
pub const WORKER_RECORD_DURATION: Duration = Duration::from_secs(2 * 60);

/// The latest sighting of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerObservation {
    /// Worker identifier.
    pub worker_id: String,
    /// Category the worker reported at this sighting.
    pub category: WorkerCategory,
    /// When the sighting happened.
    pub last_seen: Instant,
}

#[derive(Debug, Default)]
struct Indices {
    by_worker: HashMap<String, WorkerObservation>,
    by_category: HashMap<WorkerCategory, HashSet<String>>,
    by_graph: HashMap<String, HashSet<String>>,
}

impl Indices {
    fn unfile(&mut self, observation: &WorkerObservation) {
        remove_member(&mut self.by_category, &observation.category, &observation.worker_id);
        remove_member(
            &mut self.by_graph,
            &observation.category.graph_id,
            &observation.worker_id,
        );
    }
}

fn remove_member<K>(index: &mut HashMap<K, HashSet<String>>, key: &K, worker_id: &str)
where
    K: std::hash::Hash + Eq,
{
    if let Some(members) = index.get_mut(key) {
        members.remove(worker_id);
        if members.is_empty() {
            index.remove(key);
        }
    }
}

/// Thread-safe worker catalog.
#[derive(Debug)]
pub struct WorkerCatalog {
    indices: Mutex<Indices>,
    stale_after: Duration,
    offline: bool,
}

impl Default for WorkerCatalog {
    fn default() -> Self {
        Self::new(WORKER_RECORD_DURATION, false)
    }
}

impl WorkerCatalog {
    /// Create an empty catalog.
    ///
    /// In `offline` (single-machine) mode, [`can_serve`](Self::can_serve)
    /// matches on network identity alone and ignores worker versions.
    pub fn new(stale_after: Duration, offline: bool) -> Self {
        Self {
            indices: Mutex::new(Indices::default()),
            stale_after,
            offline,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Indices> {
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a sighting of a worker now.
    pub fn catalog(&self, status: &WorkerStatus) {
        self.catalog_at(status, Instant::now());
    }

    /// Record a sighting of a worker at `now`.
    ///
    /// The new observation supersedes the old one. A worker that switched
    /// category is removed from its old category and network entries.
    pub fn catalog_at(&self, status: &WorkerStatus, now: Instant) {
        let observation = WorkerObservation {
            worker_id: status.worker_id.clone(),
            category: status.category(),
            last_seen: now,
        };

        let mut indices = self.lock();
        if let Some(old) = indices
            .by_worker
            .insert(observation.worker_id.clone(), observation.clone())
        {
            if old.category != observation.category {
                debug!(
                    worker_id = %old.worker_id,
                    from = %old.category,
                    to = %observation.category,
                    "Worker switched category"
                );
                indices.unfile(&old);
            }
        } else {
            debug!(
                worker_id = %observation.worker_id,
                category = %observation.category,
                "New worker"
            );
        }
        indices
            .by_category
            .entry(observation.category.clone())
            .or_default()
            .insert(observation.worker_id.clone());
        indices
            .by_graph
            .entry(observation.category.graph_id.clone())
            .or_default()
            .insert(observation.worker_id);
    }

    /// Evict workers not seen within the staleness window. Returns how many were removed.
    pub fn purge_dead_workers(&self) -> usize {
        self.purge_dead_workers_at(Instant::now())
    }

    /// Evict workers whose last sighting is older than `now - stale_after`.
    pub fn purge_dead_workers_at(&self, now: Instant) -> usize {
        let mut indices = self.lock();
        let stale: Vec<WorkerObservation> = indices
            .by_worker
            .values()
            .filter(|o| now.saturating_duration_since(o.last_seen) > self.stale_after)
            .cloned()
            .collect();

        for observation in &stale {
            indices.by_worker.remove(&observation.worker_id);
            indices.unfile(observation);
        }

        if !stale.is_empty() {
            info!(
                purged = stale.len(),
                remaining = indices.by_worker.len(),
                "Purged dead workers"
            );
        }
        stale.len()
    }

    /// Number of workers currently tracked.
    pub fn size(&self) -> usize {
        self.lock()
            .by_category
            .values()
            .map(HashSet::len)
            .sum()
    }

    /// Latest observation of a worker.
    pub fn observation(&self, worker_id: &str) -> Option<WorkerObservation> {
        self.lock().by_worker.get(worker_id).cloned()
    }

    /// Workers filed under a category, sorted.
    pub fn workers_in_category(&self, category: &WorkerCategory) -> Vec<String> {
        sorted(self.lock().by_category.get(category))
    }

    /// Workers that have a network loaded, regardless of version, sorted.
    pub fn workers_on_graph(&self, graph_id: &str) -> Vec<String> {
        sorted(self.lock().by_graph.get(graph_id))
    }

    /// Whether some live worker can take tasks of this category.
    pub fn can_serve(&self, category: &WorkerCategory) -> bool {
        let indices = self.lock();
        if self.offline {
            indices.by_graph.contains_key(&category.graph_id)
        } else {
            indices.by_category.contains_key(category)
        }
    }

    /// Number of workers per category.
    pub fn category_counts(&self) -> HashMap<WorkerCategory, usize> {
        self.lock()
            .by_category
            .iter()
            .map(|(category, members)| (category.clone(), members.len()))
            .collect()
    }
}

fn sorted(members: Option<&HashSet<String>>) -> Vec<String> {
    let mut out: Vec<String> = members.into_iter().flatten().cloned().collect();
    out.sort();
    out
}
