// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Isoflow Core - regional analysis orchestrator
//!
//! Splits a regional accessibility analysis into one task per origin cell,
//! publishes the tasks to a broker, and reassembles the results workers send
//! back into a single access-grid file.
//!
//! # Architecture
//!
//! ```text
//!   enqueue ──► JobDispatcher ──[task batch]──► Broker ──► workers
//!                  │  (pool, 1..=20)                         │
//!                  │ register                                │ WorkerMessage
//!                  ▼                                         ▼
//!              JobRegistry ◄──────── ResultConsumer ◄── ResultSource
//!                  │                      │
//!                  │ handle_result        └──► WorkerCatalog (heartbeats)
//!                  ▼
//!          AccessGridAssembler ──[gzip]──► ArtifactStore ({job}.access)
//! ```
//!
//! Results may arrive in any order, more than once, or after their job was
//! deleted. Completion depends only on the set of distinct task positions
//! received, and a job's artifact is persisted exactly once.
//!
//! # Background workers
//!
//! | Worker | Default interval | Job |
//! |--------|------------------|-----|
//! | [`CatalogMonitor`](catalog_monitor::CatalogMonitor) | 30 s | purge workers silent for 2 minutes |
//! | [`JobReaper`](reaper::JobReaper) | 60 s | release errored jobs, evict terminal jobs after retention |
//! | [`ResultConsumer`](consumer::ResultConsumer) | continuous | route worker messages |
//!
//! All of them are owned by [`AnalysisRuntime`](runtime::AnalysisRuntime).

#![deny(missing_docs)]

pub mod assembler;
pub mod broker;
pub mod catalog;
pub mod catalog_monitor;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod store;

pub use assembler::{AccessGridAssembler, AssemblyError, Delivery, ResultAssembler};
pub use broker::{Broker, BrokerError, HttpBroker, MockBroker};
pub use catalog::WorkerCatalog;
pub use config::Config;
pub use consumer::{ChannelResultSource, ResultConsumer, ResultSource, SpoolResultSource};
pub use dispatcher::{DispatchConfig, DispatchTicket, JobDispatcher};
pub use error::{Error, Result};
pub use registry::JobRegistry;
pub use retry::RetryPolicy;
pub use runtime::AnalysisRuntime;
pub use store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore, StoreError};
