// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Broker address used in offline (single-machine) mode.
pub const OFFLINE_BROKER_URL: &str = "http://localhost:6001";

/// Upper bound on concurrent dispatches.
pub const MAX_DISPATCH_CONCURRENCY: usize = 20;

/// Isoflow orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker base URL
    pub broker_url: String,
    /// Single-machine mode: local broker, scenarios are not uploaded,
    /// workers are matched by network only
    pub offline: bool,
    /// Artifact store URL for finished access grids
    pub results_store: String,
    /// Artifact store URL for detached scenarios
    pub bundle_store: String,
    /// Local scenario cache directory
    pub local_cache: PathBuf,
    /// Directory for assembler scratch files
    pub scratch_dir: PathBuf,
    /// Spool directory workers drop results into
    pub results_spool: PathBuf,
    /// Maximum concurrent dispatches (1..=20)
    pub dispatch_concurrency: usize,
    /// Pending dispatch queue capacity
    pub dispatch_queue: usize,
    /// Number of result consumer tasks
    pub consumers: usize,
    /// Workers not seen for this long are purged from the catalog
    pub worker_stale_after: Duration,
    /// Terminal jobs stay queryable for this long
    pub job_retention: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required unless `ISOFLOW_OFFLINE` is set:
    /// - `ISOFLOW_BROKER_URL`: broker base URL (offline default: `http://localhost:6001`)
    ///
    /// Optional (with defaults):
    /// - `ISOFLOW_OFFLINE`: single-machine mode (default: false)
    /// - `ISOFLOW_RESULTS_STORE`: `file://` or `s3://` URL (default: `file://.data/results`)
    /// - `ISOFLOW_BUNDLE_STORE`: `file://` or `s3://` URL (default: `file://.data/bundles`)
    /// - `ISOFLOW_LOCAL_CACHE`: scenario cache dir (default: `.data/cache`)
    /// - `ISOFLOW_SCRATCH_DIR`: scratch dir (default: system temp dir)
    /// - `ISOFLOW_RESULTS_SPOOL`: result spool dir (default: `.data/results-spool`)
    /// - `ISOFLOW_DISPATCH_CONCURRENCY`: 1..=20 (default: 20)
    /// - `ISOFLOW_DISPATCH_QUEUE`: pending dispatches (default: 512)
    /// - `ISOFLOW_CONSUMERS`: consumer tasks (default: 2)
    /// - `ISOFLOW_WORKER_STALE_SECS`: worker staleness window (default: 120)
    /// - `ISOFLOW_JOB_RETENTION_SECS`: terminal job retention (default: 86400)
    pub fn from_env() -> Result<Self, ConfigError> {
        let offline = parse_env_bool("ISOFLOW_OFFLINE")?.unwrap_or(false);

        let broker_url = match std::env::var("ISOFLOW_BROKER_URL") {
            Ok(url) => url,
            Err(_) if offline => OFFLINE_BROKER_URL.to_string(),
            Err(_) => return Err(ConfigError::Missing("ISOFLOW_BROKER_URL")),
        };

        let results_store = std::env::var("ISOFLOW_RESULTS_STORE")
            .unwrap_or_else(|_| "file://.data/results".to_string());
        let bundle_store = std::env::var("ISOFLOW_BUNDLE_STORE")
            .unwrap_or_else(|_| "file://.data/bundles".to_string());

        let local_cache = PathBuf::from(
            std::env::var("ISOFLOW_LOCAL_CACHE").unwrap_or_else(|_| ".data/cache".to_string()),
        );
        let scratch_dir = std::env::var("ISOFLOW_SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let results_spool = PathBuf::from(
            std::env::var("ISOFLOW_RESULTS_SPOOL")
                .unwrap_or_else(|_| ".data/results-spool".to_string()),
        );

        let dispatch_concurrency: usize = parse_env(
            "ISOFLOW_DISPATCH_CONCURRENCY",
            MAX_DISPATCH_CONCURRENCY,
            "must be an integer between 1 and 20",
        )?;
        if !(1..=MAX_DISPATCH_CONCURRENCY).contains(&dispatch_concurrency) {
            return Err(ConfigError::Invalid(
                "ISOFLOW_DISPATCH_CONCURRENCY",
                "must be an integer between 1 and 20",
            ));
        }

        let dispatch_queue: usize = parse_env(
            "ISOFLOW_DISPATCH_QUEUE",
            512,
            "must be a positive integer",
        )?;
        if dispatch_queue == 0 {
            return Err(ConfigError::Invalid(
                "ISOFLOW_DISPATCH_QUEUE",
                "must be a positive integer",
            ));
        }

        let consumers: usize = parse_env("ISOFLOW_CONSUMERS", 2, "must be a positive integer")?;
        if consumers == 0 {
            return Err(ConfigError::Invalid(
                "ISOFLOW_CONSUMERS",
                "must be a positive integer",
            ));
        }

        let worker_stale_secs: u64 = parse_env(
            "ISOFLOW_WORKER_STALE_SECS",
            120,
            "must be a number of seconds",
        )?;
        let job_retention_secs: u64 = parse_env(
            "ISOFLOW_JOB_RETENTION_SECS",
            24 * 3600,
            "must be a number of seconds",
        )?;

        Ok(Self {
            broker_url,
            offline,
            results_store,
            bundle_store,
            local_cache,
            scratch_dir,
            results_spool,
            dispatch_concurrency,
            dispatch_queue,
            consumers,
            worker_stale_after: Duration::from_secs(worker_stale_secs),
            job_retention: Duration::from_secs(job_retention_secs),
        })
    }
}

fn parse_env<T: std::str::FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

fn parse_env_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(key) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid(key, "expected true/false/1/0")),
        },
        Err(_) => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
