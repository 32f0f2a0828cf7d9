// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Isoflow Core - regional analysis orchestrator
//!
//! Runs the dispatcher, result consumers, worker catalog monitor and job
//! reaper until interrupted. Any command-line arguments are read as paths to
//! regional analysis JSON files and enqueued at startup.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use isoflow_core::broker::HttpBroker;
use isoflow_core::config::Config;
use isoflow_core::consumer::SpoolResultSource;
use isoflow_core::runtime::AnalysisRuntime;
use isoflow_core::store;
use isoflow_protocol::RegionalAnalysis;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "isoflow_core=info".into());
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        broker_url = %config.broker_url,
        offline = config.offline,
        scratch_dir = %config.scratch_dir.display(),
        results_spool = %config.results_spool.display(),
        "Starting Isoflow Core"
    );

    let results_store = store::from_url(&config.results_store)
        .await
        .with_context(|| format!("opening results store {}", config.results_store))?;
    let bundle_store = store::from_url(&config.bundle_store)
        .await
        .with_context(|| format!("opening bundle store {}", config.bundle_store))?;
    let broker = Arc::new(HttpBroker::new(&config.broker_url)?);
    let source = Arc::new(SpoolResultSource::open(&config.results_spool).await?);

    let runtime = AnalysisRuntime::builder()
        .config(&config)
        .broker(broker)
        .results_store(results_store)
        .bundle_store(bundle_store)
        .result_source(source)
        .build()?
        .start()
        .await?;

    for path in std::env::args().skip(1) {
        let analysis: RegionalAnalysis = match std::fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(anyhow::Error::from))
        {
            Ok(analysis) => analysis,
            Err(e) => {
                error!(path = %path, error = %e, "Could not read regional analysis");
                continue;
            }
        };
        match runtime.dispatcher().enqueue(analysis) {
            Ok(ticket) => info!(path = %path, job_id = %ticket.job_id(), "Submitted regional analysis"),
            Err(e) => error!(path = %path, error = %e, "Regional analysis rejected"),
        }
    }

    info!("Isoflow Core ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Isoflow Core shut down");

    Ok(())
}
