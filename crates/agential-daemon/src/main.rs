//! agential worker daemon.
//!
//! Boots the provider router, restores lane queues from the job store,
//! runs the worker pool and the reconciler, and shuts everything down on
//! Ctrl-C.

mod stores;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agential_core::{JobKind, Lane};
use agential_inference::{
    OllamaProvider, OpenAiCompatProvider, ProviderRouter, RouterConfig, RouterState,
};
use agential_jobs::{
    HandlerRegistry, IndexHandler, Scheduler, SchedulerConfig, SharedUtilization,
    SummarizeHandler, UtilizationGate, WorkerConfig, WorkerEvent, WorkerPool,
};
use agential_search::{ConsistencyConfig, ConsistencyManager, Reconciler, ReconcilerConfig};

use crate::stores::Stores;

/// Install the global subscriber. The returned guard must live as long as
/// file logging is wanted.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, daily rotation)
///   LOG_ANSI    - "true"/"false" override ANSI colors
///   RUST_LOG    - standard env filter (default: "info,agential_jobs=debug")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,agential_jobs=debug".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("agential-daemon.log");
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));

        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(log_ansi.unwrap_or(false)),
                )
                .init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();

    let stores = Stores::from_env().await.context("failed to open stores")?;
    info!(subsystem = "daemon", backend = stores.backend, "Stores ready");

    // Providers: vLLM is the declared primary, Ollama the secondary and embedder.
    let vllm = Arc::new(OpenAiCompatProvider::from_env().context("vLLM provider")?);
    let ollama = Arc::new(OllamaProvider::from_env().context("Ollama provider")?);
    let router = Arc::new(ProviderRouter::new(
        vllm,
        ollama.clone(),
        RouterConfig::from_env(),
    ));
    let state = router.boot().await;
    if state == RouterState::BothDown {
        warn!(
            subsystem = "daemon",
            "No inference provider reachable at boot, summaries will retry until one recovers"
        );
    }
    let probe = router.spawn_probe_loop();

    let consistency = Arc::new(
        ConsistencyManager::new(
            stores.canonical.clone(),
            stores.lexical.clone(),
            stores.vector.clone(),
            ConsistencyConfig::from_env(),
        )
        .with_embedder(ollama),
    );

    let registry = HandlerRegistry::new()
        .with_handler(SummarizeHandler::new(router.clone()))
        .with_handler(IndexHandler::ingest(consistency.clone()))
        .with_handler(IndexHandler::embed(consistency.clone()))
        .with_handler(IndexHandler::reindex(consistency));
    for kind in JobKind::ALL {
        if registry.get(kind).is_none() {
            warn!(
                subsystem = "daemon",
                job_kind = %kind,
                "No processing stage configured, jobs of this kind are dead-lettered at submit"
            );
        }
    }

    // Utilization is pushed by an external sampler; until then the gate sees an idle accelerator.
    let utilization = Arc::new(SharedUtilization::default());
    let scheduler = Arc::new(
        Scheduler::new(stores.jobs.clone(), SchedulerConfig::from_env())
            .with_gate(Lane::VlmOcr, Arc::new(UtilizationGate::from_env(utilization)))
            .with_kinds(registry.kinds()),
    );
    let restored = scheduler
        .restore()
        .await
        .context("failed to restore lane queues")?;
    info!(subsystem = "daemon", restored, "Scheduler ready");

    let pool = WorkerPool::new(scheduler.clone(), registry, WorkerConfig::from_env());
    let mut worker_events = pool.events();
    let workers = pool.start();

    let reconciler = Arc::new(Reconciler::new(
        stores.canonical.clone(),
        stores.lexical.clone(),
        stores.vector.clone(),
        stores.jobs.clone(),
        ReconcilerConfig::from_env(),
    ));
    let reconcile = reconciler.spawn();

    // Dead-letters need an operator; surface them once more at the top level.
    let monitor = tokio::spawn(async move {
        while let Ok(event) = worker_events.recv().await {
            if let WorkerEvent::JobDeadLettered {
                job_id,
                kind,
                error,
            } = event
            {
                warn!(
                    subsystem = "daemon",
                    job_id = %job_id,
                    job_kind = %kind,
                    error = %error,
                    "Job needs manual redrive"
                );
            }
        }
    });

    info!(subsystem = "daemon", "Daemon running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(subsystem = "daemon", "Shutdown requested");

    if let Err(e) = workers.shutdown().await {
        error!(error = %e, "Worker pool did not stop cleanly");
    }
    if let Err(e) = reconcile.shutdown().await {
        error!(error = %e, "Reconciler did not stop cleanly");
    }
    if let Err(e) = probe.shutdown().await {
        error!(error = %e, "Probe loop did not stop cleanly");
    }
    monitor.abort();

    for stats in scheduler.stats().await {
        info!(
            subsystem = "daemon",
            lane = %stats.lane,
            depth = stats.depth,
            in_flight = stats.in_flight,
            "Lane state at shutdown"
        );
    }
    info!(subsystem = "daemon", "Daemon stopped");
    Ok(())
}
