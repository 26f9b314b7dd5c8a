use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use strata_engine::external::{PgScriptCatalog, PgTargetDirectory, RunnerClient};
use strata_engine::orchestrator::OrchestratorParts;
use strata_engine::store::PgStore;
use strata_engine::{EventHandler, LockManager, Orchestrator, ProgressTracker};
use strata_events::{EventBus, EventQueue, PgEventStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod background;
mod config;

use config::WorkerConfig;

/// How long each task gets to wind down after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "strata_worker=debug,strata_engine=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    tracing::info!(
        instance_id = %config.engine.instance_id,
        parallelism = config.engine.parallelism,
        consumers = config.consumers,
        runner_url = %config.runner_url,
        "Loaded worker configuration"
    );

    // --- Database ---
    let pool = strata_db::create_pool_with(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    strata_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    strata_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // --- Engine ---
    let store = Arc::new(PgStore::new(pool.clone()));
    let locks = LockManager::new(store.clone());
    let runner = Arc::new(
        RunnerClient::new(config.runner_url.clone(), config.engine.apply_timeout)
            .context("Failed to create script runner client")?,
    );
    let event_bus = Arc::new(EventBus::default());

    let orchestrator = Orchestrator::new(
        config.engine.clone(),
        OrchestratorParts {
            store,
            locks: locks.clone(),
            directory: Arc::new(PgTargetDirectory::new(pool.clone())),
            catalog: Arc::new(PgScriptCatalog::new(pool.clone())),
            applier: runner,
            progress: Arc::new(ProgressTracker::new()),
            bus: Arc::clone(&event_bus),
        },
    );

    let queue = Arc::new(
        EventQueue::new(Arc::new(PgEventStore::new(pool.clone())), Arc::clone(&event_bus))
            .with_backoff(config.event_backoff)
            .with_default_max_retries(config.max_event_retries),
    );
    let handler = EventHandler::new(orchestrator).with_heartbeat(config.claim_heartbeat);

    // --- Background tasks ---
    let notice_handle = tokio::spawn(background::notice_logger::run(event_bus.subscribe()));

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    for consumer in 0..config.consumers {
        handles.push(tokio::spawn(background::event_consumer::run(
            consumer,
            handler.clone(),
            Arc::clone(&queue),
            config.consumer_poll_interval,
            cancel.clone(),
        )));
    }
    handles.push(tokio::spawn(background::lock_reaper::run(
        locks,
        config.lock_reap_interval,
        cancel.clone(),
    )));
    handles.push(tokio::spawn(background::event_reclaimer::run(
        Arc::clone(&queue),
        config.reclaim_after,
        config.reclaim_interval,
        cancel.clone(),
    )));
    handles.push(tokio::spawn(background::event_retention::run(
        Arc::clone(&queue),
        config.event_retention,
        config.retention_interval,
        cancel.clone(),
    )));
    tracing::info!(tasks = handles.len(), "Worker started");

    shutdown_signal().await;

    // --- Shutdown ---
    cancel.cancel();
    for handle in handles {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            tracing::warn!("Background task did not stop within the grace period");
        }
    }
    tracing::info!("Background tasks stopped");

    // Dropping the last sender closes the bus and ends the notice logger.
    drop(handler);
    drop(queue);
    drop(event_bus);
    let _ = tokio::time::timeout(Duration::from_secs(5), notice_handle).await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
