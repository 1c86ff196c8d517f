//! Batched background migration worker
//!
//! Runs the periodic scheduler tick, the task workers consuming dispatched
//! migration runs, and an HTTP server exposing `/health` and `/metrics`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Router};
use bbm_core::domains::batched_migrations::health_status::indicators::default_indicators;
use bbm_core::domains::batched_migrations::jobs::register_bundled_jobs;
use bbm_core::domains::batched_migrations::metrics::gather_metrics;
use bbm_core::domains::batched_migrations::{JobClassRegistry, PrometheusMetrics, Scheduler, TaskWorker};
use bbm_core::kernel::scheduled_tasks::start_scheduler;
use bbm_core::kernel::{ChannelTaskQueue, EngineDeps, TaskQueue};
use bbm_core::Config;
use prometheus::Registry;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    registry: Registry,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bbm_core=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting batched background migration worker");

    let config = Config::from_env()?;

    // Database setup
    let pool = PgPoolOptions::new()
        .max_connections(config.task_workers as u32 + 3)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    // Engine wiring
    let metrics_registry = Registry::new();
    let metrics = Arc::new(PrometheusMetrics::new(&metrics_registry)?);

    let mut job_classes = JobClassRegistry::new();
    register_bundled_jobs(&mut job_classes);

    let deps = EngineDeps::postgres(
        pool.clone(),
        Arc::new(job_classes),
        metrics,
        default_indicators(pool.clone(), &config.indicators),
        config.settings.clone(),
    );
    let scheduler = Arc::new(Scheduler::new(deps, config.schema_name.clone()));
    tracing::info!(
        worker_id = scheduler.worker_id(),
        schema = %config.schema_name,
        "Engine initialized"
    );

    // Task workers
    let shutdown = CancellationToken::new();
    let (queue, receiver) = ChannelTaskQueue::new(config.task_workers.max(1) * 16);
    let mut workers = Vec::with_capacity(config.task_workers);
    for i in 0..config.task_workers.max(1) {
        let worker = TaskWorker::new(format!("task-worker-{}", i), scheduler.clone(), receiver.clone());
        workers.push(tokio::spawn(worker.run(shutdown.child_token())));
    }

    // Periodic tick
    let queue: Arc<dyn TaskQueue> = Arc::new(queue);
    let mut cron = start_scheduler(&config.tick_cron, scheduler.clone(), Some(queue)).await?;

    // Health and metrics endpoints
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState {
            pool,
            registry: metrics_registry,
        });

    let addr = format!("0.0.0.0:{}", config.metrics_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Metrics server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Metrics server failed")?;

    tracing::info!("Shutting down");
    cron.shutdown().await?;
    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!("Task worker panicked: {}", e);
        }
    }

    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    gather_metrics(&state.registry)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
