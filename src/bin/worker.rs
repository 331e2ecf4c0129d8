use axum::{routing::get, Router};
use inbox_triage::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgResultStore},
    models::classification::ClassificationMethod,
    services::{
        cache::RedisResultCache,
        circuit_breaker::BreakerRegistry,
        metrics_reporter::MetricsReporter,
        orchestrator::{Orchestrator, ProviderRoute},
        provider::LlmProviderClient,
        publisher::RedisPublisher,
        queue::RedisJobQueue,
        worker::{WorkerPool, WorkerPoolConfig},
    },
    shutdown,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::PgPool;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting inbox triage worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    let shutdown = shutdown::install_signal_handler();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    let outcome = run(&config, db_pool.clone(), Arc::new(prometheus_handle), shutdown).await;

    // Released on every exit path, including failed startup.
    db_pool.close().await;

    if let Err(e) = outcome {
        tracing::error!(error = %e, "Worker exited with error");
        std::process::exit(1);
    }
    tracing::info!("Worker shut down cleanly");
}

fn describe_metrics() {
    metrics::describe_counter!("triage_jobs_processed_total", "Jobs classified and acknowledged");
    metrics::describe_counter!("triage_jobs_failed_total", "Jobs parked as failed by the queue");
    metrics::describe_counter!("triage_jobs_retried_total", "Jobs requeued after every provider failed");
    metrics::describe_histogram!("triage_classify_seconds", "Time to classify one delivery");
    metrics::describe_gauge!("triage_queue_depth", "Pending jobs in the queue");
    metrics::describe_gauge!("triage_queue_up", "1 when the job queue answered the last depth query");
    metrics::describe_gauge!(
        "triage_breaker_state",
        "Circuit breaker state per provider (0 closed, 1 open, 2 half-open)"
    );
    metrics::describe_counter!("triage_cache_errors_total", "Result cache reads or writes that failed");
    metrics::describe_counter!(
        "triage_persistence_errors_total",
        "Classification results that could not be written back"
    );
    metrics::describe_counter!("triage_publish_errors_total", "Completion events that could not be published");
    metrics::describe_counter!("triage_results_total", "Classification results produced, by method");
}

async fn run(
    config: &AppConfig,
    db_pool: PgPool,
    prometheus_handle: Arc<PrometheusHandle>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool).await?;

    tracing::info!(prefix = %config.queue_prefix, "Connecting to Redis job queue");
    let queue = Arc::new(
        RedisJobQueue::connect(&config.redis_url, &config.queue_prefix, config.lease()).await?,
    );

    tracing::info!("Connecting to result cache");
    let cache = Arc::new(RedisResultCache::connect(config.cache_url(), config.cache_ttl()).await?);

    let publisher = Arc::new(RedisPublisher::connect(&config.redis_url, &config.completion_channel).await?);

    let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()));
    let primary = LlmProviderClient::new(config.primary_provider())?;
    let fallback = LlmProviderClient::new(config.fallback_provider())?;
    tracing::info!(
        primary = %primary.config().model,
        fallback = %fallback.config().model,
        "Providers configured"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        cache.clone(),
        ProviderRoute::new(
            Arc::new(primary),
            breakers.get_or_create("primary"),
            ClassificationMethod::Primary,
        ),
        ProviderRoute::new(
            Arc::new(fallback),
            breakers.get_or_create("fallback"),
            ClassificationMethod::Fallback,
        ),
    ));

    let pool = Arc::new(WorkerPool::new(
        WorkerPoolConfig {
            concurrency: config.worker_concurrency,
            idle_delay: config.idle_delay(),
        },
        queue.clone(),
        orchestrator,
        Arc::new(PgResultStore::new(db_pool.clone())),
        publisher,
    ));

    let reporter = MetricsReporter::new(
        queue.clone(),
        pool.stats(),
        breakers.clone(),
        config.metrics_interval(),
    );
    let reporter_task = tokio::spawn(reporter.run(shutdown.clone()));

    let state = AppState::new(db_pool, queue, cache, breakers);
    let app = Router::new()
        .route("/health", get(inbox_triage::routes::health::health_check))
        .with_state(state)
        .route(
            "/metrics",
            get(inbox_triage::routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Ops server listening on {}", config.bind_addr);
    let server_task = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
    );

    tracing::info!(concurrency = config.worker_concurrency, "Worker ready, starting job processing");
    let pool_result = pool.run(shutdown.clone()).await;

    // Pool stopped on its own (queue failure): take the rest down with it.
    shutdown.cancel();
    if let Err(e) = reporter_task.await {
        tracing::warn!(error = %e, "Metrics reporter task failed");
    }
    match server_task.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "Ops server error"),
        Err(e) => tracing::warn!(error = %e, "Ops server task failed"),
        Ok(Ok(())) => {}
    }

    pool_result?;
    Ok(())
}
