use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use dispatch_service::{
    api::{AppState, run_api_server},
    clients::{
        circuit_breaker::BreakerRegistry, health::HealthChecker, rbmq::RabbitMqClient,
        redis::RedisStore, store::SharedStore, template::TemplateServiceClient,
    },
    config::Config,
    services::{
        gateway::QueueGateway, monitor::HealthMonitor, orchestrator::NotificationService,
        selector::Selector, worker::Worker,
    },
    vendors::registry::VendorRegistry,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::load()?;

    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let breakers = BreakerRegistry::new(Arc::clone(&store), config.breaker_config());

    let backend = RabbitMqClient::connect(
        &config.rabbitmq_url,
        &config.queue_name,
        &config.failed_queue_name,
        config.prefetch_count,
    )
    .await?;
    let gateway = Arc::new(QueueGateway::new(
        Arc::new(backend),
        breakers.clone(),
        &config.queue_name,
        config.gateway_config(),
    ));

    let registry = Arc::new(VendorRegistry::from_env(
        config.vendor_priorities()?,
        config.vendor_timeout(),
    )?);
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        config.monitor_config(),
    ));
    let selector = Arc::new(Selector::new(
        Arc::clone(&registry),
        breakers.clone(),
        Arc::clone(&monitor),
        Arc::clone(&store),
        config.health_cache_ttl_seconds,
    ));

    let templates = Arc::new(TemplateServiceClient::new(
        &config.template_service_url,
        &config.template_language,
        Duration::from_millis(config.template_timeout_ms),
        config.retry_config(),
        breakers.clone(),
    )?);

    let service = Arc::new(NotificationService::new(
        Arc::clone(&store),
        Arc::clone(&gateway),
        selector,
        templates,
        config.orchestrator_config(),
    ));

    // Stopped in order: API, then workers and monitor, then the flusher, so
    // nothing is buffered after the final flush.
    let (api_shutdown_tx, api_shutdown_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (flusher_shutdown_tx, flusher_shutdown_rx) = watch::channel(false);

    let flusher = tokio::spawn(Arc::clone(&gateway).run_flusher(flusher_shutdown_rx));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(Arc::clone(&monitor).run(
        Duration::from_secs(config.health_check_interval_seconds),
        shutdown_rx.clone(),
    )));

    let worker = Arc::new(Worker::new(
        Arc::clone(&gateway),
        Arc::clone(&service),
        config.worker_config(),
    ));
    tasks.extend(worker.spawn_all(shutdown_rx));

    let state = Arc::new(AppState {
        service,
        health_checker: HealthChecker::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            breakers,
            registry,
            monitor,
        ),
    });

    let port = config.server_port;
    let server = tokio::spawn(async move {
        if let Err(e) = run_api_server(state, port, api_shutdown_rx).await {
            error!(error = %e, "API server exited with error");
        }
    });

    info!(
        workers = config.worker_concurrency,
        queue = %config.queue_name,
        "Dispatch service started"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow!("Failed to listen for shutdown signal: {}", e))?;

    info!("Shutdown signal received, draining");

    let _ = api_shutdown_tx.send(true);
    if let Err(e) = server.await {
        error!(error = %e, "API server task panicked");
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }

    let _ = flusher_shutdown_tx.send(true);
    if let Err(e) = flusher.await {
        error!(error = %e, "Batch flusher panicked");
    }

    info!("Dispatch service stopped");

    Ok(())
}
