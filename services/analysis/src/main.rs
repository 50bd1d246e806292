use agrovision_analysis::config::{Config, StoreBackend};
use agrovision_analysis::{
    start_api_server, AppState, AwsClients, ClassifierBuilder, DynamoResultStore,
    InMemoryResultStore, IngestionTrigger, NotificationConsumer, RekognitionDetector,
    ResultPoller, ResultStore, UploadAuthorizer,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting AgroVision analysis service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let clients = AwsClients::load(&config.aws, &config.s3).await;

    let store: Arc<dyn ResultStore> = match config.store.backend {
        StoreBackend::Dynamodb => Arc::new(DynamoResultStore::new(
            clients.dynamodb.clone(),
            &config.dynamodb,
        )),
        StoreBackend::Memory => {
            warn!("Using in-memory result store, results are lost on restart");
            Arc::new(InMemoryResultStore::new())
        }
    };

    let detector = Arc::new(RekognitionDetector::new(
        clients.rekognition.clone(),
        &config.rekognition,
    ));
    let classifier = Arc::new(
        ClassifierBuilder::new(detector)
            .healthy_label(&config.classifier.healthy_label)
            .disease_labels(config.classifier.disease_labels.clone())
            .build(),
    );

    let trigger = Arc::new(IngestionTrigger::new(
        classifier,
        store.clone(),
        config.aws.region.clone(),
        config.s3.upload_prefix.clone(),
    ));
    let consumer = NotificationConsumer::new(clients.sqs.clone(), &config.sqs, trigger);

    // Create API state
    let api_state = AppState {
        poller: Arc::new(ResultPoller::new(store, config.poll_budget())),
        uploads: Arc::new(UploadAuthorizer::new(
            clients.s3.clone(),
            &config.aws,
            &config.s3,
        )),
    };

    let shutdown = CancellationToken::new();

    // Spawn notification consumer task
    let consumer_token = shutdown.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run(consumer_token.clone()).await {
            error!(error = %e, "Notification consumer error");
            consumer_token.cancel();
        }
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let api_token = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_token.clone()).await {
            error!(error = %format!("{:#}", e), "API server error");
            api_token.cancel();
        }
    });

    info!("Analysis service started successfully");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => {
            warn!("A service task failed, shutting down");
        }
    }

    info!("Shutting down analysis service");
    shutdown.cancel();

    // Let the in-flight batch and requests finish
    let (consumer_result, api_result) = tokio::join!(consumer_handle, api_handle);
    if let Err(e) = consumer_result {
        error!(error = %e, "Notification consumer task panicked");
    }
    if let Err(e) = api_result {
        error!(error = %e, "API server task panicked");
    }

    info!("Analysis service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
