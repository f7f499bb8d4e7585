use anyhow::{Context, Result};
use prism_messaging::{PrismConsumer, PrismProducer};
use prism_processor::api::{start_api_server, AppState};
use prism_processor::config::Config;
use prism_processor::metadata_store::{MetadataStore, PostgresMetadataStore};
use prism_processor::object_store::{ObjectStore, S3ObjectStore};
use prism_processor::{Ingestor, KafkaNotifier, Orchestrator, PipelineDeps, RasterCodec};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        upload_bucket = %config.s3.upload_bucket,
        archive_bucket = %config.s3.archive_bucket,
        "Starting Prism processor"
    );

    init_metrics(config.service.metrics_port)?;

    let metadata_store = PostgresMetadataStore::new(&config.database)
        .await
        .context("Failed to initialize metadata store")?;

    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let records: Arc<dyn MetadataStore> = Arc::new(metadata_store);
    let objects: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize object store")?,
    );

    let producer = Arc::new(
        PrismProducer::new(config.kafka.clone()).context("Failed to create Kafka producer")?,
    );

    let orchestrator = Arc::new(Orchestrator::new(
        PipelineDeps {
            objects: objects.clone(),
            records: records.clone(),
            codec: Arc::new(RasterCodec::new(config.pipeline.jpeg_quality)),
            notifier: Arc::new(KafkaNotifier::new(producer.clone())),
        },
        &config.pipeline,
        config.s3.archive_bucket.clone(),
    ));
    let ingestor = Arc::new(Ingestor::new(orchestrator, records.clone(), &config.pipeline));

    let consumer = PrismConsumer::new(config.kafka.clone())
        .context("Failed to create Kafka consumer")?
        .with_dlq_producer(producer.clone());
    consumer
        .subscribe_uploads()
        .context("Failed to subscribe to uploads topic")?;
    let consumer_shutdown = consumer.shutdown_handle();

    let handler = ingestor.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run(handler).await {
            error!(error = %e, "Kafka consumer error");
        }
    });

    let cancel = CancellationToken::new();

    let recovery_handle = config.pipeline.recovery_interval().map(|every| {
        tokio::spawn(ingestor.clone().run_recovery(
            every,
            config.pipeline.stalled_after(),
            config.pipeline.recovery_batch_size,
            cancel.clone(),
        ))
    });

    let api_handle = config.api.enabled.then(|| {
        let api_state = AppState {
            records: records.clone(),
            objects: objects.clone(),
            upload_bucket: config.s3.upload_bucket.clone(),
            upload_prefix: config.s3.upload_prefix.clone(),
            upload_url_expiry: config.upload_url_expiry(),
        };
        let api_config = config.api.clone();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config, shutdown).await {
                error!(error = %e, "API server error");
            }
        })
    });

    info!("Processor started successfully");

    shutdown_signal().await;

    info!("Shutting down processor");

    // Stop taking new triggers first, then drain in-flight runs
    let _ = consumer_shutdown.send(());
    cancel.cancel();
    if let Err(e) = consumer_handle.await {
        warn!(error = %e, "Consumer task did not stop cleanly");
    }
    ingestor.shutdown().await;

    for handle in [recovery_handle, api_handle].into_iter().flatten() {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task did not stop cleanly");
        }
    }

    if let Err(e) = producer.flush(Duration::from_secs(10)) {
        warn!(error = %e, "Failed to flush pending notifications");
    }

    info!("Processor stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

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
