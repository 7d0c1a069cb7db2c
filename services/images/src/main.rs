use anyhow::{Context, Result};
use eda_pipeline::TopicConsumer;
use image_service::config::{Config, StoreBackend};
use image_service::{
    Dependencies, ImagePipeline, MemoryRecordStore, PgRecordStore, PipelineSettings,
    RecordStore, S3ObjectStore, SmtpMailer,
};
use std::sync::Arc;
use tokio::signal;
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
        "Starting image service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let records = init_record_store(&config).await?;

    let objects = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize object store")?,
    );

    let mailer = Arc::new(SmtpMailer::new(&config.mail).context("Failed to initialize mailer")?);

    let pipeline = ImagePipeline::start(
        Dependencies {
            records,
            objects,
            mailer,
        },
        PipelineSettings::from_config(&config),
    );

    let consumer =
        TopicConsumer::new(config.kafka.clone()).context("Failed to initialize Kafka consumer")?;
    let shutdown = consumer.shutdown_handle();

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down image service");
        let _ = shutdown.send(());
    });

    info!("Image service started successfully");

    if let Err(e) = consumer.run(pipeline.topic()).await {
        error!(error = %e, "Kafka consumer error");
    }

    let report = pipeline
        .shutdown()
        .await
        .context("Failed to drain pipeline")?;
    if report.processing.dropped > 0 || report.dead_letter.dropped > 0 {
        warn!(?report, "Messages were dropped during shutdown");
    }

    info!("Image service stopped");

    Ok(())
}

async fn init_record_store(config: &Config) -> Result<Arc<dyn RecordStore>> {
    match config.database.backend {
        StoreBackend::Postgres => {
            let store = PgRecordStore::new(&config.database)
                .await
                .context("Failed to initialize record store")?;

            // Run migrations if enabled
            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory record store; records are lost on restart");
            Ok(Arc::new(MemoryRecordStore::new()))
        }
    }
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
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
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
            Ok(mut stream) => {
                stream.recv().await;
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
