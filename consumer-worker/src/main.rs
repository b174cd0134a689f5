//! Consume the configured Kafka topics, logging and committing every record.
use std::future::ready;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get, Router};
use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use common_kafka::{Client, ClientRegistry};
use consumer_worker::config::Config;
use consumer_worker::handler::RecordLogger;
use consumer_worker::metrics::{serve, setup_metrics_routes};

pub async fn index() -> &'static str {
    "kafka consumer worker"
}

fn router(client: Arc<Client>) -> Result<Router> {
    let router = Router::new()
        .route("/", get(index))
        .route(
            "/_readiness",
            get(move || {
                let ready = client.is_consumer_running() && !client.is_closed();
                std::future::ready(if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                })
            }),
        )
        .route("/_liveness", get(|| ready("ok")));

    setup_metrics_routes(router).context("failed to install metrics recorder")
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().context("Invalid configuration")?;
    info!("Configuration loaded: {:?}", config);

    let topics = config.consumer.topics();
    anyhow::ensure!(!topics.is_empty(), "KAFKA_CONSUMER_TOPICS must name at least one topic");

    let options = config
        .consumer
        .to_client_options(&config.kafka)
        .context("Invalid Kafka consumer options")?;

    let registry = ClientRegistry::new(config.shutdown_timeout_ms.0);
    let client = registry
        .get_or_try_insert_with(&config.consumer.kafka_consumer_group, || {
            Client::connect(options)
        })
        .await
        .context("Failed to connect to Kafka")?;

    for topic in &topics {
        client
            .add_subscription(topic, RecordLogger::new(client.acknowledger()))
            .with_context(|| format!("Failed to subscribe to {topic}"))?;
    }
    client.start_consumer()?;
    info!(topics = ?topics, "Started consuming");

    let router = router(client.clone())?;
    let bind = config.bind();
    let server_handle = tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = %e, "Failed to serve metrics");
        }
    });
    info!("Started metrics server on {}", config.bind());

    // Blocks until SIGINT/SIGTERM, then commits and closes every client
    registry.run_until_signal().await?;

    server_handle.abort();
    info!("Kafka consumer worker stopped");

    Ok(())
}
