mod model;
mod rest;

use axum::{http::StatusCode, routing::get, Router};
use clap::Parser;
use std::sync::Arc;
use telemetry_relay::broker::mqtt::MqttSettings;
use telemetry_relay::{metrics, Broker, BrokerArgs, Error, MqttBroker, TelemetryConsumer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Home management service: lights, heating and telemetry updates.
#[derive(Debug, Parser)]
#[command(name = "home-management", version)]
struct Cli {
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: String,

    #[command(flatten)]
    broker: BrokerArgs,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    cli.broker.validate()?;

    info!("Starting Home Management Service");
    info!("MQTT broker: {}:{}", cli.broker.mqtt_broker, cli.broker.mqtt_port);
    info!(
        "Consuming {} as group {} (poll {:?}, budget {:?}, offset reset {:?})",
        cli.broker.topic,
        cli.broker.group_id,
        cli.broker.poll_timeout(),
        cli.broker.budget(),
        cli.broker.offset_reset
    );
    info!("HTTP server: {}", cli.http_addr);

    metrics::init_metrics()?;

    let client_id = format!("home-management-{}", uuid::Uuid::new_v4());
    let broker = Arc::new(MqttBroker::new(MqttSettings::from_args(&cli.broker, client_id)));
    let consumer = TelemetryConsumer::with_poll_timeout(Arc::clone(&broker), cli.broker.poll_timeout());
    let shutdown = CancellationToken::new();

    let updates = rest::UpdatesSettings {
        topic: cli.broker.topic.clone(),
        group_id: cli.broker.group_id.clone(),
        budget: cli.broker.budget(),
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(consumer, updates, shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(&cli.http_addr).await?;

    info!("HTTP server listening on {}", cli.http_addr);

    let signal = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");
        // In-flight consume calls stop at their next poll boundary
        signal.cancel();
    });

    let served = server.await;

    info!("Shutting down");
    broker.shutdown().await;
    served.map_err(Error::from)
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::gather_metrics().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
