mod rest;
mod telemetry;

use axum::{http::StatusCode, routing::get, Router};
use clap::Parser;
use std::sync::Arc;
use telemetry_relay::broker::mqtt::MqttSettings;
use telemetry_relay::{metrics, Broker, BrokerArgs, Error, MqttBroker, TelemetryPublisher};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Monitoring service: device telemetry endpoints and the publish path.
#[derive(Debug, Parser)]
#[command(name = "monitoring", version)]
struct Cli {
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8081")]
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

    info!("Starting Monitoring Service");
    info!("MQTT broker: {}:{}", cli.broker.mqtt_broker, cli.broker.mqtt_port);
    info!("Telemetry topic: {}", cli.broker.topic);
    info!("HTTP server: {}", cli.http_addr);

    metrics::init_metrics()?;

    // One broker connection for the lifetime of the process
    let client_id = format!("monitoring-{}", uuid::Uuid::new_v4());
    let broker = Arc::new(MqttBroker::new(MqttSettings::from_args(&cli.broker, client_id)));
    let publisher = TelemetryPublisher::new(Arc::clone(&broker));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(publisher, cli.broker.topic.clone()));

    let listener = tokio::net::TcpListener::bind(&cli.http_addr).await?;

    info!("HTTP server listening on {}", cli.http_addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");
    });

    let served = server.await;

    info!("Shutting down");
    broker.shutdown().await;
    served.map_err(Error::from)
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::gather_metrics().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
