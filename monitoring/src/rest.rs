use crate::telemetry::{current_reading, history, DateRange, HistoryPoint};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use telemetry_relay::{Ack, Broker, TelemetryPublisher, TelemetryRecord};
use tracing::error;

struct AppState<B> {
    publisher: TelemetryPublisher<B>,
    topic: Arc<str>,
}

impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
            topic: Arc::clone(&self.topic),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    status: &'static str,
    telemetry_data: TelemetryRecord,
    ack: Ack,
}

pub fn create_router<B: Broker>(publisher: TelemetryPublisher<B>, topic: String) -> Router {
    let state = AppState {
        publisher,
        topic: Arc::from(topic),
    };

    Router::new()
        .route("/api/monitoring/:device_id/telemetry", get(get_telemetry))
        .route("/api/monitoring/:device_id/history", post(get_history))
        .route(
            "/api/monitoring/:device_id/publishTelemetry",
            post(publish_telemetry::<B>),
        )
        .with_state(state)
}

async fn get_telemetry(Path(device_id): Path<String>) -> Json<TelemetryRecord> {
    Json(current_reading(device_id))
}

async fn get_history(
    Path(_device_id): Path<String>,
    Json(range): Json<DateRange>,
) -> Result<Json<Vec<HistoryPoint>>, AppError> {
    if range.from > range.to {
        return Err(AppError::bad_request(format!(
            "Range start {} is after range end {}",
            range.from, range.to
        )));
    }
    Ok(Json(history()))
}

async fn publish_telemetry<B: Broker>(
    State(state): State<AppState<B>>,
    Path(device_id): Path<String>,
) -> Result<Json<PublishResponse>, AppError> {
    let record = current_reading(device_id);

    let ack = state
        .publisher
        .publish(&state.topic, &record)
        .await
        .map_err(|e| AppError::from(anyhow::anyhow!("Error publishing message: {}", e.reason())))?;

    Ok(Json(PublishResponse {
        status: "Message published to broker",
        telemetry_data: record,
        ack,
    }))
}

struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: anyhow::anyhow!(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("API error: {}", self.error);
        }
        (self.status, Json(json!({ "error": self.error.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: err.into(),
        }
    }
}
