use crate::model::{
    HeatingRequest, HeatingResponse, LightControlRequest, LightControlResponse, UpdatesResponse,
};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use telemetry_relay::{Broker, TelemetryConsumer};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Where and how `consumeUpdates` reads.
#[derive(Debug, Clone)]
pub struct UpdatesSettings {
    pub topic: String,
    pub group_id: String,
    pub budget: Duration,
}

struct AppState<B> {
    consumer: TelemetryConsumer<B>,
    settings: Arc<UpdatesSettings>,
    shutdown: CancellationToken,
}

impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            consumer: self.consumer.clone(),
            settings: Arc::clone(&self.settings),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// `shutdown` cancels consume calls still in flight when the process stops.
pub fn create_router<B: Broker>(
    consumer: TelemetryConsumer<B>,
    settings: UpdatesSettings,
    shutdown: CancellationToken,
) -> Router {
    let state = AppState {
        consumer,
        settings: Arc::new(settings),
        shutdown,
    };

    Router::new()
        .route("/api/home/lights/:light_id", post(control_lights))
        .route("/api/home/heating/:zone_id", post(set_heating))
        .route("/api/home/consumeUpdates", get(consume_updates::<B>))
        .with_state(state)
}

async fn control_lights(
    Path(light_id): Path<String>,
    Json(request): Json<LightControlRequest>,
) -> Json<LightControlResponse> {
    Json(LightControlResponse {
        light_id,
        status: request.action,
        brightness: request.brightness,
    })
}

async fn set_heating(
    Path(zone_id): Path<String>,
    Json(request): Json<HeatingRequest>,
) -> Json<HeatingResponse> {
    Json(HeatingResponse {
        zone_id,
        status: "heating",
        set_temperature: request.temperature,
    })
}

async fn consume_updates<B: Broker>(State(state): State<AppState<B>>) -> Json<UpdatesResponse> {
    let settings = &state.settings;
    let cancel = state.shutdown.child_token();

    info!("Starting to consume messages from {}", settings.topic);
    let result = state
        .consumer
        .consume(&settings.topic, &settings.group_id, settings.budget, &cancel)
        .await;

    Json(UpdatesResponse::from_messages(result.messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NO_MESSAGES;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use serde_json::json;
    use telemetry_relay::InMemoryBroker;
    use tower::ServiceExt;

    const TOPIC: &str = "telemetry-topic";
    const GROUP: &str = "home-management-group";

    fn app(broker: &Arc<InMemoryBroker>, shutdown: CancellationToken) -> Router {
        let consumer =
            TelemetryConsumer::with_poll_timeout(Arc::clone(broker), Duration::from_millis(20));
        let settings = UpdatesSettings {
            topic: TOPIC.to_string(),
            group_id: GROUP.to_string(),
            budget: Duration::from_millis(100),
        };
        create_router(consumer, settings, shutdown)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn consume_request() -> Request<Body> {
        Request::builder()
            .uri("/api/home/consumeUpdates")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_control_lights_echoes_request() {
        let broker = Arc::new(InMemoryBroker::new());
        let response = app(&broker, CancellationToken::new())
            .oneshot(post_json(
                "/api/home/lights/living-room",
                json!({ "action": "on", "brightness": 75 }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "lightId": "living-room", "status": "on", "brightness": 75 })
        );
    }

    #[tokio::test]
    async fn test_set_heating() {
        let broker = Arc::new(InMemoryBroker::new());
        let response = app(&broker, CancellationToken::new())
            .oneshot(post_json(
                "/api/home/heating/zone-2",
                json!({ "temperature": 21.5 }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "zoneId": "zone-2", "status": "heating", "setTemperature": 21.5 })
        );
    }

    #[tokio::test]
    async fn test_lights_rejects_incomplete_body() {
        let broker = Arc::new(InMemoryBroker::new());
        let response = app(&broker, CancellationToken::new())
            .oneshot(post_json("/api/home/lights/l1", json!({ "action": "on" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_consume_updates_returns_message() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.append_raw(TOPIC, br#"{"deviceId":"d1"}"#.to_vec());

        let response = app(&broker, CancellationToken::new())
            .oneshot(consume_request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "receivedUpdates": [r#"{"deviceId":"d1"}"#] })
        );
    }

    #[tokio::test]
    async fn test_consume_updates_on_empty_topic() {
        let broker = Arc::new(InMemoryBroker::new());

        let response = app(&broker, CancellationToken::new())
            .oneshot(consume_request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "message": NO_MESSAGES }));
        assert_eq!(broker.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_consume_updates_hides_transport_errors() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_unavailable(true);

        let response = app(&broker, CancellationToken::new())
            .oneshot(consume_request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "message": NO_MESSAGES }));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_consume() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.append_raw(TOPIC, b"unread".to_vec());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let response = app(&broker, shutdown).oneshot(consume_request()).await.unwrap();

        assert_eq!(body_json(response).await, json!({ "message": NO_MESSAGES }));
        assert_eq!(broker.committed(TOPIC, GROUP), Some(0));
    }
}
