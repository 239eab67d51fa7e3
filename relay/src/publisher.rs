use crate::broker::Broker;
use crate::errors::PublishError;
use crate::metrics::{PUBLISHED_TOTAL, PUBLISH_FAILURES_TOTAL};
use crate::model::{Ack, TelemetryRecord};
use crate::validate::{validate, validate_topic};
use std::sync::Arc;
use tracing::{error, info};

/// Hands telemetry records to the broker and waits for the broker to
/// acknowledge them.
///
/// There is no retry here: a failed publish is reported to the caller,
/// which decides what to do with it.
pub struct TelemetryPublisher<B> {
    broker: Arc<B>,
}

impl<B> Clone for TelemetryPublisher<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
        }
    }
}

impl<B: Broker> TelemetryPublisher<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self { broker }
    }

    pub async fn publish(&self, topic: &str, record: &TelemetryRecord) -> Result<Ack, PublishError> {
        match self.send(topic, record).await {
            Ok(ack) => {
                PUBLISHED_TOTAL.inc();
                info!(
                    topic,
                    device_id = record.device_id(),
                    status = %record.status(),
                    timestamp = %record.timestamp(),
                    delivery_id = ack.delivery_id,
                    "Telemetry published"
                );
                Ok(ack)
            }
            Err(e) => {
                PUBLISH_FAILURES_TOTAL.inc();
                error!(topic, device_id = record.device_id(), "Error publishing telemetry: {}", e);
                Err(e)
            }
        }
    }

    async fn send(&self, topic: &str, record: &TelemetryRecord) -> Result<Ack, PublishError> {
        validate_topic(topic)?;
        validate(record)?;
        let payload = record.to_payload()?;
        self.broker.send(topic, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::model::DeviceStatus;
    use chrono::Utc;

    fn record(device_id: &str) -> TelemetryRecord {
        TelemetryRecord::new(device_id, 22.5, 45.2, DeviceStatus::Online, Utc::now())
    }

    #[test]
    fn test_publish_appends_payload() {
        tokio_test::block_on(async {
            let broker = Arc::new(InMemoryBroker::new());
            let publisher = TelemetryPublisher::new(Arc::clone(&broker));

            let ack = publisher.publish("telemetry-topic", &record("d1")).await.unwrap();
            assert_eq!(ack.topic, "telemetry-topic");
            assert_eq!(ack.delivery_id, 0);
            assert_eq!(broker.len("telemetry-topic"), 1);
        });
    }

    #[test]
    fn test_empty_topic_rejected_before_send() {
        tokio_test::block_on(async {
            let broker = Arc::new(InMemoryBroker::new());
            let publisher = TelemetryPublisher::new(Arc::clone(&broker));

            let err = publisher.publish("", &record("d1")).await.unwrap_err();
            assert!(matches!(err, PublishError::InvalidTopic(_)));
            assert!(broker.is_empty(""));
        });
    }

    #[test]
    fn test_invalid_record_rejected() {
        tokio_test::block_on(async {
            let broker = Arc::new(InMemoryBroker::new());
            let publisher = TelemetryPublisher::new(Arc::clone(&broker));

            let err = publisher.publish("telemetry-topic", &record("")).await.unwrap_err();
            assert!(matches!(err, PublishError::Validation(_)));
            assert!(broker.is_empty("telemetry-topic"));
        });
    }

    #[test]
    fn test_broker_failure_is_not_retried() {
        tokio_test::block_on(async {
            let broker = Arc::new(InMemoryBroker::new());
            let publisher = TelemetryPublisher::new(Arc::clone(&broker));

            broker.set_unavailable(true);
            let err = publisher.publish("telemetry-topic", &record("d1")).await.unwrap_err();
            assert!(err.reason().contains("broker unavailable"));

            broker.set_unavailable(false);
            assert!(broker.is_empty("telemetry-topic"));
        });
    }
}
