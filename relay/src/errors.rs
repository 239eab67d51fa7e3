use std::time::Duration;
use thiserror::Error;

/// Failure to hand a record to the broker. Never retried by the publisher.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("No acknowledgement from broker within {0:?}")]
    AckTimeout(Duration),
}

impl PublishError {
    /// Human readable reason, suitable for an HTTP error body.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<rumqttc::ClientError> for PublishError {
    fn from(err: rumqttc::ClientError) -> Self {
        PublishError::Broker(err.to_string())
    }
}

/// Broker-level failure while subscribing or polling.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsumeTransportError {
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Payload decode error: {0}")]
    Decode(String),
}

impl From<rumqttc::ConnectionError> for ConsumeTransportError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        ConsumeTransportError::Connection(err.to_string())
    }
}

/// Start-up errors for the services.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_failure_converts_to_io() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "I/O error: address in use");
    }

    #[test]
    fn test_publish_reason_is_display() {
        let err = PublishError::AckTimeout(Duration::from_millis(250));
        assert_eq!(err.reason(), "No acknowledgement from broker within 250ms");
    }
}
