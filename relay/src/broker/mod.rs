//! Broker client abstraction.
//!
//! A [`Broker`] is created once per process and shared by reference between
//! the publisher and the consumer. Each consume call opens its own
//! [`Subscription`] and releases it before returning.

pub mod memory;
pub mod mqtt;

use crate::errors::{ConsumeTransportError, PublishError};
use crate::model::Ack;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::InMemoryBroker;
pub use mqtt::MqttBroker;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Subscription: Subscription;

    /// Hands a payload to the broker and waits until the broker has
    /// acknowledged it.
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<Ack, PublishError>;

    /// Opens a subscription to `topic` under consumer group `group_id`.
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Self::Subscription, ConsumeTransportError>;

    /// Releases the long-lived connection. Called once at process shutdown.
    async fn shutdown(&self);
}

#[async_trait]
pub trait Subscription: Send + 'static {
    /// Waits at most `timeout` for the next message on the subscribed topic.
    ///
    /// `Ok(None)` means nothing arrived in time.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<String>, ConsumeTransportError>;

    /// Releases the subscription. Dropping an unclosed subscription
    /// releases it as well, without the graceful disconnect.
    async fn close(self);
}

pub(crate) fn decode_payload(payload: &[u8]) -> Result<String, ConsumeTransportError> {
    std::str::from_utf8(payload)
        .map(str::to_owned)
        .map_err(|e| ConsumeTransportError::Decode(e.to_string()))
}
