//! At-least-once telemetry relay over a publish/subscribe broker.
//!
//! [`TelemetryPublisher`] hands records to a topic and waits for the broker's
//! acknowledgement. [`TelemetryConsumer`] opens a subscription on demand,
//! polls within a wall-clock budget and returns as soon as one message has
//! arrived, the budget is spent, the caller cancels or the transport fails.
//! The two share nothing but the topic name.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod publisher;
pub mod validate;

pub use broker::{Broker, InMemoryBroker, MqttBroker, Subscription};
pub use config::{BrokerArgs, OffsetReset};
pub use consumer::{ConsumeFailure, ConsumeOutcome, TelemetryConsumer};
pub use errors::{ConsumeTransportError, Error, PublishError};
pub use model::{Ack, ConsumptionResult, DeviceStatus, TelemetryRecord};
pub use publisher::TelemetryPublisher;
