use crate::errors::{Error, Result};
use clap::{Args, ValueEnum};
use std::time::Duration;

pub const DEFAULT_TOPIC: &str = "telemetry-topic";
pub const DEFAULT_GROUP_ID: &str = "home-management-group";
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a consumer group with no committed position starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OffsetReset {
    /// Replay retained history.
    #[default]
    Earliest,
    /// Only messages published after the subscription opens.
    Latest,
}

/// Broker and consumer settings shared by both services.
///
/// Every option can also be supplied through the environment.
#[derive(Debug, Clone, Args)]
pub struct BrokerArgs {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    pub mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Topic used by both the publish and the consume path.
    #[arg(long, env = "TELEMETRY_TOPIC", default_value = DEFAULT_TOPIC)]
    pub topic: String,

    #[arg(long, env = "CONSUMER_GROUP", default_value = DEFAULT_GROUP_ID)]
    pub group_id: String,

    /// Per-attempt block duration of a single poll.
    #[arg(long, env = "POLL_TIMEOUT_MS", default_value_t = 5000)]
    pub poll_timeout_ms: u64,

    /// Total wall-clock ceiling of one consume call.
    #[arg(long, env = "CONSUME_BUDGET_MS", default_value_t = 5000)]
    pub budget_ms: u64,

    #[arg(long, env = "ACK_TIMEOUT_MS", default_value_t = 5000)]
    pub ack_timeout_ms: u64,

    #[arg(long, env = "OFFSET_RESET", value_enum, default_value_t = OffsetReset::Earliest)]
    pub offset_reset: OffsetReset,
}

impl BrokerArgs {
    pub fn validate(&self) -> Result<()> {
        if self.mqtt_broker.is_empty() {
            return Err(Error::Config("MQTT broker host cannot be empty".to_string()));
        }
        if self.topic.is_empty() {
            return Err(Error::Config("Topic cannot be empty".to_string()));
        }
        if self.group_id.is_empty() {
            return Err(Error::Config("Consumer group cannot be empty".to_string()));
        }
        for (name, value) in [
            ("poll timeout", self.poll_timeout_ms),
            ("consume budget", self.budget_ms),
            ("ack timeout", self.ack_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}
