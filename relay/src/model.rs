use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reported state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Online => f.write_str("online"),
            DeviceStatus::Offline => f.write_str("offline"),
        }
    }
}

/// IoT device telemetry record.
///
/// Fields are private so a record cannot be changed after it is built;
/// the serialized form uses the camelCase wire names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    device_id: String,
    temperature: f64,
    humidity: f64,
    status: DeviceStatus,
    timestamp: DateTime<Utc>,
}

impl TelemetryRecord {
    pub fn new(
        device_id: impl Into<String>,
        temperature: f64,
        humidity: f64,
        status: DeviceStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            temperature,
            humidity,
            status,
            timestamp,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn humidity(&self) -> f64 {
        self.humidity
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Transport payload: UTF-8 JSON.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Outcome of one bounded consume call. Messages are raw payloads in
/// arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionResult {
    pub messages: Vec<String>,
    pub timed_out: bool,
    #[serde(default)]
    pub cancelled: bool,
}

impl ConsumptionResult {
    pub fn collected(messages: Vec<String>) -> Self {
        Self {
            messages,
            timed_out: false,
            cancelled: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            messages: Vec::new(),
            timed_out: true,
            cancelled: false,
        }
    }

    pub fn cancelled(messages: Vec<String>) -> Self {
        Self {
            messages,
            timed_out: false,
            cancelled: true,
        }
    }
}

/// Broker acknowledgement for a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub topic: String,
    /// Log offset for the in-memory broker, packet id for MQTT.
    pub delivery_id: u64,
}
