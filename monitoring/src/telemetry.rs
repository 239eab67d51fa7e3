use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use telemetry_relay::{DeviceStatus, TelemetryRecord};

const CURRENT_TEMPERATURE: f64 = 22.5;
const CURRENT_HUMIDITY: f64 = 45.2;

/// Requested window for historical readings.
#[derive(Debug, Clone, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint {
    pub timestamp: &'static str,
    pub temperature: f64,
    pub humidity: f64,
}

/// Current reading of a device, stamped now.
pub fn current_reading(device_id: String) -> TelemetryRecord {
    TelemetryRecord::new(
        device_id,
        CURRENT_TEMPERATURE,
        CURRENT_HUMIDITY,
        DeviceStatus::Online,
        Utc::now(),
    )
}

/// Fixed sample history, independent of the device and the range.
pub fn history() -> Vec<HistoryPoint> {
    vec![
        HistoryPoint {
            timestamp: "2025-01-01T00:05:00Z",
            temperature: 22.0,
            humidity: 44.0,
        },
        HistoryPoint {
            timestamp: "2025-01-01T00:10:00Z",
            temperature: 22.1,
            humidity: 44.5,
        },
    ]
}
