use crate::errors::PublishError;
use crate::model::TelemetryRecord;

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;

/// Validates a telemetry record before it is published
pub fn validate(record: &TelemetryRecord) -> Result<(), PublishError> {
    if record.device_id().is_empty() {
        return Err(PublishError::Validation(
            "Device ID cannot be empty".to_string(),
        ));
    }

    // NaN fails both comparisons, so check finiteness explicitly
    let temperature = record.temperature();
    if !temperature.is_finite() || !(TEMP_MIN..=TEMP_MAX).contains(&temperature) {
        return Err(PublishError::Validation(format!(
            "Temperature {} out of range [{}, {}]",
            temperature, TEMP_MIN, TEMP_MAX
        )));
    }

    let humidity = record.humidity();
    if !humidity.is_finite() || !(HUMIDITY_MIN..=HUMIDITY_MAX).contains(&humidity) {
        return Err(PublishError::Validation(format!(
            "Humidity {} out of range [{}, {}]",
            humidity, HUMIDITY_MIN, HUMIDITY_MAX
        )));
    }

    Ok(())
}

/// Topic names must be concrete: MQTT wildcards are only valid in filters.
pub fn validate_topic(topic: &str) -> Result<(), PublishError> {
    if topic.is_empty() {
        return Err(PublishError::InvalidTopic(
            "Topic cannot be empty".to_string(),
        ));
    }
    if topic.contains(['+', '#']) {
        return Err(PublishError::InvalidTopic(format!(
            "Topic {} contains a wildcard",
            topic
        )));
    }
    Ok(())
}
