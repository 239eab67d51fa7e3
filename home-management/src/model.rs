use serde::{Deserialize, Serialize};

/// Requested state of a light
#[derive(Debug, Clone, Deserialize)]
pub struct LightControlRequest {
    pub action: String,
    pub brightness: u8,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LightControlResponse {
    pub light_id: String,
    pub status: String,
    pub brightness: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeatingRequest {
    pub temperature: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatingResponse {
    pub zone_id: String,
    pub status: &'static str,
    pub set_temperature: f64,
}

/// Body of `consumeUpdates`: either the received payloads or a notice
/// that nothing arrived.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum UpdatesResponse {
    Received {
        #[serde(rename = "receivedUpdates")]
        received_updates: Vec<String>,
    },
    Empty {
        message: &'static str,
    },
}

pub const NO_MESSAGES: &str = "No messages received within the timeout period.";

impl UpdatesResponse {
    pub fn from_messages(messages: Vec<String>) -> Self {
        if messages.is_empty() {
            UpdatesResponse::Empty {
                message: NO_MESSAGES,
            }
        } else {
            UpdatesResponse::Received {
                received_updates: messages,
            }
        }
    }
}
