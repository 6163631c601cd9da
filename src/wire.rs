use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::delivery::DeliveryStatus;
use crate::models::point::TrackingPoint;

/// One JSON text frame on the multiplexed socket. The `type` tag selects the
/// frame, `channel` scopes publishes and subscription control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Ping,
    Pong,
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    Publish {
        channel: String,
        #[serde(flatten)]
        event: EventPayload,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Tracking(TrackingPoint),
    Status {
        delivery_id: Uuid,
        status: DeliveryStatus,
    },
}

pub fn encode(frame: &Frame) -> Result<String, SyncError> {
    serde_json::to_string(frame).map_err(|err| SyncError::Protocol(format!("encode: {err}")))
}

pub fn decode(text: &str) -> Result<Frame, SyncError> {
    serde_json::from_str(text).map_err(|err| SyncError::Protocol(format!("malformed frame: {err}")))
}

pub mod topic {
    use uuid::Uuid;

    pub fn location(delivery_id: Uuid) -> String {
        format!("delivery.{delivery_id}.location")
    }

    pub fn status(delivery_id: Uuid) -> String {
        format!("delivery.{delivery_id}.status")
    }
}
