use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::delivery::DeliveryStatus;
use crate::models::point::TrackingPoint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationPayload {
    Tracking {
        delivery_id: Uuid,
        point: TrackingPoint,
    },
    StatusUpdate {
        delivery_id: Uuid,
        status: DeliveryStatus,
    },
    Ticket {
        subject: String,
        body: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: Uuid,
    pub payload: OperationPayload,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub stuck: bool,
}

impl PendingOperation {
    pub fn new(payload: OperationPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            created_at: Utc::now(),
            attempts: 0,
            stuck: false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            OperationPayload::Tracking { .. } => "tracking",
            OperationPayload::StatusUpdate { .. } => "status_update",
            OperationPayload::Ticket { .. } => "ticket",
        }
    }
}
