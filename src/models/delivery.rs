use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::geofence::Leg;
use crate::models::point::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Accepted,
    PickedUp,
    InProgress,
    Delivered,
    Cancelled,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Cancelled)
    }

    /// Position of a status along the delivery lifecycle. Cancellation ranks
    /// above everything because nothing may follow it.
    pub fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Accepted => 1,
            DeliveryStatus::PickedUp => 2,
            DeliveryStatus::InProgress => 3,
            DeliveryStatus::Delivered => 4,
            DeliveryStatus::Cancelled => 5,
        }
    }

    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (DeliveryStatus::Pending, DeliveryStatus::Accepted)
                | (DeliveryStatus::Accepted, DeliveryStatus::PickedUp)
                | (DeliveryStatus::PickedUp, DeliveryStatus::InProgress)
                | (DeliveryStatus::InProgress, DeliveryStatus::Delivered)
                | (_, DeliveryStatus::Cancelled)
        )
    }

    /// The leg the courier is travelling while a delivery sits in this status,
    /// if any. Drives which geofence region is armed.
    pub fn active_leg(&self) -> Option<Leg> {
        match self {
            DeliveryStatus::Accepted => Some(Leg::Pickup),
            DeliveryStatus::PickedUp | DeliveryStatus::InProgress => Some(Leg::Dropoff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}
