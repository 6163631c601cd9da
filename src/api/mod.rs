use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::models::point::{GeoPoint, TrackingPoint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEta {
    pub distance_m: f64,
    pub duration_s: f64,
}

/// Request/response boundary to the dispatch backend. The live socket is the
/// preferred path for tracking and status traffic; this is the fallback the
/// offline queue drains through, plus the lookups that have no push variant.
#[async_trait]
pub trait DeliveryApi: Send + Sync {
    async fn fetch_delivery(&self, delivery_id: Uuid) -> Result<Delivery, SyncError>;

    async fn submit_tracking_point(
        &self,
        delivery_id: Uuid,
        point: &TrackingPoint,
    ) -> Result<(), SyncError>;

    async fn submit_status_update(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), SyncError>;

    async fn submit_ticket(&self, subject: &str, body: &str) -> Result<(), SyncError>;

    async fn fetch_route(&self, from: &GeoPoint, to: &GeoPoint) -> Result<RouteEta, SyncError>;
}
