use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo;
use crate::models::point::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Pickup,
    Dropoff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeofenceRegion {
    pub delivery_id: Uuid,
    pub leg: Leg,
    pub center: GeoPoint,
    pub radius_m: f64,
}

impl GeofenceRegion {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        geo::haversine_m(&self.center, point) <= self.radius_m
    }
}
