use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::geo;
use crate::models::point::GeoPoint;

#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub position: GeoPoint,
    pub accuracy_m: f64,
    pub speed_mps: f64,
}

/// Platform positioning seam. Permission is requested up front; a denial
/// surfaces as [`SyncError::PermissionDenied`] and nothing starts sampling.
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn request_permission(&self) -> Result<(), SyncError>;
    async fn current_fix(&self) -> Result<Fix, SyncError>;
}

/// Walks a straight line between two points, one step per fix. Stands in for
/// GPS hardware in demos and local runs.
pub struct SimulatedLocationSource {
    state: Mutex<WalkState>,
}

struct WalkState {
    current: GeoPoint,
    target: GeoPoint,
    step_m: f64,
}

impl SimulatedLocationSource {
    pub fn walk(from: GeoPoint, to: GeoPoint, step_m: f64) -> Self {
        Self {
            state: Mutex::new(WalkState {
                current: from,
                target: to,
                step_m,
            }),
        }
    }
}

#[async_trait]
impl LocationSource for SimulatedLocationSource {
    async fn request_permission(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn current_fix(&self) -> Result<Fix, SyncError> {
        let mut state = self.state.lock().await;
        let remaining = geo::haversine_m(&state.current, &state.target);
        if remaining > state.step_m {
            let fraction = state.step_m / remaining;
            state.current = GeoPoint {
                lat: state.current.lat + (state.target.lat - state.current.lat) * fraction,
                lng: state.current.lng + (state.target.lng - state.current.lng) * fraction,
            };
        } else {
            state.current = state.target;
        }

        Ok(Fix {
            position: state.current,
            accuracy_m: 5.0,
            // One step per nominal 15s sampling tick.
            speed_mps: state.step_m / 15.0,
        })
    }
}
