pub mod delivery;
pub mod geofence;
pub mod operation;
pub mod point;
