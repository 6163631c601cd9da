pub mod api;
pub mod channel;
pub mod config;
pub mod core;
pub mod error;
pub mod geo;
pub mod models;
pub mod observability;
pub mod queue;
pub mod status;
pub mod store;
pub mod testing;
pub mod tracker;
pub mod wire;
