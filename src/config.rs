use std::env;

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct Config {
    pub ws_url: String,
    pub ws_token: String,
    pub log_level: String,
    pub store_path: String,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub sample_interval_ms: u64,
    pub min_distance_m: f64,
    pub history_capacity: usize,
    pub geofence_radius_m: f64,
    pub max_attempts: u32,
    pub event_buffer_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, SyncError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            ws_url: env::var("WS_URL").unwrap_or_else(|_| "wss://127.0.0.1:9443/ws".to_string()),
            ws_token: env::var("WS_TOKEN").unwrap_or_else(|_| "dev-token".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            store_path: env::var("STORE_PATH").unwrap_or_else(|_| "tracker-store.json".to_string()),
            connect_timeout_ms: parse_or_default("CONNECT_TIMEOUT_MS", 15_000)?,
            reconnect_delay_ms: parse_or_default("RECONNECT_DELAY_MS", 5_000)?,
            reconnect_max_delay_ms: parse_or_default("RECONNECT_MAX_DELAY_MS", 5_000)?,
            sample_interval_ms: parse_or_default("SAMPLE_INTERVAL_MS", 15_000)?,
            min_distance_m: parse_or_default("MIN_DISTANCE_M", 10.0)?,
            history_capacity: parse_or_default("HISTORY_CAPACITY", 120)?,
            geofence_radius_m: parse_or_default("GEOFENCE_RADIUS_M", 75.0)?,
            max_attempts: parse_or_default("MAX_ATTEMPTS", 5)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, SyncError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| SyncError::Config(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
