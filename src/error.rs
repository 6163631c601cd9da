use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connectivity: {0}")]
    Connectivity(String),

    #[error("location permission denied")]
    PermissionDenied,

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("config: {0}")]
    Config(String),
}
