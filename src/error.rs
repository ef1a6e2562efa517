use thiserror::Error;

/// Every failure the engine can surface.
///
/// The first group mirrors the business taxonomy (validation, authenticity,
/// conflict, state, transient storage); the rest wrap lower-level errors.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Authenticity error: {0}")]
    AuthenticityError(String),
    #[error("Conflict: {0}")]
    ConflictError(String),
    #[error("State error: {0}")]
    StateError(String),
    #[error("Transient storage error: {0}")]
    TransientStorageError(String),
    #[error("No credits remaining on trial token {0}")]
    NoCreditsRemaining(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Deferred: {0}")]
    DeferredError(String),
    #[error("Event {0} is already being processed")]
    InFlight(String),
    #[error("Payment processor error: {0}")]
    UpstreamError(String),
    #[error("Configuration error: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl GateError {
    /// Errors a retry can plausibly cure.
    pub fn is_transient(&self) -> bool {
        match self {
            GateError::TransientStorageError(_)
            | GateError::DeferredError(_)
            | GateError::InFlight(_)
            | GateError::UpstreamError(_)
            | GateError::IoError(_)
            | GateError::InternalError(_) => true,
            #[cfg(feature = "storage-rocksdb")]
            GateError::RocksDbError(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
