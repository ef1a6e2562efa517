use crate::error::GateError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl GateError {
    /// Stable machine-readable code for the HTTP body.
    pub fn code(&self) -> &'static str {
        match self {
            GateError::ValidationError(_) => "validation_error",
            GateError::AuthenticityError(_) => "authenticity_error",
            GateError::ConflictError(_) => "conflict",
            GateError::StateError(_) => "state_error",
            GateError::TransientStorageError(_) => "transient_storage_error",
            GateError::NoCreditsRemaining(_) => "no_credits_remaining",
            GateError::NotFound(_) => "not_found",
            GateError::DeferredError(_) => "deferred",
            GateError::InFlight(_) => "in_flight",
            GateError::UpstreamError(_) => "upstream_error",
            GateError::ConfigError(_) | GateError::InvalidConfig(_) => "config_error",
            GateError::CsvError(_) => "csv_error",
            GateError::IoError(_) => "io_error",
            GateError::SerializationError(_) => "serialization_error",
            #[cfg(feature = "storage-rocksdb")]
            GateError::RocksDbError(_) => "storage_error",
            GateError::InternalError(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GateError::ValidationError(_) | GateError::AuthenticityError(_) => {
                StatusCode::BAD_REQUEST
            }
            // A replayed request already succeeded.
            GateError::ConflictError(_) => StatusCode::OK,
            GateError::StateError(_) | GateError::InFlight(_) => StatusCode::CONFLICT,
            GateError::NoCreditsRemaining(_) => StatusCode::PAYMENT_REQUIRED,
            GateError::NotFound(_) => StatusCode::NOT_FOUND,
            GateError::DeferredError(_) => StatusCode::SERVICE_UNAVAILABLE,
            GateError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "request failed");
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
