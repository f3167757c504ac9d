//! Maps [`KgError`] onto an HTTP response (spec §7): status from
//! [`KgError::http_status`], body the wire-safe [`kg_error::ApiError`]
//! envelope. No provider internals, sources, or context ever reach the
//! client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kg_error::KgError;

/// Newtype so this crate can implement [`IntoResponse`] for [`KgError`]
/// without hitting the orphan rule.
pub struct AppError(pub KgError);

impl From<KgError> for AppError {
    fn from(err: KgError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(code = %self.0.code, message = %self.0.message, "internal error");
        }
        (status, Json(self.0.to_api_error())).into_response()
    }
}

pub(crate) type AppResult<T> = Result<T, AppError>;
