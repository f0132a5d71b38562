//! Maps [`CoreError`] onto HTTP responses, reusing `status_hint()` rather
//! than re-deriving the mapping at the edge.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use vizql_types::errors::CoreError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Wraps a [`CoreError`] so it can be returned directly from an
/// actix-web handler via `?`.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] CoreError);

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.0.status_hint()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        if matches!(self.0, CoreError::InternalInvariantViolation(_)) {
            tracing::error!(error = %self.0, "internal invariant violated while serving request");
        }
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.0.to_string(),
        })
    }
}
