//! Core error → HTTP response mapping.
//!
//! Every failure leaves the server as `{kind, message}` with a status code
//! derived from the stable kind, so the UI can map kinds to notifications
//! without parsing messages.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cb_core::CoreError;
use cb_protocol::{ErrorBody, ErrorKind};

/// Wire-facing error wrapper.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        let body = ErrorBody {
            kind,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError | ErrorKind::BadGlob | ErrorKind::MissingParameter => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::FrozenJob
        | ErrorKind::PipelineActive
        | ErrorKind::NotRunning
        | ErrorKind::DuplicateImport
        | ErrorKind::Exists => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::NoProject | ErrorKind::SnapshotInvalid => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Io | ErrorKind::Subprocess | ErrorKind::Config | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Type alias for handler results.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::ValidationError), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::FrozenJob), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Subprocess), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
