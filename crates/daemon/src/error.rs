use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleet_common::{ControlPlaneError, ErrorBody, ErrorKind};
use tracing::error;

/// Error returned by every handler; rendered as an [`ErrorBody`].
#[derive(Debug)]
pub enum ApiError {
    ControlPlane(ControlPlaneError),
    Storage(rusqlite::Error),
}

impl From<ControlPlaneError> for ApiError {
    fn from(err: ControlPlaneError) -> Self {
        ApiError::ControlPlane(err)
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::Storage(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::InvalidConfig => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::TimedOut => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::UnexpectedState => StatusCode::PRECONDITION_FAILED,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self {
            ApiError::ControlPlane(err) => err.to_body(),
            ApiError::Storage(err) => {
                error!(error = %err, "database write failed");
                ErrorBody {
                    kind: ErrorKind::Internal,
                    message: "failed to persist control plane state".to_string(),
                }
            }
        };
        (status_for(body.kind), Json(body)).into_response()
    }
}
