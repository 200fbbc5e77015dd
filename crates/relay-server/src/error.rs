use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use relay_core::UserIdError;
use relay_sessions::SessionError;

/// Control API failures. Plain-text bodies match what the backend already
/// parses; the cleanup conflict is JSON like the success responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing user_id")]
    MissingUserId,

    #[error("Invalid user_id")]
    InvalidUserId,

    #[error("Client not running")]
    NotRunning,

    #[error("Session cleanup in progress")]
    CleanupPending,

    #[error("Error syncing contacts")]
    SyncFailed,

    #[error("Log persistence disabled")]
    LogsDisabled,

    #[error("Error reading logs")]
    LogQueryFailed,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingUserId | Self::InvalidUserId => StatusCode::BAD_REQUEST,
            Self::NotRunning | Self::LogsDisabled => StatusCode::NOT_FOUND,
            Self::CleanupPending => StatusCode::CONFLICT,
            Self::SyncFailed | Self::LogQueryFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UserIdError> for ApiError {
    fn from(err: UserIdError) -> Self {
        match err {
            UserIdError::Missing => Self::MissingUserId,
            UserIdError::Invalid(_) => Self::InvalidUserId,
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotRunning(_) => Self::NotRunning,
            SessionError::Engine(_) | SessionError::Notify(_) => Self::SyncFailed,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::CleanupPending => {
                (status, Json(serde_json::json!({ "message": self.to_string() }))).into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}
