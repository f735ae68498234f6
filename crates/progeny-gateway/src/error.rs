use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

pub(crate) fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(ErrorBody { message: message.into() })).into_response()
}

/// Why a request could not be relayed. Errors the backend itself returns
/// are passed through untouched and never become a `ProxyError`.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no session cookie; open /start_session/<session> first")]
    MissingSession,

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("invalid session name: {0:?}")]
    InvalidSession(String),

    #[error("invalid JSON body: {0}")]
    BadRequestBody(String),

    /// The record points at a worker that is gone or not answering.
    #[error("backend on port {port} unreachable: {reason}")]
    BackendUnreachable { port: u16, reason: String },

    #[error("registry lookup failed: {0}")]
    Registry(#[from] sea_orm::DbErr),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingSession | Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::InvalidSession(_) | Self::BadRequestBody(_) => StatusCode::BAD_REQUEST,
            Self::BackendUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "relay failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        json_error(status, self.to_string())
    }
}

/// Invalid gateway environment.
#[derive(Debug, thiserror::Error)]
#[error("invalid {name}={value}: {reason}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
    pub reason: String,
}
