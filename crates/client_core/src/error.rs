use reqwest::StatusCode;
use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

pub type ChatResult<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Transient transport or server failure. Sends are never retried automatically.
    #[error("network error: {0}")]
    Network(String),
    /// Rejected before any network call, or by the server as malformed.
    #[error("validation error: {0}")]
    Validation(String),
    #[error("subscription error: {0}")]
    Subscription(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not connected: {0}")]
    NotConnected(String),
}

impl ChatError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Network(_) | ChatError::Subscription(_))
    }

    pub(crate) fn from_status(status: StatusCode, body: Option<ApiError>) -> Self {
        let message = body
            .as_ref()
            .map(|err| err.message.clone())
            .unwrap_or_else(|| format!("server responded with {status}"));
        match (status, body.map(|err| err.code)) {
            (_, Some(ErrorCode::NotFound)) | (StatusCode::NOT_FOUND, _) => {
                ChatError::NotFound(message)
            }
            (_, Some(ErrorCode::Validation))
            | (StatusCode::BAD_REQUEST, _)
            | (StatusCode::UNPROCESSABLE_ENTITY, _) => ChatError::Validation(message),
            _ => ChatError::Network(message),
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ChatError::from_status(status, None),
            None => ChatError::Network(err.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Subscription(err.to_string())
    }
}
