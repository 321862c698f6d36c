use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            429 => Self::RateLimited,
            400..=499 => Self::Validation,
            _ => Self::Internal,
        }
    }
}

/// Error body the service sends alongside a non-success status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: String,
}

impl ApiErrorBody {
    /// Best-effort extraction of the service message from a raw body.
    pub fn message_from(raw: &str) -> String {
        match serde_json::from_str::<ApiErrorBody>(raw) {
            Ok(body) if !body.message.is_empty() => body.message,
            _ => raw.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("inbound {event} payload is not valid JSON: {source}")]
    InvalidJson {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("inbound {event} payload has an unexpected shape: {source}")]
    UnexpectedShape {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("inbound message carries no conversation id")]
    MissingConversationId,
}
