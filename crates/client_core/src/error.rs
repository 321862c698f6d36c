use shared::error::{ApiErrorBody, ProtocolError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Authorization failed and could not be recovered by a refresh. The
    /// session has been torn down by the time a caller sees this.
    #[error("unauthorized: session is no longer valid")]
    Unauthorized,
    #[error("network error: {0}")]
    Network(String),
    #[error("server responded {status}: {}", ApiErrorBody::message_from(body))]
    Server { status: u16, body: String },
    #[error("event channel connection lost")]
    ConnectionLost,
    #[error("event channel is not connected")]
    NotConnected,
    #[error("no conversation selected")]
    NoConversationSelected,
    #[error("message needs text content or an attachment")]
    EmptyMessage,
    #[error("no authenticated session")]
    NoSession,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// A request body could not be encoded or a response body decoded.
    #[error("payload encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Server {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => Self::Network(err.to_string()),
        }
    }
}
