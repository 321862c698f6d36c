use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::EventFrame;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, warn};

const LINK_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid event channel url: {0}")]
    InvalidUrl(String),
    #[error("event channel handshake failed: {0}")]
    Handshake(String),
}

/// An established event-channel link. Dropping `outbound` closes the link;
/// `inbound` yields `None` once the remote side is gone.
pub struct TransportLink {
    pub outbound: mpsc::Sender<EventFrame>,
    pub inbound: mpsc::Receiver<EventFrame>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, credential: &str) -> Result<TransportLink, TransportError>;
}

/// Event channel carried over a websocket, one JSON `{event, data}` frame per
/// text message.
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            url: websocket_url(url)?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, credential: &str) -> Result<TransportLink, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {credential}"))
            .map_err(|err| TransportError::Handshake(err.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| TransportError::Handshake(err.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<EventFrame>(LINK_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel::<EventFrame>(LINK_BUFFER);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = %frame.event, "transport: failed to encode frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("transport: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<EventFrame>(&text) {
                        Ok(frame) => {
                            if inbound_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("transport: ignoring malformed frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("transport: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            debug!("transport: websocket reader finished");
        });

        Ok(TransportLink { outbound, inbound })
    }
}

/// Accepts `ws(s)://` as-is and maps `http(s)://` onto the websocket scheme.
pub fn websocket_url(raw: &str) -> Result<String, TransportError> {
    let mut url = url::Url::parse(raw).map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme `{other}`"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(raw.to_string()))?;
    Ok(url.to_string())
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
