//! WebSocket client for the signaling relay.
//!
//! [`SignalingClient::connect`] opens the socket and spawns two tasks: a
//! writer that drains an outbound queue into the socket, and a reader that
//! decodes inbound text frames into [`SignalMessage`]s. Malformed frames are
//! logged and skipped. The inbound receiver ends when the relay connection
//! is lost.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lanlink_proto::signal::{ProtoError, SignalMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Errors from the signaling client.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// The relay URL is not a usable `ws://` or `wss://` URL.
    #[error("invalid relay URL {url:?}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The WebSocket handshake did not finish in time.
    #[error("relay connect timed out")]
    Timeout,

    /// The relay could not be reached.
    #[error("relay unreachable: {0}")]
    Unreachable(String),

    /// The relay connection is closed.
    #[error("relay connection closed")]
    Closed,

    /// A message could not be encoded.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Checks that `raw` is a `ws://` or `wss://` URL.
///
/// # Errors
///
/// Returns [`SignalingError::InvalidUrl`] otherwise.
pub fn validate_url(raw: &str) -> Result<url::Url, SignalingError> {
    let parsed = url::Url::parse(raw).map_err(|e| SignalingError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(SignalingError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other:?}"),
        }),
    }
}

/// An open connection to the signaling relay.
#[derive(Debug)]
pub struct SignalingClient {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    /// Connects to the relay at `url`.
    ///
    /// Returns the client and the stream of inbound messages. The stream
    /// ends when the relay closes the connection or it fails.
    ///
    /// # Errors
    ///
    /// - [`SignalingError::InvalidUrl`] for a malformed URL.
    /// - [`SignalingError::Timeout`] if the handshake exceeds `timeout`.
    /// - [`SignalingError::Unreachable`] if the relay cannot be reached.
    pub async fn connect(
        url: &str,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalMessage>), SignalingError> {
        validate_url(url)?;

        let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "relay WebSocket connect timed out");
                SignalingError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "relay WebSocket connect failed");
                SignalingError::Unreachable(e.to_string())
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(writer_loop(ws_sender, outbound_rx));
        let reader = tokio::spawn(reader_loop(ws_reader, inbound_tx));
        tracing::info!(url, "connected to signaling relay");

        Ok((
            Self {
                url: url.to_string(),
                outbound,
                reader,
            },
            inbound,
        ))
    }

    /// The relay URL this client is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queues one message for the relay.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Closed`] once the connection is gone and
    /// [`SignalingError::Proto`] if the message cannot be encoded.
    pub fn send(&self, msg: &SignalMessage) -> Result<(), SignalingError> {
        let raw = msg.encode()?;
        self.outbound
            .send(Message::text(raw))
            .map_err(|_| SignalingError::Closed)
    }

    /// Returns `true` while the writer task is still accepting messages.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Sends a close frame and stops reading.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
        self.reader.abort();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn writer_loop(mut ws_sender: WsSender, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = ws_sender.send(msg).await {
            tracing::debug!(err = %e, "relay send failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = ws_sender.close().await;
}

/// Reads relay frames until the socket closes.
///
/// Malformed frames are logged and skipped; they never end the connection.
async fn reader_loop(mut ws_reader: WsReader, tx: mpsc::UnboundedSender<SignalMessage>) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match SignalMessage::decode(text.as_str()) {
                Ok(msg) => {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed signaling frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("relay WebSocket closed by server");
                break;
            }
            Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "relay WebSocket read error");
                break;
            }
        }
    }
    tracing::debug!("relay reader task exiting");
}
