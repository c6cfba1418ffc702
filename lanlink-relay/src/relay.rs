//! Relay server core: shared state, WebSocket handler and message routing.
//!
//! Clients connect on `/ws` and speak JSON text frames. A `join` places the
//! client in a room and is acknowledged to that client only; every other
//! frame from a client in a room is fanned out to the other members of that
//! room with its `sender` tag defaulted. Payloads are never interpreted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use lanlink_proto::signal::{self, Routed};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::rooms::{ClientId, ClientIdAllocator, ClientSender, Delivery, RoomRegistry};

/// Body of the health probe answered on `GET /`.
pub const HEALTH_TEXT: &str = "Local Signaling Server OK";

/// Errors raised by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested bind address.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The bound listener did not report its local address.
    #[error("failed to read bound address: {0}")]
    LocalAddr(#[source] std::io::Error),

    /// A client's outbound queue stayed full for the whole send timeout.
    #[error("send to {client} timed out")]
    QueueTimeout {
        /// The slow client.
        client: ClientId,
    },

    /// A client's writer has already gone away.
    #[error("queue of {client} is closed")]
    QueueClosed {
        /// The departed client.
        client: ClientId,
    },
}

/// Tunables applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct RelayLimits {
    /// Longest a broadcast waits on one member's queue.
    pub send_timeout: Duration,
    /// Per-client outbound queue capacity.
    pub queue_capacity: usize,
    /// Inbound frames larger than this are dropped.
    pub max_message_size: usize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(500),
            queue_capacity: 256,
            max_message_size: 256 * 1024,
        }
    }
}

/// Shared relay server state.
#[derive(Debug, Default)]
pub struct RelayState {
    /// Live rooms and their members.
    pub rooms: RoomRegistry,
    ids: ClientIdAllocator,
    limits: RelayLimits,
}

impl RelayState {
    /// Creates relay state with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates relay state with the given limits.
    #[must_use]
    pub fn with_limits(limits: RelayLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Limits applied to connections.
    #[must_use]
    pub const fn limits(&self) -> &RelayLimits {
        &self.limits
    }

    /// Allocates a fresh client id.
    pub fn next_client_id(&self) -> ClientId {
        self.ids.allocate()
    }
}

/// One live connection and the room it is assigned to.
#[derive(Debug)]
pub struct RelayClient {
    id: ClientId,
    room: Option<String>,
    sender: ClientSender,
}

impl RelayClient {
    /// Registers a new anonymous client that is in no room yet.
    #[must_use]
    pub const fn new(id: ClientId, sender: ClientSender) -> Self {
        Self {
            id,
            room: None,
            sender,
        }
    }

    /// This client's id.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// The room the client is currently in, if any.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// Routes one raw inbound text frame.
    ///
    /// Malformed and oversized frames are logged and dropped; the client
    /// stays connected.
    pub async fn handle_text(&mut self, state: &RelayState, raw: &str) {
        if raw.len() > state.limits.max_message_size {
            tracing::warn!(
                client = %self.id,
                size = raw.len(),
                max = state.limits.max_message_size,
                "dropping oversized message"
            );
            return;
        }

        match signal::classify(raw) {
            Ok(Routed::Join { room }) => {
                if let Err(e) = self.join(state, room).await {
                    tracing::warn!(client = %self.id, error = %e, "failed to acknowledge join");
                }
            }
            Ok(Routed::Forward { kind, body }) => {
                if let Some(delivery) = self.forward(state, body).await {
                    tracing::debug!(
                        client = %self.id,
                        kind = %kind,
                        delivered = delivery.delivered,
                        dropped = delivery.dropped,
                        "relayed message"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(client = %self.id, error = %e, "dropping malformed message");
            }
        }
    }

    /// Moves the client into `room`, leaving any previous room first.
    ///
    /// The `joined` acknowledgment is queued before the client becomes a
    /// member, so it always precedes the room's traffic.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::QueueTimeout`] or [`RelayError::QueueClosed`] if
    /// the acknowledgment cannot be queued. The client is in no room then.
    pub async fn join(&mut self, state: &RelayState, room: String) -> Result<(), RelayError> {
        if let Some(old) = self.room.take() {
            state.rooms.leave(&old, self.id).await;
            tracing::info!(client = %self.id, room = %old, "left room");
        }

        match signal::joined_ack(&room) {
            Ok(ack) => self.enqueue(state, ack).await?,
            Err(e) => tracing::error!(client = %self.id, error = %e, "failed to encode joined ack"),
        }

        state.rooms.join(&room, self.id, self.sender.clone()).await;
        tracing::info!(client = %self.id, room = %room, "joined room");
        self.room = Some(room);
        Ok(())
    }

    /// Broadcasts a forwarded message to the other members of the client's
    /// room. Returns `None` (and drops the message) if the client is in no room.
    pub async fn forward(&self, state: &RelayState, mut body: Map<String, Value>) -> Option<Delivery> {
        let Some(room) = self.room.as_deref() else {
            tracing::debug!(client = %self.id, "dropping message from client without a room");
            return None;
        };
        signal::stamp_sender(&mut body);
        let frame = Value::Object(body).to_string();
        Some(
            state
                .rooms
                .broadcast(room, self.id, &frame, state.limits.send_timeout)
                .await,
        )
    }

    /// Removes the client from its room, if any. Idempotent.
    pub async fn disconnect(&mut self, state: &RelayState) {
        if let Some(room) = self.room.take() {
            state.rooms.leave(&room, self.id).await;
            tracing::info!(client = %self.id, room = %room, "left room on disconnect");
        }
    }

    async fn enqueue(&self, state: &RelayState, frame: String) -> Result<(), RelayError> {
        match tokio::time::timeout(state.limits.send_timeout, self.sender.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RelayError::QueueClosed { client: self.id }),
            Err(_) => Err(RelayError::QueueTimeout { client: self.id }),
        }
    }
}

/// Handles one WebSocket connection until either side closes.
///
/// A writer task drains the client's bounded queue into the socket while
/// the reader routes inbound frames. When either finishes the other is
/// stopped and the client leaves its room.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.limits.queue_capacity);
    let mut client = RelayClient::new(state.next_client_id(), tx);
    tracing::info!(client = %client.id, "client connected");

    let writer_id = client.id;
    let mut write_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                tracing::warn!(client = %writer_id, "WebSocket write failed");
                break;
            }
        }
    });

    tokio::select! {
        () = read_loop(&state, &mut client, &mut ws_receiver) => {}
        _ = &mut write_task => {}
    }

    client.disconnect(&state).await;
    write_task.abort();
    tracing::info!(client = %client.id, "client disconnected");
}

async fn read_loop(
    state: &RelayState,
    client: &mut RelayClient,
    ws_receiver: &mut SplitStream<WebSocket>,
) {
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => client.handle_text(state, text.as_str()).await,
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => client.handle_text(state, text).await,
                Err(e) => {
                    tracing::warn!(client = %client.id, error = %e, "dropping non-UTF-8 binary frame");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::debug!(client = %client.id, "received close frame");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                tracing::debug!(client = %client.id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }
}

/// Starts the relay server on the given address with default limits.
///
/// Returns the bound address and a join handle for the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind.
pub async fn start_server(addr: &str) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), RelayError> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), RelayError> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    let bound_addr = listener.local_addr().map_err(RelayError::LocalAddr)?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Builds the axum router: health text on `/`, signaling on `/ws`.
pub fn router(state: Arc<RelayState>) -> axum::Router {
    axum::Router::new()
        .route("/", axum::routing::get(|| async { HEALTH_TEXT }))
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state)
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
