//! Alternate transport over a native mesh radio bridge.
//!
//! [`MeshBridge`] is the capability surface a platform radio stack must
//! offer. [`MeshLink`] adapts any bridge to [`PeerLink`], so callers use
//! the same send and event contract as a relay-negotiated
//! [`crate::session::Session`].
//!
//! Payloads cross the bridge as [`MeshPayload`] objects: text as `text`,
//! binary as `bytesBase64`, and files as `bytesBase64` plus `name`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{LinkType, Payload, PeerLink};
use crate::events::{EventBus, SessionEvent};
use crate::transfer::FileTransfer;

/// Errors reported by a mesh bridge or link.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// The radio is switched off.
    #[error("mesh radio is not enabled")]
    Disabled,

    /// The peer is not connected.
    #[error("mesh peer {0} is not connected")]
    NotConnected(String),

    /// The platform bridge reported a failure.
    #[error("mesh bridge error: {0}")]
    Bridge(String),

    /// An inbound payload could not be decoded.
    #[error("invalid mesh payload: {0}")]
    InvalidPayload(String),

    /// The link was closed.
    #[error("mesh link closed")]
    Closed,
}

/// A device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Bridge-specific peer id.
    pub id: String,
    /// Advertised name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Received signal strength, if the radio reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
}

/// Body of one mesh message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshPayload {
    /// Text body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Binary body, base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_base64: Option<String>,
    /// File name when the bytes are a file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl MeshPayload {
    /// Encodes an application payload.
    #[must_use]
    pub fn from_payload(payload: &Payload) -> Self {
        match payload {
            Payload::Text(text) => Self {
                text: Some(text.clone()),
                ..Self::default()
            },
            Payload::Binary(bytes) => Self {
                bytes_base64: Some(STANDARD.encode(bytes)),
                ..Self::default()
            },
        }
    }

    /// Decodes this payload into the event it represents.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::InvalidPayload`] for bad base64 or an empty body.
    pub fn into_event(self, from: &str) -> Result<SessionEvent, MeshError> {
        if let Some(encoded) = self.bytes_base64 {
            let data = STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| MeshError::InvalidPayload(e.to_string()))?;
            return Ok(match self.name {
                Some(name) => {
                    let size = data.len() as u64;
                    SessionEvent::FileReceived(FileTransfer {
                        name,
                        declared_size: size,
                        received: size,
                        completed: true,
                        data,
                    })
                }
                None => SessionEvent::Message {
                    from: from.to_string(),
                    payload: Payload::Binary(data),
                },
            });
        }
        match self.text {
            Some(text) => Ok(SessionEvent::Message {
                from: from.to_string(),
                payload: Payload::Text(text),
            }),
            None => Err(MeshError::InvalidPayload("empty payload".to_string())),
        }
    }
}

/// One inbound mesh message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshMessage {
    /// Sending peer id.
    pub from: String,
    /// Message body.
    pub payload: MeshPayload,
}

/// Capability surface of a native mesh radio.
pub trait MeshBridge: Send + Sync + 'static {
    /// Switches the radio on.
    fn enable(&self) -> impl Future<Output = Result<(), MeshError>> + Send;

    /// Whether the radio is on.
    fn is_enabled(&self) -> impl Future<Output = bool> + Send;

    /// Looks for nearby devices for `duration`.
    fn scan(
        &self,
        duration: Duration,
    ) -> impl Future<Output = Result<Vec<DeviceInfo>, MeshError>> + Send;

    /// Connects to `peer_id`; `Ok(false)` if the peer refused or vanished.
    fn connect(&self, peer_id: &str) -> impl Future<Output = Result<bool, MeshError>> + Send;

    /// Drops the connection to `peer_id`.
    fn disconnect(&self, peer_id: &str) -> impl Future<Output = Result<(), MeshError>> + Send;

    /// Sends one message to `peer_id`.
    fn send_message(
        &self,
        peer_id: &str,
        payload: MeshPayload,
    ) -> impl Future<Output = Result<(), MeshError>> + Send;

    /// Sends a base64-encoded file to `peer_id`.
    fn send_file(
        &self,
        peer_id: &str,
        bytes_base64: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), MeshError>> + Send;

    /// Registers a listener for inbound messages.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<MeshMessage>;

    /// Drops every registered listener.
    fn remove_all_listeners(&self);
}

/// [`PeerLink`] over a mesh bridge, bound to one peer.
pub struct MeshLink<B: MeshBridge> {
    bridge: Arc<B>,
    peer: String,
    events: EventBus,
    pump: JoinHandle<()>,
    closed: AtomicBool,
}

impl<B: MeshBridge> std::fmt::Debug for MeshLink<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshLink")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl<B: MeshBridge> MeshLink<B> {
    /// Enables the radio if needed, connects to `peer` and starts
    /// publishing its messages.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NotConnected`] if the peer does not accept, or
    /// any error the bridge reports.
    pub async fn open(bridge: Arc<B>, peer: impl Into<String>) -> Result<Self, MeshError> {
        let peer = peer.into();
        if !bridge.is_enabled().await {
            bridge.enable().await?;
        }
        if !bridge.connect(&peer).await? {
            return Err(MeshError::NotConnected(peer));
        }

        let events = EventBus::new();
        let inbound = bridge.subscribe();
        let pump = tokio::spawn(pump(inbound, peer.clone(), events.clone()));
        tracing::info!(peer = %peer, "mesh link open");

        Ok(Self {
            bridge,
            peer,
            events,
            pump,
            closed: AtomicBool::new(false),
        })
    }

    /// The connected peer's id.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Disconnects from the peer and stops publishing.
    ///
    /// # Errors
    ///
    /// Returns any error the bridge reports while disconnecting.
    pub async fn close(&self) -> Result<(), MeshError> {
        self.closed.store(true, Ordering::Release);
        self.pump.abort();
        self.bridge.disconnect(&self.peer).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.pump.is_finished()
    }

    async fn send_payload(&self, payload: Payload) -> Result<(), MeshError> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        self.bridge
            .send_message(&self.peer, MeshPayload::from_payload(&payload))
            .await
    }

    async fn send_named_file(&self, name: &str, data: &[u8]) -> Result<(), MeshError> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        let encoded = STANDARD.encode(data);
        self.bridge.send_file(&self.peer, &encoded, name).await?;
        self.events.publish(SessionEvent::FileSent {
            name: name.to_string(),
            size: data.len() as u64,
        });
        Ok(())
    }
}

impl<B: MeshBridge> Drop for MeshLink<B> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl<B: MeshBridge> PeerLink for MeshLink<B> {
    type Error = MeshError;

    fn send(&self, payload: Payload) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.send_payload(payload)
    }

    fn send_file(
        &self,
        name: &str,
        data: &[u8],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.send_named_file(name, data)
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    fn link_type(&self) -> LinkType {
        LinkType::Mesh
    }
}

/// Publishes messages from `peer` until the bridge drops the listener.
async fn pump(mut inbound: mpsc::UnboundedReceiver<MeshMessage>, peer: String, events: EventBus) {
    while let Some(msg) = inbound.recv().await {
        if msg.from != peer {
            continue;
        }
        match msg.payload.into_event(&msg.from) {
            Ok(event) => events.publish(event),
            Err(e) => tracing::warn!(peer = %peer, error = %e, "dropping mesh message"),
        }
    }
    tracing::debug!(peer = %peer, "mesh listener closed");
}
