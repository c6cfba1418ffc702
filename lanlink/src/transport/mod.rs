//! Transport layer for `LanLink`.
//!
//! Two ways to reach a peer share one contract, [`PeerLink`]:
//! - the negotiated direct channel ([`quic`]), driven by
//!   [`crate::session::Session`];
//! - a native mesh radio bridge ([`mesh`]), adapted by [`mesh::MeshLink`].
//!
//! [`loopback`] provides an in-process mesh bridge pair for tests and demos.

pub mod loopback;
pub mod mesh;
pub mod quic;

use std::fmt;

use lanlink_proto::channel::CodecError;

use crate::events::EventBus;

/// An opaque application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Binary(Vec<u8>),
}

impl Payload {
    /// Size of the message body in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    /// Returns `true` if the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

/// Describes which kind of link carries a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Direct QUIC channel negotiated through the relay.
    Direct,
    /// Native mesh radio bridge.
    Mesh,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "Direct"),
            Self::Mesh => write!(f, "Mesh"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The address could not be reached.
    #[error("{0} is unreachable")]
    Unreachable(String),

    /// The remote side broke the channel protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Send / receive contract shared by every way of reaching a peer.
///
/// Inbound traffic is delivered as [`crate::events::SessionEvent`]s on the
/// link's [`EventBus`].
pub trait PeerLink: Send + Sync {
    /// Error returned by send operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sends one opaque message to the peer.
    fn send(
        &self,
        payload: Payload,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

    /// Sends a named file to the peer.
    fn send_file(
        &self,
        name: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

    /// Event bus carrying inbound messages and link status.
    fn events(&self) -> &EventBus;

    /// Which kind of link this is.
    fn link_type(&self) -> LinkType;
}
