//! Signaling wire protocol for the `LanLink` relay.
//!
//! Every relay message is a JSON object discriminated by its `type` field:
//!
//! ```text
//! {"type":"join","room":"<string>"}
//! {"type":"joined","room":"<string>"}
//! {"type":"sdp","sdp":{"type":"offer"|"answer", ...},"sender":"<id>"}
//! {"type":"ice","candidate":{ ... },"sender":"<id>"}
//! ```
//!
//! Clients work with the closed [`SignalMessage`] union. The relay never
//! decodes payloads: it uses [`classify`] to read the discriminators it needs
//! for routing and forwards everything else untouched.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Sender tag stamped on relayed messages whose origin did not supply one.
pub const DEFAULT_SENDER: &str = "peer";

/// Errors produced while parsing or building signaling messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The frame is not valid JSON or does not match the expected schema.
    #[error("invalid signaling JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame parsed as JSON but is not an object.
    #[error("signaling message is not a JSON object")]
    NotAnObject,

    /// The object has no string `type` discriminator.
    #[error("signaling message has no `type` field")]
    MissingType,

    /// A `join` message carried no usable `room`.
    #[error("join message has no string `room` field")]
    MissingRoom,

    /// A candidate address could not be parsed as `ip:port`.
    #[error("invalid candidate address {0:?}")]
    InvalidAddress(String),
}

/// Room-scoped identifier of one session.
///
/// Ordered lexicographically; the ordering decides which side keeps its
/// offer when both sides offer at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a session id from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh time-ordered session id (UUID v7).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages exchanged between session clients and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// Client asks to be placed in `room`.
    Join {
        /// Caller-supplied room identifier.
        room: String,
    },
    /// Relay acknowledges a join (sent to the joining client only).
    Joined {
        /// The room that was joined.
        room: String,
    },
    /// A session description; the payload decodes as [`SessionDescription`].
    Sdp {
        /// Raw description object.
        sdp: Value,
        /// Best-effort origin tag.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    /// A connectivity candidate; the payload decodes as [`Candidate`].
    Ice {
        /// Raw candidate object.
        candidate: Value,
        /// Best-effort origin tag.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
}

impl SignalMessage {
    /// Wraps a description into an `sdp` message tagged with its session.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Json`] if the description cannot be serialized.
    pub fn description(desc: &SessionDescription) -> Result<Self, ProtoError> {
        Ok(Self::Sdp {
            sdp: serde_json::to_value(desc)?,
            sender: Some(desc.session.to_string()),
        })
    }

    /// Wraps a candidate into an `ice` message tagged with its session.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Json`] if the candidate cannot be serialized.
    pub fn candidate(candidate: &Candidate) -> Result<Self, ProtoError> {
        Ok(Self::Ice {
            candidate: serde_json::to_value(candidate)?,
            sender: Some(candidate.session.to_string()),
        })
    }

    /// Serializes this message to its JSON text form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Json`] if serialization fails.
    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a message from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Json`] for malformed JSON or unknown `type`s.
    pub fn decode(raw: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Whether a description proposes or accepts session parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Proposal from the offering side.
    Offer,
    /// Acceptance from the answering side.
    Answer,
}

/// Kind of a live media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone audio.
    Audio,
    /// Camera video.
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

const fn first_revision() -> u64 {
    1
}

/// Negotiation payload carried inside `sdp` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Session that produced this description.
    pub session: SessionId,
    /// Session this description is addressed to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<SessionId>,
    /// Negotiation cycle counter; renegotiation bumps it.
    #[serde(default = "first_revision")]
    pub revision: u64,
    /// Media tracks covered by this description.
    #[serde(default)]
    pub media: BTreeSet<MediaKind>,
}

impl SessionDescription {
    /// Decodes a description from the raw `sdp` payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Json`] if the payload does not match the schema.
    pub fn from_value(value: &Value) -> Result<Self, ProtoError> {
        Ok(Self::deserialize(value)?)
    }

    /// Returns `true` if this description is broadcast or addressed to `local`.
    #[must_use]
    pub fn is_for(&self, local: &SessionId) -> bool {
        self.target.as_ref().is_none_or(|t| t == local)
    }
}

/// Connectivity option for reaching a peer's direct channel endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Endpoint address in `ip:port` form.
    pub address: String,
    /// Session that gathered this candidate.
    pub session: SessionId,
    /// Session this candidate is addressed to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<SessionId>,
}

impl Candidate {
    /// Decodes a candidate from the raw `candidate` payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Json`] if the payload does not match the schema.
    pub fn from_value(value: &Value) -> Result<Self, ProtoError> {
        Ok(Self::deserialize(value)?)
    }

    /// Parses the candidate address.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidAddress`] if it is not `ip:port`.
    pub fn socket_addr(&self) -> Result<SocketAddr, ProtoError> {
        self.address
            .parse()
            .map_err(|_| ProtoError::InvalidAddress(self.address.clone()))
    }

    /// Returns `true` if this candidate is broadcast or addressed to `local`.
    #[must_use]
    pub fn is_for(&self, local: &SessionId) -> bool {
        self.target.as_ref().is_none_or(|t| t == local)
    }
}

// ---------------------------------------------------------------------------
// Relay-side routing
// ---------------------------------------------------------------------------

/// Routing decision for a raw inbound relay frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Membership request for `room`.
    Join {
        /// Requested room.
        room: String,
    },
    /// Any other message, to be fanned out to the sender's room.
    Forward {
        /// The `type` discriminator, kept for logging.
        kind: String,
        /// The untouched message object.
        body: Map<String, Value>,
    },
}

/// Classifies a raw relay frame by its `type` (and `room` for joins).
///
/// No other field is inspected; payloads of forwarded messages stay opaque.
///
/// # Errors
///
/// Returns a [`ProtoError`] if the frame is not a JSON object with a string
/// `type`, or if a `join` lacks a string `room`.
pub fn classify(raw: &str) -> Result<Routed, ProtoError> {
    let Value::Object(body) = serde_json::from_str::<Value>(raw)? else {
        return Err(ProtoError::NotAnObject);
    };
    let kind = body
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtoError::MissingType)?;

    if kind == "join" {
        let room = body
            .get("room")
            .and_then(Value::as_str)
            .ok_or(ProtoError::MissingRoom)?;
        return Ok(Routed::Join {
            room: room.to_string(),
        });
    }

    Ok(Routed::Forward {
        kind: kind.to_string(),
        body,
    })
}

/// Defaults the `sender` tag of a forwarded message.
///
/// A missing, `null` or empty sender becomes [`DEFAULT_SENDER`]; any other
/// value is kept as-is.
pub fn stamp_sender(body: &mut Map<String, Value>) {
    let missing = match body.get("sender") {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    };
    if missing {
        body.insert(
            "sender".to_string(),
            Value::String(DEFAULT_SENDER.to_string()),
        );
    }
}

/// Builds the JSON text of a `joined` acknowledgment.
///
/// # Errors
///
/// Returns [`ProtoError::Json`] if serialization fails.
pub fn joined_ack(room: &str) -> Result<String, ProtoError> {
    SignalMessage::Joined {
        room: room.to_string(),
    }
    .encode()
}
