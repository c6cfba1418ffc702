//! Frames carried on the direct peer-to-peer channel.
//!
//! Frames are encoded with postcard and sent with a 4-byte little-endian
//! length prefix, since the underlying stream does not preserve message
//! boundaries.
//!
//! A file transfer is one [`ChannelFrame::FileMeta`], then zero or more
//! [`ChannelFrame::FileChunk`]s, then a terminal [`ChannelFrame::FileEnd`].

use serde::{Deserialize, Serialize};

use crate::signal::{MediaKind, SessionId};

/// Length of the frame size prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

/// Default upper bound on an encoded frame (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Bytes of a [`ChannelFrame::FileChunk`] that are not file data, rounded
/// up generously. A chunk size at most `max_frame_size - CHUNK_OVERHEAD`
/// always fits.
pub const CHUNK_OVERHEAD: usize = 64;

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame is incomplete or has an invalid length prefix.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// Frame exceeds the permitted size.
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    Oversized {
        /// Encoded size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// One message on the direct channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelFrame {
    /// First frame on a freshly dialed stream: who is calling whom.
    Hello {
        /// Dialing session.
        session: SessionId,
        /// Session the dialer negotiated with.
        target: SessionId,
    },
    /// Application text message.
    Text(String),
    /// Application binary message.
    Binary(Vec<u8>),
    /// Starts a file transfer.
    FileMeta {
        /// File name as given by the sender.
        name: String,
        /// Declared total size in bytes.
        size: u64,
    },
    /// One chunk of the current file.
    FileChunk(Vec<u8>),
    /// Terminal marker of the current file.
    FileEnd,
    /// One captured media frame.
    Media {
        /// Track the frame belongs to.
        kind: MediaKind,
        /// Opaque encoded frame.
        data: Vec<u8>,
    },
    /// The sender stopped a local track.
    TrackEnded {
        /// The stopped track.
        kind: MediaKind,
    },
    /// Graceful close notice.
    Bye,
}

/// Encodes a frame into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode(frame: &ChannelFrame) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a frame from a byte slice using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode(bytes: &[u8]) -> Result<ChannelFrame, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encoded size of `frame`, without the length prefix, checked against
/// `max_frame_size`. Nothing is allocated.
///
/// # Errors
///
/// Returns `CodecError::Oversized` if the frame would exceed the limit, or
/// `CodecError::Serialization` if it cannot be serialized.
pub fn checked_size(frame: &ChannelFrame, max_frame_size: usize) -> Result<usize, CodecError> {
    let size = postcard::experimental::serialized_size(frame)
        .map_err(|e| CodecError::Serialization(e.to_string()))?;
    if size > max_frame_size {
        return Err(CodecError::Oversized {
            size,
            max: max_frame_size,
        });
    }
    Ok(size)
}

/// Largest file chunk that fits in a frame of `max_frame_size` bytes.
#[must_use]
pub const fn max_chunk_size(max_frame_size: usize) -> usize {
    max_frame_size.saturating_sub(CHUNK_OVERHEAD)
}

/// Encodes a frame with a 4-byte little-endian length prefix.
///
/// Wire format: `[u32 length (LE)][payload bytes]`
///
/// # Errors
///
/// Returns `CodecError::Oversized` if the encoded frame is larger than
/// `max_frame_size`, or `CodecError::Serialization` on encode failure.
pub fn encode_framed(frame: &ChannelFrame, max_frame_size: usize) -> Result<Vec<u8>, CodecError> {
    let payload = encode(frame)?;
    if payload.len() > max_frame_size {
        return Err(CodecError::Oversized {
            size: payload.len(),
            max: max_frame_size,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::Oversized {
        size: payload.len(),
        max: max_frame_size,
    })?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Reads the payload length from a length prefix and checks it against the limit.
///
/// # Errors
///
/// Returns `CodecError::Oversized` if the announced length exceeds `max_frame_size`.
pub fn payload_len(prefix: [u8; LENGTH_PREFIX], max_frame_size: usize) -> Result<usize, CodecError> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_frame_size {
        return Err(CodecError::Oversized {
            size: len,
            max: max_frame_size,
        });
    }
    Ok(len)
}

/// Decodes a length-prefixed frame.
///
/// Returns the frame and the number of bytes consumed, including the prefix.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the input is shorter than the
/// prefix announces, `CodecError::Oversized` if the announced length exceeds
/// `max_frame_size`, or `CodecError::Serialization` for a bad payload.
pub fn decode_framed(
    bytes: &[u8],
    max_frame_size: usize,
) -> Result<(ChannelFrame, usize), CodecError> {
    let Some(prefix) = bytes.get(..LENGTH_PREFIX) else {
        return Err(CodecError::InvalidFrame(format!(
            "need at least {LENGTH_PREFIX} bytes for length prefix, got {}",
            bytes.len()
        )));
    };
    let prefix: [u8; LENGTH_PREFIX] = prefix
        .try_into()
        .map_err(|_| CodecError::InvalidFrame("failed to read length prefix".into()))?;
    let len = payload_len(prefix, max_frame_size)?;

    let total = LENGTH_PREFIX + len;
    let Some(payload) = bytes.get(LENGTH_PREFIX..total) else {
        return Err(CodecError::InvalidFrame(format!(
            "frame indicates {len} bytes but only {} available",
            bytes.len() - LENGTH_PREFIX
        )));
    };
    Ok((decode(payload)?, total))
}
