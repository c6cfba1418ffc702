//! Chunked file transfer over the direct channel.
//!
//! A file travels as one [`ChannelFrame::FileMeta`] record, then
//! `ceil(size / chunk_size)` [`ChannelFrame::FileChunk`]s, then one
//! [`ChannelFrame::FileEnd`] marker. The receiver keys chunks to the most
//! recent metadata record and never trusts the declared size: a transfer
//! completes only when the end marker arrives with exactly the declared
//! number of bytes.

use lanlink_proto::channel::{self, ChannelFrame};

use crate::events::SessionEvent;

/// Default chunk size in bytes (16 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Largest buffer reserved up front for an inbound file, whatever its
/// declared size.
const MAX_PREALLOCATION: usize = 1024 * 1024;

/// Why an inbound transfer did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// The end marker arrived with a byte count other than the declared size.
    #[error("integrity check failed: received {received} of {declared} declared bytes")]
    SizeMismatch {
        /// Declared size.
        declared: u64,
        /// Bytes actually received.
        received: u64,
    },

    /// A chunk would have pushed the received bytes past the declared size.
    #[error("chunk of {chunk} bytes overflows declared size {declared} (already {received})")]
    Overflow {
        /// Declared size.
        declared: u64,
        /// Bytes received before the offending chunk.
        received: u64,
        /// Size of the offending chunk.
        chunk: u64,
    },

    /// The channel closed before the end marker.
    #[error("channel closed after {received} of {declared} bytes")]
    Interrupted {
        /// Declared size.
        declared: u64,
        /// Bytes received before closure.
        received: u64,
    },

    /// A new metadata record arrived before the end marker.
    #[error("superseded by a new transfer after {received} of {declared} bytes")]
    Superseded {
        /// Declared size.
        declared: u64,
        /// Bytes received before the new record.
        received: u64,
    },
}

impl TransferError {
    /// Bytes received before the failure.
    #[must_use]
    pub const fn received(&self) -> u64 {
        match self {
            Self::SizeMismatch { received, .. }
            | Self::Overflow { received, .. }
            | Self::Interrupted { received, .. }
            | Self::Superseded { received, .. } => *received,
        }
    }

    /// Size the sender declared.
    #[must_use]
    pub const fn declared(&self) -> u64 {
        match self {
            Self::SizeMismatch { declared, .. }
            | Self::Overflow { declared, .. }
            | Self::Interrupted { declared, .. }
            | Self::Superseded { declared, .. } => *declared,
        }
    }
}

/// One inbound file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    /// File name as given by the sender.
    pub name: String,
    /// Size the sender declared.
    pub declared_size: u64,
    /// Bytes received so far. Never exceeds `declared_size`.
    pub received: u64,
    /// Set once the end marker arrived with the declared size.
    pub completed: bool,
    /// Accumulated file contents.
    pub data: Vec<u8>,
}

impl FileTransfer {
    fn new(name: String, declared_size: u64) -> Self {
        let reserve = usize::try_from(declared_size).map_or(MAX_PREALLOCATION, |s| s.min(MAX_PREALLOCATION));
        Self {
            name,
            declared_size,
            received: 0,
            completed: false,
            data: Vec::with_capacity(reserve),
        }
    }
}

/// What the receiver should report after handling one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundUpdate {
    /// A new transfer began.
    Started {
        /// File name.
        name: String,
        /// Declared size.
        size: u64,
    },
    /// Bytes were appended to the current transfer.
    Progress {
        /// File name.
        name: String,
        /// Bytes received so far.
        received: u64,
        /// Declared size.
        size: u64,
    },
    /// The current transfer completed.
    Completed(FileTransfer),
    /// The current transfer failed.
    Failed {
        /// File name.
        name: String,
        /// Cause.
        error: TransferError,
    },
    /// The frame belonged to no active transfer and was dropped.
    Orphaned,
}

impl InboundUpdate {
    /// The event to publish for this update; `None` for orphaned frames.
    #[must_use]
    pub fn into_event(self) -> Option<SessionEvent> {
        match self {
            Self::Started { name, size } => Some(SessionEvent::TransferStarted { name, size }),
            Self::Progress {
                name,
                received,
                size,
            } => Some(SessionEvent::TransferProgress {
                name,
                received,
                size,
            }),
            Self::Completed(transfer) => Some(SessionEvent::FileReceived(transfer)),
            Self::Failed { name, error } => Some(SessionEvent::TransferFailed { name, error }),
            Self::Orphaned => None,
        }
    }
}

/// Receiver-side state: at most one file in flight.
#[derive(Debug, Default)]
pub struct InboundTransfers {
    current: Option<FileTransfer>,
}

impl InboundTransfers {
    /// Creates a receiver with no active transfer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The transfer in flight, if any.
    #[must_use]
    pub const fn current(&self) -> Option<&FileTransfer> {
        self.current.as_ref()
    }

    /// Handles a metadata record. An unfinished transfer is failed first.
    pub fn on_meta(&mut self, name: String, size: u64) -> Vec<InboundUpdate> {
        let mut updates = Vec::with_capacity(2);
        if let Some(previous) = self.current.take() {
            updates.push(InboundUpdate::Failed {
                error: TransferError::Superseded {
                    declared: previous.declared_size,
                    received: previous.received,
                },
                name: previous.name,
            });
        }
        updates.push(InboundUpdate::Started {
            name: name.clone(),
            size,
        });
        self.current = Some(FileTransfer::new(name, size));
        updates
    }

    /// Appends a chunk to the current transfer.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> InboundUpdate {
        let Some(transfer) = self.current.as_mut() else {
            return InboundUpdate::Orphaned;
        };
        let len = chunk.len() as u64;
        if transfer.received + len > transfer.declared_size {
            let error = TransferError::Overflow {
                declared: transfer.declared_size,
                received: transfer.received,
                chunk: len,
            };
            let name = transfer.name.clone();
            self.current = None;
            return InboundUpdate::Failed { name, error };
        }
        transfer.data.extend_from_slice(chunk);
        transfer.received += len;
        InboundUpdate::Progress {
            name: transfer.name.clone(),
            received: transfer.received,
            size: transfer.declared_size,
        }
    }

    /// Closes the current transfer on its end marker.
    pub fn on_end(&mut self) -> InboundUpdate {
        let Some(mut transfer) = self.current.take() else {
            return InboundUpdate::Orphaned;
        };
        if transfer.received == transfer.declared_size {
            transfer.completed = true;
            InboundUpdate::Completed(transfer)
        } else {
            InboundUpdate::Failed {
                error: TransferError::SizeMismatch {
                    declared: transfer.declared_size,
                    received: transfer.received,
                },
                name: transfer.name,
            }
        }
    }

    /// Fails the current transfer because the channel closed.
    pub fn on_close(&mut self) -> Option<InboundUpdate> {
        let transfer = self.current.take()?;
        Some(InboundUpdate::Failed {
            error: TransferError::Interrupted {
                declared: transfer.declared_size,
                received: transfer.received,
            },
            name: transfer.name,
        })
    }
}

/// Number of chunks a file of `size` bytes is split into.
#[must_use]
pub const fn chunk_count(size: usize, chunk_size: usize) -> usize {
    size.div_ceil(chunk_size)
}

/// Checks that chunks of `chunk_size` bytes are non-empty and fit in a
/// frame of `max_frame_size` bytes.
///
/// # Errors
///
/// A description of the acceptable range otherwise.
pub fn check_chunk_size(chunk_size: usize, max_frame_size: usize) -> Result<(), String> {
    let max = channel::max_chunk_size(max_frame_size);
    if chunk_size == 0 || chunk_size > max {
        return Err(format!(
            "{chunk_size} is outside 1..={max} for a {max_frame_size}-byte frame limit"
        ));
    }
    Ok(())
}

/// All frames for sending `data` as `name`: metadata, chunks, end marker.
///
/// `chunk_size` must be non-zero.
#[must_use]
pub fn file_frames(name: &str, data: &[u8], chunk_size: usize) -> Vec<ChannelFrame> {
    let mut frames = Vec::with_capacity(chunk_count(data.len(), chunk_size) + 2);
    frames.push(ChannelFrame::FileMeta {
        name: name.to_string(),
        size: data.len() as u64,
    });
    frames.extend(
        data.chunks(chunk_size)
            .map(|chunk| ChannelFrame::FileChunk(chunk.to_vec())),
    );
    frames.push(ChannelFrame::FileEnd);
    frames
}
