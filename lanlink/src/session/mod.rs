//! Peer session: relay signaling, negotiation and the direct channel.
//!
//! A [`Session`] is a cheap handle to a background task that owns all
//! session state (see [`actor`]). The handle checks the published state
//! synchronously, so [`Session::send`] fails with
//! [`SessionError::NotConnected`] before anything is queued.
//!
//! ```text
//! connect(room) -> Joining --joined--> Negotiating --channel open--> Connected
//! ```

mod actor;
pub mod media;
pub mod negotiation;
pub mod state;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanlink_proto::channel::{self, ChannelFrame, DEFAULT_MAX_FRAME_SIZE};
use lanlink_proto::signal::{MediaKind, SessionId};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, watch};

pub use state::SessionState;

use self::actor::{Command, Input, Link, SessionActor};
use crate::events::{EventBus, SessionEvent};
use crate::signaling::SignalingError;
use crate::transfer::{self, DEFAULT_CHUNK_SIZE};
use crate::transport::{LinkType, Payload, PeerLink, TransportError};

/// Default relay connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-candidate dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default `Negotiating` -> `Connected` limit.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of the outbound frame queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Parameters of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the signaling relay, e.g. `ws://192.168.1.10:8765/ws`.
    pub relay_url: String,
    /// Fixed session id; a UUID v7 is generated when `None`.
    pub session_id: Option<SessionId>,
    /// Where the direct channel endpoint binds.
    pub bind_addr: SocketAddr,
    /// File chunk size in bytes.
    pub chunk_size: usize,
    /// Relay connect timeout.
    pub connect_timeout: Duration,
    /// Timeout for dialing one candidate.
    pub dial_timeout: Duration,
    /// Limit on `Negotiating`; `None` waits forever.
    pub negotiation_timeout: Option<Duration>,
    /// Capacity of the outbound frame queue.
    pub channel_capacity: usize,
    /// Largest accepted channel frame in bytes.
    pub max_frame_size: usize,
}

impl SessionConfig {
    /// Defaults for everything except the relay URL.
    #[must_use]
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            session_id: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Checks the values [`Session::new`] cannot work with.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), SessionError> {
        transfer::check_chunk_size(self.chunk_size, self.max_frame_size).map_err(|reason| {
            SessionError::InvalidConfig {
                field: "chunk_size",
                reason,
            }
        })?;
        if self.channel_capacity == 0 {
            return Err(SessionError::InvalidConfig {
                field: "channel_capacity",
                reason: "a zero-capacity queue can never send".into(),
            });
        }
        Ok(())
    }
}

/// Errors returned by [`Session`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The [`SessionConfig`] was rejected by [`Session::new`].
    #[error("invalid session config {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// The relay could not be reached; the session is `Failed`.
    #[error("relay unavailable: {0}")]
    RelayUnavailable(#[source] SignalingError),

    /// Setup failed; the session is `Failed`.
    #[error("session failed: {0}")]
    Failed(String),

    /// The operation needs a `Connected` session.
    #[error("session is not connected (state: {0})")]
    NotConnected(SessionState),

    /// `connect` was called while a connection is active.
    #[error("session is already active (state: {0})")]
    AlreadyActive(SessionState),

    /// Frames for this track cannot be sent yet.
    #[error("{0} track is not running or not negotiated")]
    TrackNotNegotiated(MediaKind),

    /// The direct channel failed, or a frame is too large for it. An
    /// oversized frame is refused before anything is queued.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A file to send could not be read.
    #[error("failed to read {path}: {source}")]
    ReadFile {
        /// The file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// `disconnect` was called before the relay connection opened.
    #[error("connect cancelled")]
    Cancelled,

    /// The session task is gone.
    #[error("session task stopped")]
    Stopped,
}

/// Handle to one peer session.
///
/// Dropping the handle tears the session down.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    chunk_size: usize,
    max_frame_size: usize,
    link: watch::Receiver<Link>,
    events: EventBus,
    inputs: mpsc::UnboundedSender<Input>,
    file_lock: tokio::sync::Mutex<()>,
}

impl Session {
    /// Creates an idle session and spawns its task.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidConfig`] if `config` fails
    /// [`SessionConfig::validate`].
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let id = config.session_id.clone().unwrap_or_else(SessionId::generate);
        let chunk_size = config.chunk_size;
        let max_frame_size = config.max_frame_size;
        let (link_tx, link) = watch::channel(Link::default());
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let events = EventBus::new();

        let actor = SessionActor::new(config, id.clone(), link_tx, events.clone(), inputs.clone());
        tokio::spawn(actor.run(inputs_rx));
        tracing::debug!(session = %id, "session created");

        Ok(Self {
            id,
            chunk_size,
            max_frame_size,
            link,
            events,
            inputs,
            file_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// This session's room-scoped id.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.link.borrow().state
    }

    /// The peer this session paired with, once negotiated.
    #[must_use]
    pub fn remote(&self) -> Option<SessionId> {
        self.link.borrow().remote.clone()
    }

    /// `true` while a media renegotiation is in flight.
    #[must_use]
    pub fn is_renegotiating(&self) -> bool {
        self.link.borrow().renegotiating
    }

    /// Tracks covered by the last completed negotiation.
    #[must_use]
    pub fn negotiated_media(&self) -> BTreeSet<MediaKind> {
        self.link.borrow().negotiated.clone()
    }

    /// The session's event bus.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Joins `room` on the relay.
    ///
    /// Resolves once the relay connection is open and the join request was
    /// sent; the session is then `Joining`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyActive`] unless the session is `Idle` or
    ///   `Failed`.
    /// - [`SessionError::RelayUnavailable`] if the relay cannot be reached;
    ///   the session is then `Failed`.
    /// - [`SessionError::Cancelled`] if `disconnect` ran first.
    pub async fn connect(&self, room: &str) -> Result<(), SessionError> {
        self.request(|reply| Command::Connect {
            room: room.to_string(),
            reply,
        })
        .await
    }

    /// Tears the session down to `Idle`. A no-op when already `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stopped`] if the session task is gone.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Waits until the session reaches `state`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stopped`] if the session task is gone.
    pub async fn wait_for_state(&self, state: SessionState) -> Result<(), SessionError> {
        let mut link = self.link.clone();
        link.wait_for(|l| l.state == state)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Stopped)
    }

    /// Sends one message over the direct channel.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotConnected`] unless `Connected`; nothing is
    ///   queued.
    /// - [`SessionError::Transport`] if the message does not fit in one
    ///   frame (nothing is queued), or the channel closed meanwhile.
    pub async fn send(&self, payload: Payload) -> Result<(), SessionError> {
        let frame = match payload {
            Payload::Text(text) => ChannelFrame::Text(text),
            Payload::Binary(bytes) => ChannelFrame::Binary(bytes),
        };
        let outbound = self.outbound()?;
        self.check_fits(&frame)?;
        push(&outbound, frame).await
    }

    /// Sends a text message.
    ///
    /// # Errors
    ///
    /// Same as [`Session::send`].
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.send(Payload::from(text)).await
    }

    /// Sends `data` as the file `name` in chunk-size pieces.
    ///
    /// # Errors
    ///
    /// Same as [`Session::send`].
    pub async fn send_file(&self, name: &str, data: &[u8]) -> Result<(), SessionError> {
        let outbound = self.outbound()?;
        self.check_fits(&ChannelFrame::FileMeta {
            name: name.to_string(),
            size: data.len() as u64,
        })?;
        let _guard = self.file_lock.lock().await;
        for frame in transfer::file_frames(name, data, self.chunk_size) {
            push(&outbound, frame).await?;
        }
        tracing::info!(session = %self.id, name, size = data.len(), "file sent");
        self.events.publish(SessionEvent::FileSent {
            name: name.to_string(),
            size: data.len() as u64,
        });
        Ok(())
    }

    /// Streams the file at `path` to the peer without loading it whole.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotConnected`] unless `Connected`.
    /// - [`SessionError::ReadFile`] if the file cannot be opened or read.
    /// - [`SessionError::Transport`] if the channel closed meanwhile.
    pub async fn send_file_path(&self, path: &Path) -> Result<(), SessionError> {
        let outbound = self.outbound()?;
        let read_error = |source| SessionError::ReadFile {
            path: path.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::open(path).await.map_err(read_error)?;
        let size = file.metadata().await.map_err(read_error)?.len();
        let name = path
            .file_name()
            .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned());
        let meta = ChannelFrame::FileMeta {
            name: name.clone(),
            size,
        };
        self.check_fits(&meta)?;

        let _guard = self.file_lock.lock().await;
        push(&outbound, meta).await?;

        let mut sent = 0u64;
        loop {
            let chunk = read_chunk(&mut file, self.chunk_size)
                .await
                .map_err(read_error)?;
            if chunk.is_empty() {
                break;
            }
            sent += chunk.len() as u64;
            push(&outbound, ChannelFrame::FileChunk(chunk)).await?;
        }
        push(&outbound, ChannelFrame::FileEnd).await?;

        if sent != size {
            tracing::warn!(session = %self.id, name = %name, size, sent, "file changed while sending");
        }
        tracing::info!(session = %self.id, name = %name, size = sent, "file sent");
        self.events
            .publish(SessionEvent::FileSent { name, size: sent });
        Ok(())
    }

    /// Registers a local media track, renegotiating if the current
    /// negotiation does not cover it. Messages keep flowing meanwhile.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] unless `Connected`.
    pub async fn start_media(&self, kind: MediaKind) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(SessionError::NotConnected(state));
        }
        self.request(|reply| Command::StartMedia { kind, reply })
            .await
    }

    /// Ends a local media track and tells the peer.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] unless `Connected`.
    pub async fn stop_media(&self, kind: MediaKind) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(SessionError::NotConnected(state));
        }
        self.request(|reply| Command::StopMedia { kind, reply })
            .await
    }

    /// Sends one captured media frame on a running, negotiated track.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotConnected`] unless `Connected`.
    /// - [`SessionError::TrackNotNegotiated`] if the track is not running
    ///   or no negotiation covers it yet.
    /// - [`SessionError::Transport`] if the frame is too large.
    pub async fn send_media(&self, kind: MediaKind, data: Vec<u8>) -> Result<(), SessionError> {
        let outbound = {
            let link = self.link.borrow();
            if link.state != SessionState::Connected {
                return Err(SessionError::NotConnected(link.state));
            }
            if !link.local_tracks.contains(&kind) || !link.negotiated.contains(&kind) {
                return Err(SessionError::TrackNotNegotiated(kind));
            }
            link.outbound
                .clone()
                .ok_or(SessionError::NotConnected(link.state))?
        };
        let frame = ChannelFrame::Media { kind, data };
        self.check_fits(&frame)?;
        push(&outbound, frame).await
    }

    fn check_fits(&self, frame: &ChannelFrame) -> Result<(), SessionError> {
        channel::checked_size(frame, self.max_frame_size)
            .map(|_| ())
            .map_err(|e| SessionError::Transport(TransportError::Codec(e)))
    }

    fn outbound(&self) -> Result<mpsc::Sender<ChannelFrame>, SessionError> {
        let link = self.link.borrow();
        match (&link.outbound, link.state) {
            (Some(outbound), SessionState::Connected) => Ok(outbound.clone()),
            (_, state) => Err(SessionError::NotConnected(state)),
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Command,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(Input::Command(command(reply)))
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.inputs.send(Input::Command(Command::Shutdown));
    }
}

impl PeerLink for Session {
    type Error = SessionError;

    fn send(
        &self,
        payload: Payload,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        Self::send(self, payload)
    }

    fn send_file(
        &self,
        name: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        Self::send_file(self, name, data)
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    fn link_type(&self) -> LinkType {
        LinkType::Direct
    }
}

async fn push(outbound: &mpsc::Sender<ChannelFrame>, frame: ChannelFrame) -> Result<(), SessionError> {
    outbound
        .send(frame)
        .await
        .map_err(|_| SessionError::Transport(TransportError::ConnectionClosed))
}

/// Reads up to `size` bytes, short only at end of file.
async fn read_chunk(file: &mut tokio::fs::File, size: usize) -> std::io::Result<Vec<u8>> {
    let mut chunk = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read(&mut chunk[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    chunk.truncate(filled);
    Ok(chunk)
}
