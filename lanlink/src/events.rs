//! Per-session publish / subscribe registry.
//!
//! Each session (or mesh link) owns one [`EventBus`]. Subscribers choose the
//! [`EventKind`]s they care about and receive matching [`SessionEvent`]s on
//! an unbounded channel, in publish order. There is no process-wide
//! listener state: dropping the bus owner and its subscriptions frees
//! everything.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use lanlink_proto::signal::MediaKind;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::session::SessionState;
use crate::transfer::{FileTransfer, TransferError};
use crate::transport::Payload;

/// Something that happened on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session moved between lifecycle states.
    StateChanged {
        /// Previous state.
        from: SessionState,
        /// New state.
        to: SessionState,
    },
    /// A message arrived from the peer.
    Message {
        /// Remote session id or mesh peer id.
        from: String,
        /// The message body.
        payload: Payload,
    },
    /// The peer started sending a file.
    TransferStarted {
        /// File name.
        name: String,
        /// Declared size in bytes.
        size: u64,
    },
    /// More bytes of an inbound file arrived.
    TransferProgress {
        /// File name.
        name: String,
        /// Bytes received so far.
        received: u64,
        /// Declared size in bytes.
        size: u64,
    },
    /// An inbound file completed with the declared size.
    FileReceived(FileTransfer),
    /// An outbound file was fully handed to the channel.
    FileSent {
        /// File name.
        name: String,
        /// Bytes sent.
        size: u64,
    },
    /// An inbound file did not complete.
    TransferFailed {
        /// File name.
        name: String,
        /// Why it failed, including declared and received byte counts.
        error: TransferError,
    },
    /// A local media track was registered.
    LocalTrackStarted(MediaKind),
    /// A local media track was stopped.
    LocalTrackStopped(MediaKind),
    /// The peer added a media track.
    RemoteTrack(MediaKind),
    /// The peer ended a media track.
    RemoteTrackEnded(MediaKind),
    /// One media frame from the peer.
    MediaFrame {
        /// Track the frame belongs to.
        kind: MediaKind,
        /// Opaque encoded frame.
        data: Vec<u8>,
    },
    /// An offer/answer cycle completed.
    MediaNegotiated {
        /// Negotiation cycle counter.
        revision: u64,
        /// Tracks now covered by the session.
        media: BTreeSet<MediaKind>,
    },
    /// The session failed; it is now in the `Failed` state.
    Failed {
        /// Human-readable cause.
        reason: String,
    },
    /// The direct channel broke while `Connected`; the session closes.
    ChannelError {
        /// Human-readable cause.
        reason: String,
    },
}

/// Discriminant of a [`SessionEvent`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`SessionEvent::StateChanged`].
    State,
    /// [`SessionEvent::Message`].
    Message,
    /// Started, progress, received, sent and failed file events.
    Transfer,
    /// Local and remote track events, media frames and negotiation results.
    Media,
    /// [`SessionEvent::Failed`] and [`SessionEvent::ChannelError`].
    Error,
}

impl SessionEvent {
    /// The kind this event is filtered under.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::StateChanged { .. } => EventKind::State,
            Self::Message { .. } => EventKind::Message,
            Self::TransferStarted { .. }
            | Self::TransferProgress { .. }
            | Self::FileReceived(_)
            | Self::FileSent { .. }
            | Self::TransferFailed { .. } => EventKind::Transfer,
            Self::LocalTrackStarted(_)
            | Self::LocalTrackStopped(_)
            | Self::RemoteTrack(_)
            | Self::RemoteTrackEnded(_)
            | Self::MediaFrame { .. }
            | Self::MediaNegotiated { .. } => EventKind::Media,
            Self::Failed { .. } | Self::ChannelError { .. } => EventKind::Error,
        }
    }
}

/// Handle identifying one subscription on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    kinds: Option<HashSet<EventKind>>,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Typed publish / subscribe registry. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to events of the given kinds.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.register(Some(kinds.iter().copied().collect()))
    }

    /// Subscribes to every event.
    pub fn subscribe_all(&self) -> Subscription {
        self.register(None)
    }

    /// Removes one subscription. Its receiver sees the end of the stream.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().subscribers.retain(|s| s.id != id);
    }

    /// Removes every subscription.
    pub fn clear(&self) {
        self.inner.lock().subscribers.clear();
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Delivers `event` to every matching subscriber.
    ///
    /// Subscribers whose receiver was dropped are pruned.
    pub fn publish(&self, event: SessionEvent) {
        let kind = event.kind();
        let mut registry = self.inner.lock();
        registry.subscribers.retain(|s| {
            if s.kinds.as_ref().is_some_and(|k| !k.contains(&kind)) {
                return !s.tx.is_closed();
            }
            s.tx.send(event.clone()).is_ok()
        });
    }

    fn register(&self, kinds: Option<HashSet<EventKind>>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.inner.lock();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.subscribers.push(Subscriber { id, kinds, tx });
        Subscription { id, rx }
    }
}

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Subscription {
    /// This subscription's id, for [`EventBus::unsubscribe`].
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next event. `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}
