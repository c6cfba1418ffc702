//! Media track bookkeeping for one session.
//!
//! Tracks are only registered here; device capture happens outside the
//! core. A local track can carry frames once an offer/answer cycle has
//! covered its kind.

use std::collections::BTreeSet;

use lanlink_proto::signal::MediaKind;

/// Local, remote and negotiated track sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaState {
    local: BTreeSet<MediaKind>,
    remote: BTreeSet<MediaKind>,
    negotiated: BTreeSet<MediaKind>,
}

/// Remote track changes carried by a new description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteChanges {
    /// Tracks the peer started.
    pub added: Vec<MediaKind>,
    /// Tracks the peer no longer offers.
    pub removed: Vec<MediaKind>,
}

impl MediaState {
    /// Registers a local track. Returns `false` if it was already running.
    pub fn start_local(&mut self, kind: MediaKind) -> bool {
        self.local.insert(kind)
    }

    /// Ends a local track. Returns `false` if it was not running.
    pub fn stop_local(&mut self, kind: MediaKind) -> bool {
        self.local.remove(&kind)
    }

    /// Local tracks currently running.
    #[must_use]
    pub const fn local(&self) -> &BTreeSet<MediaKind> {
        &self.local
    }

    /// Tracks the peer has announced.
    #[must_use]
    pub const fn remote(&self) -> &BTreeSet<MediaKind> {
        &self.remote
    }

    /// Tracks covered by the last completed negotiation.
    #[must_use]
    pub const fn negotiated(&self) -> &BTreeSet<MediaKind> {
        &self.negotiated
    }

    /// `true` if a running local track is not yet covered by a negotiation.
    #[must_use]
    pub fn needs_renegotiation(&self) -> bool {
        !self.local.is_subset(&self.negotiated)
    }

    /// `true` if frames of `kind` may be sent.
    #[must_use]
    pub fn can_send(&self, kind: MediaKind) -> bool {
        self.local.contains(&kind) && self.negotiated.contains(&kind)
    }

    /// Replaces the remote track set with the one a description carries.
    pub fn apply_remote(&mut self, media: &BTreeSet<MediaKind>) -> RemoteChanges {
        let changes = RemoteChanges {
            added: media.difference(&self.remote).copied().collect(),
            removed: self.remote.difference(media).copied().collect(),
        };
        self.remote.clone_from(media);
        changes
    }

    /// Forgets a remote track the peer ended. Returns `false` if unknown.
    pub fn end_remote(&mut self, kind: MediaKind) -> bool {
        self.remote.remove(&kind)
    }

    /// Records a completed cycle in which this side described `local_sent`.
    pub fn settle(&mut self, local_sent: &BTreeSet<MediaKind>) {
        self.negotiated = local_sent.union(&self.remote).copied().collect();
    }

    /// Drops every track.
    pub fn clear(&mut self) {
        self.local.clear();
        self.remote.clear();
        self.negotiated.clear();
    }
}
