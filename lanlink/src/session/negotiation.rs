//! Offer / answer / candidate bookkeeping for one session.
//!
//! [`Negotiator`] performs no I/O. The session task feeds it relay payloads
//! and carries out the returned [`Step`]s.
//!
//! Every session offers as soon as it reaches `Negotiating`. When two offers
//! of the same revision cross, the session with the smaller id keeps its
//! offer and re-sends it to the other; the larger id drops its own offer and
//! answers. The answering side dials the offerer's candidates.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

use lanlink_proto::signal::{
    Candidate, MediaKind, ProtoError, SdpKind, SessionDescription, SessionId, SignalMessage,
};
use serde_json::Value;

use super::media::MediaState;

/// Errors that fail a negotiation.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// A description payload did not match the schema.
    #[error("malformed session description: {0}")]
    MalformedDescription(#[source] ProtoError),

    /// An answer addressed to this session arrived with no matching offer.
    #[error("unexpected answer from {from} (revision {revision})")]
    UnexpectedAnswer {
        /// Session that sent the answer.
        from: SessionId,
        /// Revision the answer carried.
        revision: u64,
    },

    /// A local description could not be encoded.
    #[error("failed to encode local description: {0}")]
    Encode(#[source] ProtoError),
}

/// Which side of the initial cycle this session took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Kept its offer; accepts the peer's dial.
    Offerer,
    /// Answered the peer's offer; dials the peer's candidates.
    Answerer,
}

/// Action requested by the negotiator.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Relay this description, then replay local candidates.
    Send(SignalMessage),
    /// Dial any new candidates of the paired peer.
    Dial,
    /// The peer started a track.
    RemoteTrackAdded(MediaKind),
    /// The peer dropped a track.
    RemoteTrackRemoved(MediaKind),
    /// An offer/answer cycle completed.
    Negotiated {
        /// Revision of the completed cycle.
        revision: u64,
        /// Tracks now covered.
        media: BTreeSet<MediaKind>,
    },
}

/// Result of handing one candidate payload to the negotiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// A new address was stored for `session`.
    Stored {
        /// Session the candidate belongs to.
        session: SessionId,
        /// Parsed address.
        address: SocketAddr,
    },
    /// Already known, self-sent, or addressed to another session.
    Ignored,
    /// The payload could not be used; it was dropped.
    Malformed(String),
}

/// Sans-IO negotiation state machine.
#[derive(Debug)]
pub struct Negotiator {
    local: SessionId,
    remote: Option<SessionId>,
    role: Option<Role>,
    /// Last completed revision; 0 before the first cycle.
    completed: u64,
    local_offer: Option<SessionDescription>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    media: MediaState,
    remote_candidates: HashMap<SessionId, Vec<SocketAddr>>,
    dialed: BTreeSet<SocketAddr>,
    local_candidates: Vec<SocketAddr>,
}

impl Negotiator {
    /// Creates a negotiator for the local session `local`.
    #[must_use]
    pub fn new(local: SessionId) -> Self {
        Self {
            local,
            remote: None,
            role: None,
            completed: 0,
            local_offer: None,
            local_description: None,
            remote_description: None,
            media: MediaState::default(),
            remote_candidates: HashMap::new(),
            dialed: BTreeSet::new(),
            local_candidates: Vec::new(),
        }
    }

    /// This session's id.
    #[must_use]
    pub const fn local(&self) -> &SessionId {
        &self.local
    }

    /// The peer this session paired with, if any.
    #[must_use]
    pub const fn remote(&self) -> Option<&SessionId> {
        self.remote.as_ref()
    }

    /// Role taken in the initial cycle.
    #[must_use]
    pub const fn role(&self) -> Option<Role> {
        self.role
    }

    /// Revision of the last completed cycle (0 if none).
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.completed
    }

    /// The last description this side produced.
    #[must_use]
    pub const fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    /// The last description accepted from the peer.
    #[must_use]
    pub const fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// `true` while a renegotiation offer awaits its answer.
    #[must_use]
    pub const fn is_renegotiating(&self) -> bool {
        self.local_offer.is_some() && self.completed > 0
    }

    /// `true` while any local offer awaits its answer.
    #[must_use]
    pub const fn has_outstanding_offer(&self) -> bool {
        self.local_offer.is_some()
    }

    /// Track bookkeeping.
    #[must_use]
    pub const fn media(&self) -> &MediaState {
        &self.media
    }

    /// Mutable track bookkeeping.
    pub const fn media_mut(&mut self) -> &mut MediaState {
        &mut self.media
    }

    /// Produces a local offer covering the running local tracks.
    ///
    /// The first offer is broadcast to the room; later offers renegotiate
    /// with the paired peer at the next revision.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Encode`] if the offer cannot be encoded.
    pub fn create_offer(&mut self) -> Result<SignalMessage, NegotiationError> {
        let (revision, target) = match (&self.remote, self.completed) {
            (Some(remote), completed) if completed > 0 => (completed + 1, Some(remote.clone())),
            (remote, _) => (1, remote.clone()),
        };
        let offer = SessionDescription {
            kind: SdpKind::Offer,
            session: self.local.clone(),
            target,
            revision,
            media: self.media.local().clone(),
        };
        let msg = SignalMessage::description(&offer).map_err(NegotiationError::Encode)?;
        tracing::debug!(session = %self.local, revision, "created local offer");
        self.local_description = Some(offer.clone());
        self.local_offer = Some(offer);
        Ok(msg)
    }

    /// Applies a description payload received through the relay.
    ///
    /// # Errors
    ///
    /// - [`NegotiationError::MalformedDescription`] if the payload does not
    ///   decode.
    /// - [`NegotiationError::UnexpectedAnswer`] for an answer addressed to
    ///   this session that matches no offer.
    pub fn on_description(&mut self, payload: &Value) -> Result<Vec<Step>, NegotiationError> {
        let desc =
            SessionDescription::from_value(payload).map_err(NegotiationError::MalformedDescription)?;

        if desc.session == self.local || !desc.is_for(&self.local) {
            return Ok(Vec::new());
        }
        if self.remote.as_ref().is_some_and(|r| *r != desc.session) {
            tracing::debug!(
                session = %self.local,
                from = %desc.session,
                "ignoring description from unpaired session"
            );
            return Ok(Vec::new());
        }

        match desc.kind {
            SdpKind::Offer => self.on_offer(desc),
            SdpKind::Answer => self.on_answer(desc),
        }
    }

    fn on_offer(&mut self, desc: SessionDescription) -> Result<Vec<Step>, NegotiationError> {
        if desc.revision <= self.completed {
            tracing::debug!(
                session = %self.local,
                revision = desc.revision,
                "ignoring stale offer"
            );
            return Ok(Vec::new());
        }

        if let Some(own) = &self.local_offer {
            if desc.revision < own.revision {
                return Ok(Vec::new());
            }
            if desc.revision == own.revision && self.local < desc.session {
                // Glare won: keep the offer and address it to the peer.
                let mut own = own.clone();
                own.target = Some(desc.session.clone());
                let msg = SignalMessage::description(&own).map_err(NegotiationError::Encode)?;
                tracing::debug!(
                    session = %self.local,
                    peer = %desc.session,
                    revision = own.revision,
                    "offer collision won, re-sending offer"
                );
                self.remote = Some(desc.session);
                self.local_description = Some(own.clone());
                self.local_offer = Some(own);
                return Ok(vec![Step::Send(msg)]);
            }
            tracing::debug!(
                session = %self.local,
                peer = %desc.session,
                "offer collision lost, answering"
            );
            self.local_offer = None;
        }

        let answer = SessionDescription {
            kind: SdpKind::Answer,
            session: self.local.clone(),
            target: Some(desc.session.clone()),
            revision: desc.revision,
            media: self.media.local().clone(),
        };
        let msg = SignalMessage::description(&answer).map_err(NegotiationError::Encode)?;

        self.remote = Some(desc.session.clone());
        self.role.get_or_insert(Role::Answerer);
        self.completed = desc.revision;

        let mut steps = vec![Step::Send(msg)];
        if self.role == Some(Role::Answerer) {
            steps.push(Step::Dial);
        }
        let changes = self.media.apply_remote(&desc.media);
        steps.extend(changes.added.into_iter().map(Step::RemoteTrackAdded));
        steps.extend(changes.removed.into_iter().map(Step::RemoteTrackRemoved));
        self.media.settle(&answer.media);
        steps.push(Step::Negotiated {
            revision: desc.revision,
            media: self.media.negotiated().clone(),
        });

        self.local_description = Some(answer);
        self.remote_description = Some(desc);
        Ok(steps)
    }

    fn on_answer(&mut self, desc: SessionDescription) -> Result<Vec<Step>, NegotiationError> {
        let matches_offer = self.local_offer.as_ref().is_some_and(|offer| {
            offer.revision == desc.revision
                && offer.target.as_ref().is_none_or(|t| *t == desc.session)
        });

        if !matches_offer {
            if self.remote.as_ref() == Some(&desc.session) && desc.revision <= self.completed {
                return Ok(Vec::new());
            }
            if desc.target.as_ref() == Some(&self.local) {
                return Err(NegotiationError::UnexpectedAnswer {
                    from: desc.session,
                    revision: desc.revision,
                });
            }
            return Ok(Vec::new());
        }

        let Some(offer) = self.local_offer.take() else {
            return Ok(Vec::new());
        };
        tracing::debug!(
            session = %self.local,
            peer = %desc.session,
            revision = desc.revision,
            "offer answered"
        );
        self.remote = Some(desc.session.clone());
        self.role.get_or_insert(Role::Offerer);
        self.completed = desc.revision;

        let changes = self.media.apply_remote(&desc.media);
        let mut steps: Vec<Step> = changes
            .added
            .into_iter()
            .map(Step::RemoteTrackAdded)
            .chain(changes.removed.into_iter().map(Step::RemoteTrackRemoved))
            .collect();
        self.media.settle(&offer.media);
        steps.push(Step::Negotiated {
            revision: desc.revision,
            media: self.media.negotiated().clone(),
        });
        self.remote_description = Some(desc);
        Ok(steps)
    }

    /// Stores a candidate payload received through the relay.
    ///
    /// Candidates are kept per sending session until the peer is known, so
    /// candidates that arrive before the description are not lost.
    pub fn on_candidate(&mut self, payload: &Value) -> CandidateOutcome {
        let candidate = match Candidate::from_value(payload) {
            Ok(c) => c,
            Err(e) => return CandidateOutcome::Malformed(e.to_string()),
        };
        if candidate.session == self.local || !candidate.is_for(&self.local) {
            return CandidateOutcome::Ignored;
        }
        if self.remote.as_ref().is_some_and(|r| *r != candidate.session) {
            return CandidateOutcome::Ignored;
        }
        let address = match candidate.socket_addr() {
            Ok(a) => a,
            Err(e) => return CandidateOutcome::Malformed(e.to_string()),
        };

        let known = self
            .remote_candidates
            .entry(candidate.session.clone())
            .or_default();
        if known.contains(&address) {
            return CandidateOutcome::Ignored;
        }
        known.push(address);
        CandidateOutcome::Stored {
            session: candidate.session,
            address,
        }
    }

    /// Records the addresses of the local channel container.
    pub fn set_local_candidates(&mut self, candidates: Vec<SocketAddr>) {
        self.local_candidates = candidates;
    }

    /// Local candidates as relay messages, addressed to the peer if paired.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Encode`] if a candidate cannot be encoded.
    pub fn candidate_messages(&self) -> Result<Vec<SignalMessage>, NegotiationError> {
        self.local_candidates
            .iter()
            .map(|addr| {
                SignalMessage::candidate(&Candidate {
                    address: addr.to_string(),
                    session: self.local.clone(),
                    target: self.remote.clone(),
                })
                .map_err(NegotiationError::Encode)
            })
            .collect()
    }

    /// Candidates of the paired peer that this side should dial now.
    ///
    /// Only the answering side dials, and each address at most once.
    pub fn take_dial_targets(&mut self) -> Vec<SocketAddr> {
        if self.role != Some(Role::Answerer) {
            return Vec::new();
        }
        let Some(remote) = &self.remote else {
            return Vec::new();
        };
        let Some(known) = self.remote_candidates.get(remote) else {
            return Vec::new();
        };
        known
            .iter()
            .copied()
            .filter(|addr| self.dialed.insert(*addr))
            .collect()
    }

    /// Whether an incoming channel introducing `session` and asking for
    /// `target` belongs to this negotiation.
    #[must_use]
    pub fn accepts_hello(&self, session: &SessionId, target: &SessionId) -> bool {
        *target == self.local
            && self.role == Some(Role::Offerer)
            && self.remote.as_ref() == Some(session)
    }

    /// Forgets everything except the local id.
    pub fn reset(&mut self) {
        *self = Self::new(self.local.clone());
    }
}
