//! The task that owns one session.
//!
//! All state transitions happen here, one [`Input`] at a time. Background
//! work (opening the relay, binding the channel container, dialing,
//! accepting, reading the channel) runs in spawned tasks that report back
//! as inputs tagged with the epoch they were started in. Teardown bumps the
//! epoch, so results that arrive late are closed and dropped instead of
//! being applied.

use std::collections::BTreeSet;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lanlink_proto::channel::ChannelFrame;
use lanlink_proto::signal::{MediaKind, SessionId, SignalMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::negotiation::{CandidateOutcome, Negotiator, Step};
use super::{SessionConfig, SessionError, SessionState};
use crate::events::{EventBus, SessionEvent};
use crate::signaling::{SignalingClient, SignalingError};
use crate::transfer::{InboundTransfers, InboundUpdate};
use crate::transport::quic::{ChannelCloser, ChannelContainer, DirectChannel, FrameReader, FrameWriter};
use crate::transport::{Payload, TransportError};

/// How long teardown waits for the goodbye frame to be written.
const BYE_GRACE: Duration = Duration::from_millis(250);

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// What the session handle can see without asking the task.
#[derive(Debug, Clone, Default)]
pub(crate) struct Link {
    pub state: SessionState,
    pub outbound: Option<mpsc::Sender<ChannelFrame>>,
    pub remote: Option<SessionId>,
    pub local_tracks: BTreeSet<MediaKind>,
    pub negotiated: BTreeSet<MediaKind>,
    pub renegotiating: bool,
}

/// Requests from the session handle.
#[derive(Debug)]
pub(crate) enum Command {
    Connect { room: String, reply: Reply<()> },
    Disconnect { reply: Reply<()> },
    StartMedia { kind: MediaKind, reply: Reply<()> },
    StopMedia { kind: MediaKind, reply: Reply<()> },
    Shutdown,
}

type RelayOpen = Result<(SignalingClient, mpsc::UnboundedReceiver<SignalMessage>), SignalingError>;

/// Everything the session task reacts to.
#[derive(Debug)]
pub(crate) enum Input {
    Command(Command),
    RelayOpened { epoch: u64, result: RelayOpen },
    Signal { epoch: u64, msg: SignalMessage },
    RelayClosed { epoch: u64 },
    ContainerReady { epoch: u64, result: Result<ChannelContainer, TransportError> },
    Incoming {
        epoch: u64,
        channel: DirectChannel,
        session: SessionId,
        target: SessionId,
    },
    Dialed {
        epoch: u64,
        addr: SocketAddr,
        result: Result<DirectChannel, TransportError>,
    },
    RemoteTrackEnded { epoch: u64, kind: MediaKind },
    ChannelClosed { epoch: u64 },
    ChannelWriteFailed { epoch: u64, error: TransportError },
    NegotiationTimeout { epoch: u64 },
}

/// Tasks serving the bound direct channel.
struct BoundChannel {
    outbound: mpsc::Sender<ChannelFrame>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    closer: ChannelCloser,
}

impl BoundChannel {
    /// Says goodbye, then closes the connection and waits briefly for both
    /// tasks to wind down.
    async fn shutdown(self) {
        let Self {
            outbound,
            mut writer,
            mut reader,
            closer,
        } = self;
        let _ = outbound.try_send(ChannelFrame::Bye);
        drop(outbound);
        if tokio::time::timeout(BYE_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
        closer.close();
        if tokio::time::timeout(BYE_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}

pub(crate) struct SessionActor {
    config: SessionConfig,
    id: SessionId,
    epoch: u64,
    link: watch::Sender<Link>,
    events: EventBus,
    inputs: mpsc::UnboundedSender<Input>,
    room: Option<String>,
    connect_reply: Option<Reply<()>>,
    relay: Option<SignalingClient>,
    relay_pump: Option<JoinHandle<()>>,
    held: Vec<SignalMessage>,
    negotiator: Negotiator,
    container: Option<Arc<ChannelContainer>>,
    accept_task: Option<JoinHandle<()>>,
    dial_tasks: Vec<JoinHandle<()>>,
    pending_incoming: Vec<(DirectChannel, SessionId)>,
    channel: Option<BoundChannel>,
    timeout_task: Option<JoinHandle<()>>,
}

impl SessionActor {
    pub(crate) fn new(
        config: SessionConfig,
        id: SessionId,
        link: watch::Sender<Link>,
        events: EventBus,
        inputs: mpsc::UnboundedSender<Input>,
    ) -> Self {
        Self {
            config,
            negotiator: Negotiator::new(id.clone()),
            id,
            epoch: 0,
            link,
            events,
            inputs,
            room: None,
            connect_reply: None,
            relay: None,
            relay_pump: None,
            held: Vec::new(),
            container: None,
            accept_task: None,
            dial_tasks: Vec::new(),
            pending_incoming: Vec::new(),
            channel: None,
            timeout_task: None,
        }
    }

    /// Processes inputs until the handle asks for shutdown.
    pub(crate) async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inputs.recv().await {
            match input {
                Input::Command(Command::Shutdown) => break,
                other => self.handle(other).await,
            }
        }
        if self.state().is_active() {
            self.release().await;
        }
        tracing::debug!(session = %self.id, "session task stopped");
    }

    fn state(&self) -> SessionState {
        self.link.borrow().state
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.on_command(command).await,
            Input::RelayOpened { epoch, result } => self.on_relay_opened(epoch, result).await,
            Input::Signal { epoch, msg } if epoch == self.epoch => self.on_signal(msg).await,
            Input::RelayClosed { epoch } if epoch == self.epoch => self.on_relay_closed().await,
            Input::ContainerReady { epoch, result } => self.on_container(epoch, result).await,
            Input::Incoming {
                epoch,
                channel,
                session,
                target,
            } => self.on_incoming(epoch, channel, session, &target),
            Input::Dialed {
                epoch,
                addr,
                result,
            } => self.on_dialed(epoch, addr, result),
            Input::RemoteTrackEnded { epoch, kind } if epoch == self.epoch => {
                if self.negotiator.media_mut().end_remote(kind) {
                    self.events.publish(SessionEvent::RemoteTrackEnded(kind));
                }
            }
            Input::ChannelClosed { epoch } if epoch == self.epoch => self.on_channel_closed().await,
            Input::ChannelWriteFailed { epoch, error } if epoch == self.epoch => {
                self.on_channel_write_failed(error).await;
            }
            Input::NegotiationTimeout { epoch } if epoch == self.epoch => {
                if self.state() == SessionState::Negotiating {
                    let reason = match self.config.negotiation_timeout {
                        Some(t) => format!("negotiation timed out after {}ms", t.as_millis()),
                        None => "negotiation timed out".to_string(),
                    };
                    self.fail(reason, None).await;
                }
            }
            Input::Signal { .. }
            | Input::RelayClosed { .. }
            | Input::RemoteTrackEnded { .. }
            | Input::ChannelClosed { .. }
            | Input::ChannelWriteFailed { .. }
            | Input::NegotiationTimeout { .. } => {
                tracing::trace!(session = %self.id, "dropping stale input");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn transition(&self, to: SessionState) {
        let from = self.state();
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            tracing::warn!(session = %self.id, %from, %to, "rejected state transition");
            return;
        }
        self.link.send_modify(|link| link.state = to);
        tracing::info!(session = %self.id, %from, %to, "session state changed");
        self.events.publish(SessionEvent::StateChanged { from, to });
    }

    /// Releases everything and moves to `Failed`.
    async fn fail(&mut self, reason: String, connect_error: Option<SessionError>) {
        tracing::warn!(session = %self.id, reason = %reason, "session failed");
        let reply = self.connect_reply.take();
        self.release().await;
        self.transition(SessionState::Failed);
        self.events.publish(SessionEvent::Failed {
            reason: reason.clone(),
        });
        if let Some(reply) = reply {
            let _ = reply.send(Err(connect_error.unwrap_or(SessionError::Failed(reason))));
        }
    }

    /// Full teardown from an active state: `Closed`, release, `Idle`.
    async fn close(&mut self) {
        self.transition(SessionState::Closed);
        self.release().await;
        self.transition(SessionState::Idle);
    }

    /// Closes every resource of the current attempt and invalidates its
    /// pending results.
    async fn release(&mut self) {
        self.epoch += 1;
        for task in [
            self.timeout_task.take(),
            self.accept_task.take(),
            self.relay_pump.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        for task in self.dial_tasks.drain(..) {
            task.abort();
        }
        for (channel, _) in self.pending_incoming.drain(..) {
            channel.close();
        }
        self.link.send_modify(|link| {
            link.outbound = None;
            link.remote = None;
            link.local_tracks.clear();
            link.negotiated.clear();
            link.renegotiating = false;
        });
        if let Some(channel) = self.channel.take() {
            channel.shutdown().await;
        }
        if let Some(container) = self.container.take() {
            container.close();
        }
        if let Some(relay) = self.relay.take() {
            relay.close();
        }
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(SessionError::Cancelled));
        }
        self.held.clear();
        self.room = None;
        self.negotiator.reset();
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { room, reply } => self.on_connect(room, reply),
            Command::Disconnect { reply } => {
                match self.state() {
                    SessionState::Idle | SessionState::Closed => {}
                    SessionState::Failed => {
                        self.transition(SessionState::Closed);
                        self.transition(SessionState::Idle);
                    }
                    SessionState::Joining | SessionState::Negotiating | SessionState::Connected => {
                        self.close().await;
                    }
                }
                let _ = reply.send(Ok(()));
            }
            Command::StartMedia { kind, reply } => {
                let _ = reply.send(self.start_media(kind));
            }
            Command::StopMedia { kind, reply } => {
                let _ = reply.send(self.stop_media(kind).await);
            }
            Command::Shutdown => {}
        }
    }

    fn on_connect(&mut self, room: String, reply: Reply<()>) {
        let state = self.state();
        if !matches!(state, SessionState::Idle | SessionState::Failed) {
            let _ = reply.send(Err(SessionError::AlreadyActive(state)));
            return;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        tracing::info!(session = %self.id, room = %room, url = %self.config.relay_url, "connecting");
        self.room = Some(room);
        self.connect_reply = Some(reply);
        self.transition(SessionState::Joining);

        let url = self.config.relay_url.clone();
        let timeout = self.config.connect_timeout;
        let tx = self.inputs.clone();
        tokio::spawn(async move {
            let result = SignalingClient::connect(&url, timeout).await;
            let _ = tx.send(Input::RelayOpened { epoch, result });
        });
    }

    fn start_media(&mut self, kind: MediaKind) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(SessionError::NotConnected(state));
        }
        if !self.negotiator.media_mut().start_local(kind) {
            return Ok(());
        }
        let local = self.negotiator.media().local().clone();
        self.link.send_modify(|link| link.local_tracks = local);
        tracing::info!(session = %self.id, %kind, "local track started");
        self.events.publish(SessionEvent::LocalTrackStarted(kind));
        self.renegotiate_if_needed();
        Ok(())
    }

    async fn stop_media(&mut self, kind: MediaKind) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(SessionError::NotConnected(state));
        }
        if !self.negotiator.media_mut().stop_local(kind) {
            return Ok(());
        }
        let local = self.negotiator.media().local().clone();
        self.link.send_modify(|link| link.local_tracks = local);
        tracing::info!(session = %self.id, %kind, "local track stopped");
        self.events.publish(SessionEvent::LocalTrackStopped(kind));
        if let Some(channel) = &self.channel {
            channel
                .outbound
                .send(ChannelFrame::TrackEnded { kind })
                .await
                .map_err(|_| SessionError::Transport(TransportError::ConnectionClosed))?;
        }
        Ok(())
    }

    fn renegotiate_if_needed(&mut self) {
        if self.state() != SessionState::Connected
            || self.negotiator.has_outstanding_offer()
            || !self.negotiator.media().needs_renegotiation()
        {
            return;
        }
        match self.negotiator.create_offer() {
            Ok(offer) => {
                tracing::debug!(session = %self.id, "renegotiating media");
                self.link.send_modify(|link| link.renegotiating = true);
                self.relay_send(&offer);
            }
            Err(e) => tracing::warn!(session = %self.id, error = %e, "renegotiation offer failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Relay
    // -----------------------------------------------------------------------

    fn relay_send(&self, msg: &SignalMessage) {
        let Some(relay) = &self.relay else {
            return;
        };
        if let Err(e) = relay.send(msg) {
            tracing::warn!(session = %self.id, error = %e, "relay send failed");
        }
    }

    fn send_candidates(&self) {
        match self.negotiator.candidate_messages() {
            Ok(messages) => {
                for msg in &messages {
                    self.relay_send(msg);
                }
            }
            Err(e) => tracing::warn!(session = %self.id, error = %e, "failed to encode candidates"),
        }
    }

    async fn on_relay_opened(&mut self, epoch: u64, result: RelayOpen) {
        if epoch != self.epoch {
            if let Ok((client, _)) = result {
                client.close();
            }
            return;
        }

        let (client, mut inbound) = match result {
            Ok(opened) => opened,
            Err(e) => {
                let reason = format!("relay unavailable: {e}");
                self.fail(reason, Some(SessionError::RelayUnavailable(e))).await;
                return;
            }
        };

        let Some(room) = self.room.clone() else {
            client.close();
            return;
        };
        if let Err(e) = client.send(&SignalMessage::Join { room: room.clone() }) {
            let reason = format!("relay unavailable: {e}");
            client.close();
            self.fail(reason, Some(SessionError::RelayUnavailable(e))).await;
            return;
        }
        tracing::debug!(session = %self.id, room = %room, "join sent");

        let tx = self.inputs.clone();
        self.relay_pump = Some(tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                if tx.send(Input::Signal { epoch, msg }).is_err() {
                    return;
                }
            }
            let _ = tx.send(Input::RelayClosed { epoch });
        }));
        self.relay = Some(client);
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Ok(()));
        }
    }

    async fn on_relay_closed(&mut self) {
        match self.state() {
            SessionState::Joining | SessionState::Negotiating => {
                self.fail("relay connection lost".to_string(), None).await;
            }
            SessionState::Connected => {
                tracing::info!(session = %self.id, "relay connection lost, closing session");
                self.close().await;
            }
            SessionState::Idle | SessionState::Closed | SessionState::Failed => {}
        }
    }

    async fn on_signal(&mut self, msg: SignalMessage) {
        match self.state() {
            SessionState::Joining => match msg {
                SignalMessage::Joined { room } if self.room.as_deref() == Some(room.as_str()) => {
                    tracing::info!(session = %self.id, room = %room, "joined room");
                    self.enter_negotiating().await;
                }
                other => self.held.push(other),
            },
            SessionState::Negotiating | SessionState::Connected => self.apply_signal(msg).await,
            SessionState::Idle | SessionState::Closed | SessionState::Failed => {}
        }
    }

    async fn enter_negotiating(&mut self) {
        self.transition(SessionState::Negotiating);
        let epoch = self.epoch;

        if let Some(limit) = self.config.negotiation_timeout {
            let tx = self.inputs.clone();
            self.timeout_task = Some(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                let _ = tx.send(Input::NegotiationTimeout { epoch });
            }));
        }

        match self.negotiator.create_offer() {
            Ok(offer) => self.relay_send(&offer),
            Err(e) => {
                self.fail(e.to_string(), None).await;
                return;
            }
        }

        let addr = self.config.bind_addr;
        let max_frame_size = self.config.max_frame_size;
        let tx = self.inputs.clone();
        tokio::spawn(async move {
            let result = ChannelContainer::bind(addr, max_frame_size).await;
            let _ = tx.send(Input::ContainerReady { epoch, result });
        });

        for msg in mem::take(&mut self.held) {
            if !self.state().is_active() || self.epoch != epoch {
                break;
            }
            self.apply_signal(msg).await;
        }
    }

    async fn apply_signal(&mut self, msg: SignalMessage) {
        match msg {
            SignalMessage::Sdp { sdp, .. } => match self.negotiator.on_description(&sdp) {
                Ok(steps) => {
                    self.run_steps(steps);
                    self.recheck_incoming();
                }
                Err(e) if self.state() == SessionState::Negotiating => {
                    self.fail(e.to_string(), None).await;
                }
                Err(e) => {
                    tracing::warn!(session = %self.id, error = %e, "ignoring rejected renegotiation");
                }
            },
            SignalMessage::Ice { candidate, .. } => match self.negotiator.on_candidate(&candidate) {
                CandidateOutcome::Stored { session, address } => {
                    tracing::debug!(session = %self.id, peer = %session, %address, "stored remote candidate");
                    self.try_dial();
                }
                CandidateOutcome::Malformed(reason) => {
                    tracing::warn!(session = %self.id, reason = %reason, "dropping malformed candidate");
                }
                CandidateOutcome::Ignored => {}
            },
            SignalMessage::Join { .. } | SignalMessage::Joined { .. } => {
                tracing::debug!(session = %self.id, "ignoring membership message");
            }
        }
    }

    fn run_steps(&mut self, steps: Vec<Step>) {
        for step in steps {
            match step {
                Step::Send(msg) => {
                    self.relay_send(&msg);
                    self.send_candidates();
                }
                Step::Dial => self.try_dial(),
                Step::RemoteTrackAdded(kind) => {
                    self.events.publish(SessionEvent::RemoteTrack(kind));
                }
                Step::RemoteTrackRemoved(kind) => {
                    self.events.publish(SessionEvent::RemoteTrackEnded(kind));
                }
                Step::Negotiated { revision, media } => {
                    tracing::debug!(session = %self.id, revision, "negotiation cycle complete");
                    let remote = self.negotiator.remote().cloned();
                    let renegotiating = self.negotiator.is_renegotiating();
                    let negotiated = media.clone();
                    self.link.send_modify(|link| {
                        link.remote = remote;
                        link.negotiated = negotiated;
                        link.renegotiating = renegotiating;
                    });
                    self.events
                        .publish(SessionEvent::MediaNegotiated { revision, media });
                    self.renegotiate_if_needed();
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Direct channel
    // -----------------------------------------------------------------------

    async fn on_container(&mut self, epoch: u64, result: Result<ChannelContainer, TransportError>) {
        if epoch != self.epoch {
            if let Ok(container) = result {
                container.close();
            }
            return;
        }
        let container = match result {
            Ok(container) => Arc::new(container),
            Err(e) => {
                self.fail(format!("channel container failed: {e}"), None).await;
                return;
            }
        };

        self.negotiator
            .set_local_candidates(container.candidates().to_vec());
        self.send_candidates();

        let acceptor = Arc::clone(&container);
        let tx = self.inputs.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok((channel, session, target)) => {
                        let incoming = Input::Incoming {
                            epoch,
                            channel,
                            session,
                            target,
                        };
                        if tx.send(incoming).is_err() {
                            return;
                        }
                    }
                    Err(TransportError::ConnectionClosed) => return,
                    Err(e) => tracing::debug!(error = %e, "rejected incoming channel"),
                }
            }
        }));
        self.container = Some(container);
        self.try_dial();
    }

    fn try_dial(&mut self) {
        if self.state() != SessionState::Negotiating || self.channel.is_some() {
            return;
        }
        let Some(container) = &self.container else {
            return;
        };
        let Some(remote) = self.negotiator.remote().cloned() else {
            return;
        };

        self.dial_tasks.retain(|task| !task.is_finished());
        for addr in self.negotiator.take_dial_targets() {
            tracing::debug!(session = %self.id, peer = %remote, %addr, "dialing candidate");
            let container = Arc::clone(container);
            let tx = self.inputs.clone();
            let local = self.id.clone();
            let remote = remote.clone();
            let timeout = self.config.dial_timeout;
            let epoch = self.epoch;
            self.dial_tasks.push(tokio::spawn(async move {
                let result = container.dial(addr, local, remote, timeout).await;
                let _ = tx.send(Input::Dialed {
                    epoch,
                    addr,
                    result,
                });
            }));
        }
    }

    fn on_dialed(&mut self, epoch: u64, addr: SocketAddr, result: Result<DirectChannel, TransportError>) {
        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                if epoch == self.epoch {
                    tracing::debug!(session = %self.id, %addr, error = %e, "dial failed");
                }
                return;
            }
        };
        if epoch != self.epoch || self.state() != SessionState::Negotiating || self.channel.is_some() {
            channel.close();
            return;
        }
        self.bind_channel(channel);
    }

    fn on_incoming(&mut self, epoch: u64, channel: DirectChannel, session: SessionId, target: &SessionId) {
        if epoch != self.epoch || self.state() != SessionState::Negotiating || self.channel.is_some() {
            channel.close();
            return;
        }
        if self.negotiator.accepts_hello(&session, target) {
            self.bind_channel(channel);
        } else if *target == self.id && self.negotiator.role().is_none() {
            tracing::debug!(session = %self.id, peer = %session, "holding early incoming channel");
            self.pending_incoming.push((channel, session));
        } else {
            tracing::debug!(session = %self.id, peer = %session, "refusing incoming channel");
            channel.close();
        }
    }

    /// Binds a held incoming channel once the answer that pairs it arrives.
    fn recheck_incoming(&mut self) {
        if self.pending_incoming.is_empty() || self.negotiator.role().is_none() {
            return;
        }
        for (channel, session) in mem::take(&mut self.pending_incoming) {
            if self.channel.is_none()
                && self.state() == SessionState::Negotiating
                && self.negotiator.accepts_hello(&session, &self.id)
            {
                self.bind_channel(channel);
            } else {
                channel.close();
            }
        }
    }

    fn bind_channel(&mut self, channel: DirectChannel) {
        let remote = channel.remote_address();
        let (writer, reader, closer) = channel.split();
        let (outbound, frames) = mpsc::channel(self.config.channel_capacity);
        let peer = self
            .negotiator
            .remote()
            .map_or_else(String::new, ToString::to_string);

        let writer = tokio::spawn(write_loop(writer, frames, self.epoch, self.inputs.clone()));
        let reader = tokio::spawn(read_loop(
            reader,
            peer,
            self.epoch,
            self.events.clone(),
            self.inputs.clone(),
        ));
        self.channel = Some(BoundChannel {
            outbound: outbound.clone(),
            writer,
            reader,
            closer,
        });

        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        for task in self.dial_tasks.drain(..) {
            task.abort();
        }
        for (pending, _) in self.pending_incoming.drain(..) {
            pending.close();
        }

        self.link.send_modify(|link| link.outbound = Some(outbound));
        tracing::info!(session = %self.id, %remote, "direct channel open");
        self.transition(SessionState::Connected);
    }

    async fn on_channel_closed(&mut self) {
        if self.state() == SessionState::Connected {
            tracing::info!(session = %self.id, "direct channel closed by peer");
            self.close().await;
        }
    }

    /// Frames queued behind the failed one are lost with the stream, so the
    /// session cannot carry on.
    async fn on_channel_write_failed(&mut self, error: TransportError) {
        if self.state() != SessionState::Connected {
            return;
        }
        if matches!(error, TransportError::ConnectionClosed) {
            tracing::info!(session = %self.id, "direct channel closed while writing");
        } else {
            tracing::warn!(session = %self.id, error = %error, "direct channel write failed");
            self.events.publish(SessionEvent::ChannelError {
                reason: error.to_string(),
            });
        }
        self.close().await;
    }
}

/// Writes queued frames until `Bye` or the queue closes. A write error is
/// reported to the session task, which tears the channel down.
async fn write_loop(
    mut writer: FrameWriter,
    mut frames: mpsc::Receiver<ChannelFrame>,
    epoch: u64,
    inputs: mpsc::UnboundedSender<Input>,
) {
    while let Some(frame) = frames.recv().await {
        let bye = frame == ChannelFrame::Bye;
        if let Err(error) = writer.write_frame(&frame).await {
            tracing::debug!(error = %error, "direct channel writer stopped");
            let _ = inputs.send(Input::ChannelWriteFailed { epoch, error });
            return;
        }
        if bye {
            break;
        }
    }
    writer.finish();
}

/// Reads channel frames and publishes them until the channel ends.
async fn read_loop(
    mut reader: FrameReader,
    peer: String,
    epoch: u64,
    events: EventBus,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let mut transfers = InboundTransfers::new();
    loop {
        let frame = match reader.read_frame().await {
            Ok(frame) => frame,
            Err(TransportError::ConnectionClosed) => break,
            Err(e) => {
                tracing::warn!(error = %e, "direct channel read failed");
                break;
            }
        };
        match frame {
            ChannelFrame::Text(text) => events.publish(SessionEvent::Message {
                from: peer.clone(),
                payload: Payload::Text(text),
            }),
            ChannelFrame::Binary(bytes) => events.publish(SessionEvent::Message {
                from: peer.clone(),
                payload: Payload::Binary(bytes),
            }),
            ChannelFrame::FileMeta { name, size } => {
                tracing::debug!(name = %name, size, "inbound file started");
                for update in transfers.on_meta(name, size) {
                    publish_transfer(&events, update);
                }
            }
            ChannelFrame::FileChunk(chunk) => publish_transfer(&events, transfers.on_chunk(&chunk)),
            ChannelFrame::FileEnd => publish_transfer(&events, transfers.on_end()),
            ChannelFrame::Media { kind, data } => {
                events.publish(SessionEvent::MediaFrame { kind, data });
            }
            ChannelFrame::TrackEnded { kind } => {
                let _ = inputs.send(Input::RemoteTrackEnded { epoch, kind });
            }
            ChannelFrame::Bye => {
                tracing::debug!(peer = %peer, "peer said goodbye");
                break;
            }
            ChannelFrame::Hello { .. } => {
                tracing::warn!(peer = %peer, "unexpected hello on open channel");
            }
        }
    }
    if let Some(update) = transfers.on_close() {
        publish_transfer(&events, update);
    }
    let _ = inputs.send(Input::ChannelClosed { epoch });
}

fn publish_transfer(events: &EventBus, update: InboundUpdate) {
    match update.into_event() {
        Some(event) => events.publish(event),
        None => tracing::debug!("dropping file frame with no active transfer"),
    }
}
