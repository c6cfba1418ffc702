//! Integration tests for the session lifecycle over a live relay.
//!
//! Two sessions join one room, negotiate a direct channel on loopback and
//! exchange messages. Covers simultaneous and late joins, teardown from
//! every state, losing the relay, oversized messages and a third member
//! that never pairs.
//!
//! Verification command: `cargo test --test session_lifecycle`

use std::net::SocketAddr;
use std::time::Duration;

use lanlink::events::{EventKind, SessionEvent, Subscription};
use lanlink::session::{Session, SessionConfig, SessionError, SessionState};
use lanlink::transport::{LinkType, Payload, PeerLink, TransportError};
use lanlink_proto::channel::{CodecError, DEFAULT_MAX_FRAME_SIZE};
use lanlink_proto::signal::SessionId;
use lanlink_relay::relay::start_server;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

// =============================================================================
// Helpers
// =============================================================================

const STEP_TIMEOUT: Duration = Duration::from_secs(15);

async fn start_relay() -> String {
    let (addr, _handle) = start_server("127.0.0.1:0")
        .await
        .expect("failed to start test relay");
    format!("ws://{addr}/ws")
}

/// A relay reached through a TCP forwarder that can be cut on demand.
struct SeveredRelay {
    direct_url: String,
    forwarded_url: String,
    forwarder: JoinHandle<()>,
}

impl SeveredRelay {
    async fn start() -> Self {
        let (relay_addr, _handle) = start_server("127.0.0.1:0")
            .await
            .expect("failed to start test relay");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front: SocketAddr = listener.local_addr().unwrap();

        // Dropping the JoinSet aborts every forwarded connection with it.
        let forwarder = tokio::spawn(async move {
            let mut links = JoinSet::new();
            while let Ok((mut inbound, _)) = listener.accept().await {
                links.spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(relay_addr).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
            }
        });

        Self {
            direct_url: format!("ws://{relay_addr}/ws"),
            forwarded_url: format!("ws://{front}/ws"),
            forwarder,
        }
    }

    /// Drops every connection made through the forwarder.
    async fn cut(self) {
        self.forwarder.abort();
        let _ = self.forwarder.await;
    }
}

fn config(url: &str, id: &str) -> SessionConfig {
    let mut config = SessionConfig::new(url);
    config.session_id = Some(SessionId::new(id));
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config
}

async fn wait_state(session: &Session, state: SessionState) {
    tokio::time::timeout(STEP_TIMEOUT, session.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("{} never reached {state}, stuck in {}", session.id(), session.state()))
        .unwrap();
}

/// Waits for the first event matching `pred`, skipping others.
async fn next_event(sub: &mut Subscription, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            let event = sub.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn connected_pair(url: &str, a: &str, b: &str) -> (Session, Session) {
    let alice = Session::new(config(url, a)).unwrap();
    let bob = Session::new(config(url, b)).unwrap();
    alice.connect("room").await.unwrap();
    bob.connect("room").await.unwrap();
    wait_state(&alice, SessionState::Connected).await;
    wait_state(&bob, SessionState::Connected).await;
    (alice, bob)
}

fn text_from(event: &SessionEvent) -> Option<(&str, &str)> {
    match event {
        SessionEvent::Message {
            from,
            payload: Payload::Text(text),
        } => Some((from.as_str(), text.as_str())),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_sessions_connect_and_exchange_messages() {
    let url = start_relay().await;
    let alice = Session::new(config(&url, "alice")).unwrap();
    let bob = Session::new(config(&url, "bob")).unwrap();
    let mut alice_states = alice.events().subscribe(&[EventKind::State]);
    let mut bob_msgs = bob.events().subscribe(&[EventKind::Message]);
    let mut alice_msgs = alice.events().subscribe(&[EventKind::Message]);

    alice.connect("room").await.unwrap();
    bob.connect("room").await.unwrap();
    wait_state(&alice, SessionState::Connected).await;
    wait_state(&bob, SessionState::Connected).await;

    assert_eq!(alice.remote(), Some(SessionId::new("bob")));
    assert_eq!(bob.remote(), Some(SessionId::new("alice")));

    let mut seen = Vec::new();
    for _ in 0..3 {
        if let SessionEvent::StateChanged { to, .. } = next_event(&mut alice_states, |_| true).await {
            seen.push(to);
        }
    }
    assert_eq!(
        seen,
        vec![
            SessionState::Joining,
            SessionState::Negotiating,
            SessionState::Connected
        ]
    );

    alice.send_text("Hello World").await.unwrap();
    let event = next_event(&mut bob_msgs, |e| text_from(e).is_some()).await;
    assert_eq!(text_from(&event), Some(("alice", "Hello World")));

    bob.send(Payload::Binary(vec![0, 1, 2])).await.unwrap();
    let event = next_event(&mut alice_msgs, |_| true).await;
    assert_eq!(
        event,
        SessionEvent::Message {
            from: "bob".to_string(),
            payload: Payload::Binary(vec![0, 1, 2]),
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_arrive_in_send_order() {
    let url = start_relay().await;
    let (alice, bob) = connected_pair(&url, "alice", "bob").await;
    let mut inbox = bob.events().subscribe(&[EventKind::Message]);

    for i in 0..50 {
        alice.send_text(&format!("msg-{i}")).await.unwrap();
    }
    for i in 0..50 {
        let event = next_event(&mut inbox, |_| true).await;
        assert_eq!(text_from(&event).map(|(_, t)| t.to_string()), Some(format!("msg-{i}")));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simultaneous_joins_converge_whatever_the_id_order() {
    let url = start_relay().await;
    for (a, b) in [("aaa", "zzz"), ("zzz", "aaa")] {
        let first = Session::new(config(&url, a)).unwrap();
        let second = Session::new(config(&url, b)).unwrap();
        let room = format!("glare-{a}");
        let (r1, r2) = tokio::join!(first.connect(&room), second.connect(&room));
        r1.unwrap();
        r2.unwrap();
        wait_state(&first, SessionState::Connected).await;
        wait_state(&second, SessionState::Connected).await;

        let mut inbox = second.events().subscribe(&[EventKind::Message]);
        first.send_text("after glare").await.unwrap();
        let event = next_event(&mut inbox, |_| true).await;
        assert_eq!(text_from(&event), Some((a, "after glare")));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_still_connects() {
    let url = start_relay().await;
    let early = Session::new(config(&url, "early")).unwrap();
    early.connect("room").await.unwrap();
    wait_state(&early, SessionState::Negotiating).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(early.state(), SessionState::Negotiating);

    let late = Session::new(config(&url, "late")).unwrap();
    late.connect("room").await.unwrap();
    wait_state(&early, SessionState::Connected).await;
    wait_state(&late, SessionState::Connected).await;
    assert_eq!(late.remote(), Some(SessionId::new("early")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_before_connected_is_rejected() {
    let url = start_relay().await;
    let lonely = Session::new(config(&url, "lonely")).unwrap();
    assert!(matches!(
        lonely.send_text("anyone?").await,
        Err(SessionError::NotConnected(SessionState::Idle))
    ));

    lonely.connect("room").await.unwrap();
    wait_state(&lonely, SessionState::Negotiating).await;
    assert!(matches!(
        lonely.send_text("anyone?").await,
        Err(SessionError::NotConnected(SessionState::Negotiating))
    ));
    assert!(matches!(
        lonely.send_file("a.txt", b"abc").await,
        Err(SessionError::NotConnected(SessionState::Negotiating))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_while_active_is_rejected() {
    let url = start_relay().await;
    let session = Session::new(config(&url, "busy")).unwrap();
    session.connect("room").await.unwrap();
    assert!(matches!(
        session.connect("room").await,
        Err(SessionError::AlreadyActive(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_while_negotiating_returns_to_idle() {
    let url = start_relay().await;
    let session = Session::new(config(&url, "solo")).unwrap();
    let mut states = session.events().subscribe(&[EventKind::State]);
    session.connect("room").await.unwrap();
    wait_state(&session, SessionState::Negotiating).await;

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);

    let mut seen = Vec::new();
    while let Some(SessionEvent::StateChanged { to, .. }) = states.try_recv() {
        seen.push(to);
    }
    assert_eq!(seen.last(), Some(&SessionState::Idle));
    assert!(seen.contains(&SessionState::Closed));

    session.connect("room").await.unwrap();
    wait_state(&session, SessionState::Negotiating).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_right_after_connect_call_is_clean() {
    let url = start_relay().await;
    let session = Session::new(config(&url, "quick")).unwrap();
    session.connect("room").await.unwrap();
    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_disconnect_closes_the_other_side() {
    let url = start_relay().await;
    let (alice, bob) = connected_pair(&url, "alice", "bob").await;
    let mut bob_states = bob.events().subscribe(&[EventKind::State]);

    alice.disconnect().await.unwrap();
    assert_eq!(alice.state(), SessionState::Idle);

    next_event(&mut bob_states, |e| {
        matches!(e, SessionEvent::StateChanged { to: SessionState::Closed, .. })
    })
    .await;
    wait_state(&bob, SessionState::Idle).await;
    assert!(matches!(
        bob.send_text("gone?").await,
        Err(SessionError::NotConnected(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_reconnect_after_disconnect() {
    let url = start_relay().await;
    let (alice, bob) = connected_pair(&url, "alice", "bob").await;
    alice.disconnect().await.unwrap();
    wait_state(&bob, SessionState::Idle).await;

    alice.connect("room").await.unwrap();
    bob.connect("room").await.unwrap();
    wait_state(&alice, SessionState::Connected).await;
    wait_state(&bob, SessionState::Connected).await;

    let mut inbox = alice.events().subscribe(&[EventKind::Message]);
    bob.send_text("welcome back").await.unwrap();
    let event = next_event(&mut inbox, |_| true).await;
    assert_eq!(text_from(&event), Some(("bob", "welcome back")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn third_member_times_out_without_disturbing_the_pair() {
    let url = start_relay().await;
    let (alice, bob) = connected_pair(&url, "alice", "bob").await;

    let mut carol_config = config(&url, "carol");
    carol_config.negotiation_timeout = Some(Duration::from_secs(1));
    let carol = Session::new(carol_config).unwrap();
    let mut carol_errors = carol.events().subscribe(&[EventKind::Error]);
    carol.connect("room").await.unwrap();

    let event = next_event(&mut carol_errors, |_| true).await;
    assert!(matches!(event, SessionEvent::Failed { .. }));
    assert_eq!(carol.state(), SessionState::Failed);

    assert_eq!(alice.state(), SessionState::Connected);
    assert_eq!(bob.state(), SessionState::Connected);
    let mut inbox = bob.events().subscribe(&[EventKind::Message]);
    alice.send_text("still us").await.unwrap();
    let event = next_event(&mut inbox, |_| true).await;
    assert_eq!(text_from(&event), Some(("alice", "still us")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_is_a_direct_peer_link() {
    async fn greet<L: PeerLink>(link: &L) -> Result<(), L::Error> {
        link.send(Payload::from("via trait")).await
    }

    let url = start_relay().await;
    let (alice, bob) = connected_pair(&url, "alice", "bob").await;
    assert_eq!(alice.link_type(), LinkType::Direct);

    let mut inbox = PeerLink::events(&bob).subscribe(&[EventKind::Message]);
    greet(&alice).await.unwrap();
    let event = next_event(&mut inbox, |_| true).await;
    assert_eq!(text_from(&event), Some(("alice", "via trait")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn losing_the_relay_while_negotiating_fails_the_session() {
    let relay = SeveredRelay::start().await;
    let session = Session::new(config(&relay.forwarded_url, "stranded")).unwrap();
    let mut errors = session.events().subscribe(&[EventKind::Error]);
    session.connect("room").await.unwrap();
    wait_state(&session, SessionState::Negotiating).await;

    relay.cut().await;

    let event = next_event(&mut errors, |_| true).await;
    assert!(
        matches!(&event, SessionEvent::Failed { reason } if reason.contains("relay")),
        "unexpected event {event:?}"
    );
    wait_state(&session, SessionState::Failed).await;
    assert!(matches!(
        session.send_text("anyone?").await,
        Err(SessionError::NotConnected(SessionState::Failed))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn losing_the_relay_while_connected_closes_without_failing() {
    let relay = SeveredRelay::start().await;
    let alice = Session::new(config(&relay.forwarded_url, "alice")).unwrap();
    let bob = Session::new(config(&relay.direct_url, "bob")).unwrap();
    alice.connect("room").await.unwrap();
    bob.connect("room").await.unwrap();
    wait_state(&alice, SessionState::Connected).await;
    wait_state(&bob, SessionState::Connected).await;
    let mut states = alice.events().subscribe(&[EventKind::State]);
    let mut errors = alice.events().subscribe(&[EventKind::Error]);

    relay.cut().await;

    next_event(&mut states, |e| {
        matches!(e, SessionEvent::StateChanged { to: SessionState::Closed, .. })
    })
    .await;
    wait_state(&alice, SessionState::Idle).await;

    let mut seen = Vec::new();
    while let Some(SessionEvent::StateChanged { to, .. }) = states.try_recv() {
        seen.push(to);
    }
    assert!(!seen.contains(&SessionState::Failed), "went through {seen:?}");
    assert!(errors.try_recv().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_messages_are_refused_and_the_channel_survives() {
    let url = start_relay().await;
    let (alice, bob) = connected_pair(&url, "alice", "bob").await;
    let mut inbox = bob.events().subscribe(&[EventKind::Message]);

    let result = alice.send(Payload::Binary(vec![0; 2 * DEFAULT_MAX_FRAME_SIZE])).await;
    assert!(
        matches!(
            result,
            Err(SessionError::Transport(TransportError::Codec(CodecError::Oversized { max, .. })))
                if max == DEFAULT_MAX_FRAME_SIZE
        ),
        "unexpected result {result:?}"
    );

    let long_name = "n".repeat(DEFAULT_MAX_FRAME_SIZE);
    assert!(matches!(
        alice.send_file(&long_name, b"abc").await,
        Err(SessionError::Transport(TransportError::Codec(CodecError::Oversized { .. })))
    ));

    assert_eq!(alice.state(), SessionState::Connected);
    assert_eq!(bob.state(), SessionState::Connected);
    alice.send_text("this one fits").await.unwrap();
    let event = next_event(&mut inbox, |_| true).await;
    assert_eq!(text_from(&event), Some(("alice", "this one fits")));
}
