//! Integration tests for adding and removing media tracks on a connected
//! session.
//!
//! Verification command: `cargo test --test media_renegotiation`

use std::collections::BTreeSet;
use std::time::Duration;

use lanlink::events::{EventKind, SessionEvent, Subscription};
use lanlink::session::{Session, SessionConfig, SessionError, SessionState};
use lanlink::transport::TransportError;
use lanlink_proto::channel::{CodecError, DEFAULT_MAX_FRAME_SIZE};
use lanlink_proto::signal::{MediaKind, SessionId};
use lanlink_relay::relay::start_server;

const STEP_TIMEOUT: Duration = Duration::from_secs(15);

async fn connected_pair() -> (Session, Session) {
    let (addr, _handle) = start_server("127.0.0.1:0")
        .await
        .expect("failed to start test relay");
    let url = format!("ws://{addr}/ws");

    let make = |id: &str| {
        let mut config = SessionConfig::new(url.clone());
        config.session_id = Some(SessionId::new(id));
        config.bind_addr = "127.0.0.1:0".parse().unwrap();
        Session::new(config).unwrap()
    };
    let alice = make("alice");
    let bob = make("bob");
    alice.connect("call").await.unwrap();
    bob.connect("call").await.unwrap();
    for session in [&alice, &bob] {
        tokio::time::timeout(STEP_TIMEOUT, session.wait_for_state(SessionState::Connected))
            .await
            .expect("session never connected")
            .unwrap();
    }
    (alice, bob)
}

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

async fn negotiated_with(sub: &mut Subscription, kind: MediaKind) -> (u64, BTreeSet<MediaKind>) {
    match next_event(sub, |e| {
        matches!(e, SessionEvent::MediaNegotiated { media, .. } if media.contains(&kind))
    })
    .await
    {
        SessionEvent::MediaNegotiated { revision, media } => (revision, media),
        _ => unreachable!(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn starting_a_track_renegotiates_and_frames_flow() {
    let (alice, bob) = connected_pair().await;
    let mut alice_media = alice.events().subscribe(&[EventKind::Media]);
    let mut bob_media = bob.events().subscribe(&[EventKind::Media]);

    assert!(alice.negotiated_media().is_empty());
    alice.start_media(MediaKind::Audio).await.unwrap();
    next_event(&mut alice_media, |e| {
        *e == SessionEvent::LocalTrackStarted(MediaKind::Audio)
    })
    .await;

    let (revision, media) = negotiated_with(&mut alice_media, MediaKind::Audio).await;
    assert!(revision > 1);
    assert!(media.contains(&MediaKind::Audio));
    assert!(!alice.is_renegotiating());
    assert_eq!(alice.state(), SessionState::Connected);

    next_event(&mut bob_media, |e| *e == SessionEvent::RemoteTrack(MediaKind::Audio)).await;

    alice
        .send_media(MediaKind::Audio, vec![9, 9, 9])
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut bob_media, |e| matches!(e, SessionEvent::MediaFrame { .. })).await,
        SessionEvent::MediaFrame {
            kind: MediaKind::Audio,
            data: vec![9, 9, 9],
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_for_unnegotiated_tracks_are_refused() {
    let (alice, _bob) = connected_pair().await;
    assert!(matches!(
        alice.send_media(MediaKind::Video, vec![1]).await,
        Err(SessionError::TrackNotNegotiated(MediaKind::Video))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_media_frame_is_refused_and_the_track_keeps_flowing() {
    let (alice, bob) = connected_pair().await;
    let mut alice_media = alice.events().subscribe(&[EventKind::Media]);
    let mut bob_media = bob.events().subscribe(&[EventKind::Media]);
    alice.start_media(MediaKind::Video).await.unwrap();
    negotiated_with(&mut alice_media, MediaKind::Video).await;

    assert!(matches!(
        alice
            .send_media(MediaKind::Video, vec![0; DEFAULT_MAX_FRAME_SIZE + 1])
            .await,
        Err(SessionError::Transport(TransportError::Codec(CodecError::Oversized { .. })))
    ));

    alice
        .send_media(MediaKind::Video, vec![4, 2])
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut bob_media, |e| matches!(e, SessionEvent::MediaFrame { .. })).await,
        SessionEvent::MediaFrame {
            kind: MediaKind::Video,
            data: vec![4, 2],
        }
    );
    assert_eq!(alice.state(), SessionState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_keep_flowing_during_renegotiation() {
    let (alice, bob) = connected_pair().await;
    let mut bob_msgs = bob.events().subscribe(&[EventKind::Message]);

    alice.start_media(MediaKind::Video).await.unwrap();
    alice.send_text("mid-renegotiation").await.unwrap();

    let event = next_event(&mut bob_msgs, |_| true).await;
    assert!(matches!(event, SessionEvent::Message { .. }));
    assert_eq!(alice.state(), SessionState::Connected);
    assert_eq!(bob.state(), SessionState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn both_sides_adding_tracks_converge() {
    let (alice, bob) = connected_pair().await;
    let mut alice_media = alice.events().subscribe(&[EventKind::Media]);
    let mut bob_media = bob.events().subscribe(&[EventKind::Media]);

    let (ra, rb) = tokio::join!(
        alice.start_media(MediaKind::Audio),
        bob.start_media(MediaKind::Video)
    );
    ra.unwrap();
    rb.unwrap();

    negotiated_with(&mut alice_media, MediaKind::Audio).await;
    negotiated_with(&mut bob_media, MediaKind::Video).await;

    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            let both = [MediaKind::Audio, MediaKind::Video].into_iter().collect::<BTreeSet<_>>();
            if alice.negotiated_media() == both && bob.negotiated_media() == both {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("negotiated media never converged");

    alice.send_media(MediaKind::Audio, vec![1]).await.unwrap();
    bob.send_media(MediaKind::Video, vec![2]).await.unwrap();
    assert_eq!(
        next_event(&mut bob_media, |e| matches!(e, SessionEvent::MediaFrame { .. })).await,
        SessionEvent::MediaFrame {
            kind: MediaKind::Audio,
            data: vec![1],
        }
    );
    assert_eq!(
        next_event(&mut alice_media, |e| matches!(e, SessionEvent::MediaFrame { .. })).await,
        SessionEvent::MediaFrame {
            kind: MediaKind::Video,
            data: vec![2],
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_a_track_notifies_the_peer() {
    let (alice, bob) = connected_pair().await;
    let mut alice_media = alice.events().subscribe(&[EventKind::Media]);
    let mut bob_media = bob.events().subscribe(&[EventKind::Media]);

    alice.start_media(MediaKind::Audio).await.unwrap();
    negotiated_with(&mut alice_media, MediaKind::Audio).await;
    next_event(&mut bob_media, |e| *e == SessionEvent::RemoteTrack(MediaKind::Audio)).await;

    alice.stop_media(MediaKind::Audio).await.unwrap();
    next_event(&mut alice_media, |e| {
        *e == SessionEvent::LocalTrackStopped(MediaKind::Audio)
    })
    .await;
    next_event(&mut bob_media, |e| {
        *e == SessionEvent::RemoteTrackEnded(MediaKind::Audio)
    })
    .await;

    assert!(matches!(
        alice.send_media(MediaKind::Audio, vec![0]).await,
        Err(SessionError::TrackNotNegotiated(MediaKind::Audio))
    ));
    assert_eq!(alice.state(), SessionState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarting_a_negotiated_track_needs_no_new_offer() {
    let (alice, _bob) = connected_pair().await;
    let mut alice_media = alice.events().subscribe(&[EventKind::Media]);

    alice.start_media(MediaKind::Audio).await.unwrap();
    let (revision, _) = negotiated_with(&mut alice_media, MediaKind::Audio).await;

    alice.stop_media(MediaKind::Audio).await.unwrap();
    alice.start_media(MediaKind::Audio).await.unwrap();
    assert!(!alice.is_renegotiating());
    alice.send_media(MediaKind::Audio, vec![7]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Some(event) = alice_media.try_recv() {
        if let SessionEvent::MediaNegotiated { revision: later, .. } = event {
            panic!("unexpected renegotiation {later} after {revision}");
        }
    }
}
