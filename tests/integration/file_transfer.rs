//! Integration tests for chunked file transfer over the direct channel.
//!
//! Verification command: `cargo test --test file_transfer`

use std::time::Duration;

use lanlink::events::{EventKind, SessionEvent, Subscription};
use lanlink::session::negotiation::{Negotiator, Step};
use lanlink::session::{Session, SessionConfig, SessionError, SessionState};
use lanlink::signaling::SignalingClient;
use lanlink::transfer::{chunk_count, TransferError};
use lanlink::transport::quic::{ChannelContainer, DirectChannel};
use lanlink_proto::channel::{ChannelFrame, DEFAULT_MAX_FRAME_SIZE};
use lanlink_proto::signal::{SessionId, SignalMessage};
use lanlink_relay::relay::start_server;
use tokio::sync::mpsc;

const STEP_TIMEOUT: Duration = Duration::from_secs(15);
const CHUNK: usize = 1024;

// =============================================================================
// Helpers
// =============================================================================

async fn start_relay() -> String {
    let (addr, _handle) = start_server("127.0.0.1:0")
        .await
        .expect("failed to start test relay");
    format!("ws://{addr}/ws")
}

fn session(url: &str, id: &str) -> Session {
    let mut config = SessionConfig::new(url);
    config.session_id = Some(SessionId::new(id));
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.chunk_size = CHUNK;
    Session::new(config).unwrap()
}

async fn wait_state(session: &Session, state: SessionState) {
    tokio::time::timeout(STEP_TIMEOUT, session.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("{} never reached {state}", session.id()))
        .unwrap();
}

async fn connected_pair() -> (Session, Session) {
    let url = start_relay().await;
    let sender = session(&url, "sender");
    let receiver = session(&url, "receiver");
    sender.connect("files").await.unwrap();
    receiver.connect("files").await.unwrap();
    for session in [&sender, &receiver] {
        wait_state(session, SessionState::Connected).await;
    }
    (sender, receiver)
}

/// Sending peer driven frame by frame instead of through a [`Session`].
struct ManualSender {
    channel: DirectChannel,
    _container: ChannelContainer,
    _relay: SignalingClient,
}

async fn next_signal(signals: &mut mpsc::UnboundedReceiver<SignalMessage>) -> SignalMessage {
    tokio::time::timeout(STEP_TIMEOUT, signals.recv())
        .await
        .expect("timed out waiting for a relay message")
        .expect("relay connection closed")
}

/// Joins `room` ahead of `receiver`, answers its offer and dials it.
async fn manual_sender_for(receiver: &Session, url: &str, room: &str) -> ManualSender {
    let (relay, mut signals) = SignalingClient::connect(url, STEP_TIMEOUT).await.unwrap();
    relay
        .send(&SignalMessage::Join {
            room: room.to_string(),
        })
        .unwrap();
    while !matches!(next_signal(&mut signals).await, SignalMessage::Joined { .. }) {}

    let container = ChannelContainer::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_MAX_FRAME_SIZE)
        .await
        .unwrap();
    // Sorts after "receiver", so this side loses the offer collision and answers.
    let mut negotiator = Negotiator::new(SessionId::new("zz-sender"));
    negotiator.set_local_candidates(container.candidates().to_vec());
    relay.send(&negotiator.create_offer().unwrap()).unwrap();

    receiver.connect(room).await.unwrap();
    loop {
        match next_signal(&mut signals).await {
            SignalMessage::Sdp { sdp, .. } => {
                for step in negotiator.on_description(&sdp).unwrap() {
                    if let Step::Send(answer) = step {
                        relay.send(&answer).unwrap();
                        for candidate in negotiator.candidate_messages().unwrap() {
                            relay.send(&candidate).unwrap();
                        }
                    }
                }
            }
            SignalMessage::Ice { candidate, .. } => {
                negotiator.on_candidate(&candidate);
            }
            _ => {}
        }

        let Some(remote) = negotiator.remote().cloned() else {
            continue;
        };
        for addr in negotiator.take_dial_targets() {
            let local = negotiator.local().clone();
            if let Ok(channel) = container.dial(addr, local, remote.clone(), STEP_TIMEOUT).await {
                return ManualSender {
                    channel,
                    _container: container,
                    _relay: relay,
                };
            }
        }
    }
}

async fn next_event(sub: &mut Subscription) -> SessionEvent {
    tokio::time::timeout(STEP_TIMEOUT, sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
}

/// Collects transfer events until a file completes or fails.
async fn collect_transfer(sub: &mut Subscription) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(sub).await;
        let done = matches!(
            event,
            SessionEvent::FileReceived(_) | SessionEvent::TransferFailed { .. }
        );
        events.push(event);
        if done {
            return events;
        }
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_chunk_file_arrives_intact() {
    let (sender, receiver) = connected_pair().await;
    let mut inbound = receiver.events().subscribe(&[EventKind::Transfer]);
    let mut outbound = sender.events().subscribe(&[EventKind::Transfer]);
    let data = sample(10 * CHUNK + 17);

    sender.send_file("report.bin", &data).await.unwrap();

    let events = collect_transfer(&mut inbound).await;
    assert_eq!(
        events[0],
        SessionEvent::TransferStarted {
            name: "report.bin".to_string(),
            size: data.len() as u64,
        }
    );
    let progress: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::TransferProgress { received, .. } => Some(*received),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), chunk_count(data.len(), CHUNK));
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(progress.last().copied(), Some(data.len() as u64));

    match events.last() {
        Some(SessionEvent::FileReceived(file)) => {
            assert_eq!(file.name, "report.bin");
            assert!(file.completed);
            assert_eq!(file.received, file.declared_size);
            assert_eq!(file.data, data);
        }
        other => panic!("expected completed file, got {other:?}"),
    }

    assert_eq!(
        next_event(&mut outbound).await,
        SessionEvent::FileSent {
            name: "report.bin".to_string(),
            size: data.len() as u64,
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_file_completes() {
    let (sender, receiver) = connected_pair().await;
    let mut inbound = receiver.events().subscribe(&[EventKind::Transfer]);

    sender.send_file("empty.txt", &[]).await.unwrap();

    let events = collect_transfer(&mut inbound).await;
    assert_eq!(events.len(), 2);
    match &events[1] {
        SessionEvent::FileReceived(file) => {
            assert_eq!(file.name, "empty.txt");
            assert!(file.data.is_empty());
            assert!(file.completed);
        }
        other => panic!("expected completed file, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn back_to_back_files_stay_separate() {
    let (sender, receiver) = connected_pair().await;
    let mut inbound = receiver.events().subscribe(&[EventKind::Transfer]);
    let first = sample(3 * CHUNK);
    let second = b"second file".to_vec();

    sender.send_file("one.bin", &first).await.unwrap();
    sender.send_file("two.txt", &second).await.unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        if let SessionEvent::FileReceived(file) = next_event(&mut inbound).await {
            received.push(file);
        }
    }
    assert_eq!(received[0].name, "one.bin");
    assert_eq!(received[0].data, first);
    assert_eq!(received[1].name, "two.txt");
    assert_eq!(received[1].data, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_sends_do_not_interleave() {
    let (sender, receiver) = connected_pair().await;
    let mut inbound = receiver.events().subscribe(&[EventKind::Transfer]);
    let a = vec![b'a'; 4 * CHUNK];
    let b = vec![b'b'; 4 * CHUNK];

    let (ra, rb) = tokio::join!(sender.send_file("a.bin", &a), sender.send_file("b.bin", &b));
    ra.unwrap();
    rb.unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        match next_event(&mut inbound).await {
            SessionEvent::FileReceived(file) => received.push(file),
            SessionEvent::TransferFailed { name, error } => panic!("{name} failed: {error}"),
            _ => {}
        }
    }
    for file in received {
        let expected = if file.name == "a.bin" { &a } else { &b };
        assert_eq!(&file.data, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_path_is_streamed_under_its_file_name() {
    let (sender, receiver) = connected_pair().await;
    let mut inbound = receiver.events().subscribe(&[EventKind::Transfer]);

    let dir = std::env::temp_dir().join(format!("lanlink-ft-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("notes.md");
    let data = sample(5 * CHUNK + 3);
    std::fs::write(&path, &data).unwrap();

    sender.send_file_path(&path).await.unwrap();

    let events = collect_transfer(&mut inbound).await;
    match events.last() {
        Some(SessionEvent::FileReceived(file)) => {
            assert_eq!(file.name, "notes.md");
            assert_eq!(file.data, data);
        }
        other => panic!("expected completed file, got {other:?}"),
    }

    let missing = dir.join("missing.md");
    assert!(matches!(
        sender.send_file_path(&missing).await,
        Err(SessionError::ReadFile { .. })
    ));
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_sent_after_a_file_arrive_after_it() {
    let (sender, receiver) = connected_pair().await;
    let mut inbound = receiver
        .events()
        .subscribe(&[EventKind::Transfer, EventKind::Message]);

    sender.send_file("first.bin", &sample(2 * CHUNK)).await.unwrap();
    sender.send_text("after the file").await.unwrap();

    let mut saw_file = false;
    loop {
        match next_event(&mut inbound).await {
            SessionEvent::FileReceived(_) => saw_file = true,
            SessionEvent::Message { .. } => {
                assert!(saw_file, "message overtook the file");
                break;
            }
            _ => {}
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channel_closing_mid_file_fails_the_transfer() {
    let url = start_relay().await;
    let receiver = session(&url, "receiver");
    let mut inbound = receiver.events().subscribe(&[EventKind::Transfer]);
    let ManualSender {
        channel,
        _container,
        _relay,
    } = manual_sender_for(&receiver, &url, "files").await;
    wait_state(&receiver, SessionState::Connected).await;

    let declared = 4 * CHUNK as u64;
    let (mut writer, _reader, _closer) = channel.split();
    writer
        .write_frame(&ChannelFrame::FileMeta {
            name: "partial.bin".to_string(),
            size: declared,
        })
        .await
        .unwrap();
    for chunk in sample(2 * CHUNK).chunks(CHUNK) {
        writer
            .write_frame(&ChannelFrame::FileChunk(chunk.to_vec()))
            .await
            .unwrap();
    }

    // End the stream only once both chunks have landed.
    let mut events = Vec::new();
    loop {
        let event = next_event(&mut inbound).await;
        let landed = matches!(
            event,
            SessionEvent::TransferProgress { received, .. } if received == 2 * CHUNK as u64
        );
        events.push(event);
        if landed {
            break;
        }
    }
    writer.finish();
    events.extend(collect_transfer(&mut inbound).await);

    assert_eq!(
        events[0],
        SessionEvent::TransferStarted {
            name: "partial.bin".to_string(),
            size: declared,
        }
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::FileReceived(_))));
    match events.last() {
        Some(SessionEvent::TransferFailed { name, error }) => {
            assert_eq!(name, "partial.bin");
            assert_eq!(
                *error,
                TransferError::Interrupted {
                    declared,
                    received: 2 * CHUNK as u64,
                }
            );
            assert!(error.received() < error.declared());
        }
        other => panic!("expected interrupted transfer, got {other:?}"),
    }

    wait_state(&receiver, SessionState::Idle).await;
}
