//! Integration tests for the mesh alternate transport.
//!
//! Uses the in-process [`LoopbackMesh`] pair in place of a platform radio.
//!
//! Verification command: `cargo test --test mesh_bridge`

use std::sync::Arc;
use std::time::Duration;

use lanlink::events::{EventKind, SessionEvent, Subscription};
use lanlink::transport::loopback::LoopbackMesh;
use lanlink::transport::mesh::{MeshBridge, MeshError, MeshLink, MeshPayload};
use lanlink::transport::{LinkType, Payload, PeerLink};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

/// Two enabled radios with a link open in each direction.
async fn linked_pair() -> (
    (Arc<LoopbackMesh>, MeshLink<LoopbackMesh>),
    (Arc<LoopbackMesh>, MeshLink<LoopbackMesh>),
) {
    let (a, b) = LoopbackMesh::create_pair("phone-a", "phone-b");
    let (a, b) = (Arc::new(a), Arc::new(b));
    a.enable().await.unwrap();
    b.enable().await.unwrap();
    let a_link = MeshLink::open(Arc::clone(&a), "phone-b").await.unwrap();
    let b_link = MeshLink::open(Arc::clone(&b), "phone-a").await.unwrap();
    ((a, a_link), (b, b_link))
}

async fn next_event(sub: &mut Subscription) -> SessionEvent {
    tokio::time::timeout(STEP_TIMEOUT, sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
}

/// Sends through the shared link contract, whatever the link type.
async fn say<L: PeerLink>(link: &L, text: &str) -> Result<(), L::Error> {
    link.send(Payload::from(text)).await
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn scan_lists_nearby_radio() {
    let (a, b) = LoopbackMesh::create_pair("phone-a", "phone-b");
    a.enable().await.unwrap();
    b.enable().await.unwrap();

    let devices = a.scan(Duration::from_millis(100)).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "phone-b");
    assert!(devices[0].signal_strength.is_some());
}

#[tokio::test]
async fn open_enables_the_radio_on_demand() {
    let (a, b) = LoopbackMesh::create_pair("phone-a", "phone-b");
    b.enable().await.unwrap();
    let a = Arc::new(a);
    assert!(!a.is_enabled().await);

    let link = MeshLink::open(Arc::clone(&a), "phone-b").await.unwrap();
    assert!(a.is_enabled().await);
    assert_eq!(link.peer(), "phone-b");
    assert_eq!(link.link_type(), LinkType::Mesh);
}

#[tokio::test]
async fn open_fails_for_unreachable_peer() {
    let (a, _b) = LoopbackMesh::create_pair("phone-a", "phone-b");
    let result = MeshLink::open(Arc::new(a), "phone-b").await;
    assert!(matches!(result, Err(MeshError::NotConnected(peer)) if peer == "phone-b"));
}

#[tokio::test]
async fn text_and_binary_cross_the_bridge() {
    let ((_a, a_link), (_b, b_link)) = linked_pair().await;
    let mut inbox = b_link.events().subscribe(&[EventKind::Message]);

    say(&a_link, "over the air").await.unwrap();
    a_link.send(Payload::Binary(vec![1, 2, 3])).await.unwrap();

    assert_eq!(
        next_event(&mut inbox).await,
        SessionEvent::Message {
            from: "phone-a".to_string(),
            payload: Payload::Text("over the air".to_string()),
        }
    );
    assert_eq!(
        next_event(&mut inbox).await,
        SessionEvent::Message {
            from: "phone-a".to_string(),
            payload: Payload::Binary(vec![1, 2, 3]),
        }
    );
}

#[tokio::test]
async fn files_arrive_complete_and_sender_is_notified() {
    let ((_a, a_link), (_b, b_link)) = linked_pair().await;
    let mut inbox = b_link.events().subscribe(&[EventKind::Transfer]);
    let mut outbox = a_link.events().subscribe(&[EventKind::Transfer]);
    let data: Vec<u8> = (0..=255).collect();

    PeerLink::send_file(&a_link, "palette.bin", &data)
        .await
        .unwrap();

    match next_event(&mut inbox).await {
        SessionEvent::FileReceived(file) => {
            assert_eq!(file.name, "palette.bin");
            assert_eq!(file.data, data);
            assert!(file.completed);
        }
        other => panic!("expected file, got {other:?}"),
    }
    assert_eq!(
        next_event(&mut outbox).await,
        SessionEvent::FileSent {
            name: "palette.bin".to_string(),
            size: 256,
        }
    );
}

#[tokio::test]
async fn malformed_payloads_are_dropped_without_closing() {
    let ((a, _a_link), (_b, b_link)) = linked_pair().await;
    let mut inbox = b_link.events().subscribe(&[EventKind::Message]);

    a.send_message(
        "phone-b",
        MeshPayload {
            bytes_base64: Some("not base64!".to_string()),
            ..MeshPayload::default()
        },
    )
    .await
    .unwrap();
    a.send_message("phone-b", MeshPayload::default())
        .await
        .unwrap();
    a.send_message(
        "phone-b",
        MeshPayload {
            text: Some("still listening".to_string()),
            ..MeshPayload::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(
        next_event(&mut inbox).await,
        SessionEvent::Message {
            from: "phone-a".to_string(),
            payload: Payload::Text("still listening".to_string()),
        }
    );
}

#[tokio::test]
async fn close_stops_sending_and_delivery() {
    let ((_a, a_link), (b, b_link)) = linked_pair().await;
    let mut inbox = b_link.events().subscribe(&[EventKind::Message]);

    b_link.close().await.unwrap();
    assert!(matches!(
        b_link.send(Payload::from("bye")).await,
        Err(MeshError::Closed)
    ));

    say(&a_link, "anyone?").await.unwrap();
    let late = tokio::time::timeout(Duration::from_millis(200), inbox.recv()).await;
    assert!(!matches!(late, Ok(Some(_))));

    b.remove_all_listeners();
    assert_eq!(b.listener_count(), 0);
}
