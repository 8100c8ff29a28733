//! Private messaging between two nodes in radio range.

use crate::*;
use gapmesh_node::controller::AppEvent;

/// Two devices in range: handshake completes, a private "hello" arrives
/// exactly once, and the sender sees a delivery ack.
#[tokio::test(flavor = "multi_thread")]
async fn private_message_with_delivery_ack() {
    init_tracing();
    let bus = LoopbackBus::new();
    let clock = wall_clock();
    let mut a = spawn_mesh_node(&bus, "dev-a", "alice", clock.clone()).await;
    let mut b = spawn_mesh_node(&bus, "dev-b", "bob", clock).await;
    bus.link("dev-a", "dev-b");

    // Announce exchange surfaces both peers.
    wait_for(&mut a.app, 10, "peer b to appear", |e| {
        matches!(e, AppEvent::PeerAppeared { nickname, .. } if nickname == "bob")
    })
    .await;
    wait_for(&mut b.app, 10, "peer a to appear", |e| {
        matches!(e, AppEvent::PeerAppeared { nickname, .. } if nickname == "alice")
    })
    .await;

    // The mesh runs the handshake on its own; both sides converge.
    let b_id = b.peer_id;
    wait_for(&mut a.app, 10, "handshake with b", |e| {
        matches!(e, AppEvent::NoiseHandshakeComplete { peer, .. } if *peer == b_id)
    })
    .await;

    let message_id = a.controller.send_private("hello", b_id).await.unwrap();

    let received = wait_for(&mut b.app, 10, "message on b", |e| {
        matches!(e, AppEvent::MessageReceived { private: true, .. })
    })
    .await;
    match received {
        AppEvent::MessageReceived { from, text, .. } => {
            assert_eq!(from, a.peer_id);
            assert_eq!(text, "hello");
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Delivery ack comes back for that exact message.
    wait_for(&mut a.app, 10, "delivery ack", |e| {
        matches!(e, AppEvent::DeliveryAck { message_id: id, .. } if *id == message_id)
    })
    .await;

    // Exactly one receive event on B.
    let extras = drain_for(&mut b.app, 1500).await;
    assert!(
        !extras
            .iter()
            .any(|e| matches!(e, AppEvent::MessageReceived { private: true, .. })),
        "duplicate private message delivered: {extras:?}"
    );
}

/// A message sent before any transport can reach the peer waits in the
/// outbox and flushes when the peer appears.
#[tokio::test(flavor = "multi_thread")]
async fn queued_message_flushes_on_reachability() {
    init_tracing();
    let bus = LoopbackBus::new();
    let clock = wall_clock();
    let mut a = spawn_mesh_node(&bus, "dev-a", "alice", clock.clone()).await;
    let mut b = spawn_mesh_node(&bus, "dev-b", "bob", clock).await;

    // Not linked yet: the send must queue.
    let b_id = b.peer_id;
    a.controller.send_private("waiting for you", b_id).await.unwrap();
    assert_eq!(a.router.outbox_pending(b_id), 1);

    bus.link("dev-a", "dev-b");

    let received = wait_for(&mut b.app, 15, "queued message on b", |e| {
        matches!(e, AppEvent::MessageReceived { private: true, .. })
    })
    .await;
    match received {
        AppEvent::MessageReceived { text, .. } => assert_eq!(text, "waiting for you"),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(a.router.outbox_pending(b_id), 0);

    // Delivered exactly once: the queue is empty and stays empty.
    let extras = drain_for(&mut b.app, 1500).await;
    assert!(
        !extras
            .iter()
            .any(|e| matches!(e, AppEvent::MessageReceived { private: true, .. })),
        "queued message delivered twice"
    );
}

/// Read acks travel back like delivery acks, best effort.
#[tokio::test(flavor = "multi_thread")]
async fn read_ack_round_trip() {
    init_tracing();
    let bus = LoopbackBus::new();
    let clock = wall_clock();
    let mut a = spawn_mesh_node(&bus, "dev-a", "alice", clock.clone()).await;
    let mut b = spawn_mesh_node(&bus, "dev-b", "bob", clock).await;
    bus.link("dev-a", "dev-b");

    let b_id = b.peer_id;
    let a_id = a.peer_id;
    wait_for(&mut a.app, 10, "handshake", |e| {
        matches!(e, AppEvent::NoiseHandshakeComplete { peer, .. } if *peer == b_id)
    })
    .await;

    let message_id = a.controller.send_private("read me", b_id).await.unwrap();
    wait_for(&mut b.app, 10, "message on b", |e| {
        matches!(e, AppEvent::MessageReceived { private: true, .. })
    })
    .await;

    b.controller.send_read_ack(a_id, message_id.clone()).await;
    wait_for(&mut a.app, 10, "read ack", |e| {
        matches!(e, AppEvent::ReadAck { message_id: id, .. } if *id == message_id)
    })
    .await;
}
