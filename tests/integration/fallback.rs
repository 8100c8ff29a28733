//! Internet fallback: the router hands traffic to the relay transport
//! when no mesh path exists, including the handshake itself.

use crate::*;
use gapmesh_node::controller::AppEvent;

/// No radio at all: the handshake and the message both travel over the
/// relay transport, and the queued message arrives exactly once.
#[tokio::test(flavor = "multi_thread")]
async fn private_message_over_relays_only() {
    init_tracing();
    let registry = new_relay_registry();
    let clock = wall_clock();
    let mut a = spawn_internet_node(&registry, clock.clone()).await;
    let mut b = spawn_internet_node(&registry, clock).await;

    let b_id = b.peer_id;
    a.controller.send_private("hi", b_id).await.unwrap();

    // The first send has no session: it queues and starts a handshake
    // over the relays.
    let received = wait_for(&mut b.app, 10, "relayed message", |e| {
        matches!(e, AppEvent::MessageReceived { private: true, .. })
    })
    .await;
    match received {
        AppEvent::MessageReceived { from, text, via, .. } => {
            assert_eq!(from, a.peer_id);
            assert_eq!(text, "hi");
            assert_eq!(via, gapmesh_transport::TransportKind::Internet);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Handshake completion is visible on both sides.
    wait_for(&mut a.app, 10, "handshake complete on a", |e| {
        matches!(e, AppEvent::NoiseHandshakeComplete { peer, .. } if *peer == b_id)
    })
    .await;

    let extras = drain_for(&mut b.app, 1000).await;
    assert!(
        !extras
            .iter()
            .any(|e| matches!(e, AppEvent::MessageReceived { private: true, .. })),
        "message delivered twice over relays"
    );
}

/// Delivery acks flow back over the relay path too.
#[tokio::test(flavor = "multi_thread")]
async fn delivery_ack_over_relays() {
    init_tracing();
    let registry = new_relay_registry();
    let clock = wall_clock();
    let mut a = spawn_internet_node(&registry, clock.clone()).await;
    let mut b = spawn_internet_node(&registry, clock).await;

    let b_id = b.peer_id;
    let message_id = a.controller.send_private("ack me", b_id).await.unwrap();

    wait_for(&mut b.app, 10, "message on b", |e| {
        matches!(e, AppEvent::MessageReceived { private: true, .. })
    })
    .await;
    wait_for(&mut a.app, 10, "delivery ack on a", |e| {
        matches!(e, AppEvent::DeliveryAck { message_id: id, .. } if *id == message_id)
    })
    .await;
}

/// When the relay transport reports the peer unreachable, sends queue
/// instead of erroring, and stay queued.
#[tokio::test(flavor = "multi_thread")]
async fn unreachable_peer_queues() {
    init_tracing();
    let registry = new_relay_registry();
    let clock = wall_clock();
    let a = spawn_internet_node(&registry, clock.clone()).await;

    // Nobody else registered: the peer does not exist on any transport.
    let ghost = gapmesh_core::wire::PeerId([0x99; 8]);
    a.controller.send_private("anyone there?", ghost).await.unwrap();
    assert_eq!(a.router.outbox_pending(ghost), 1);

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert_eq!(a.router.outbox_pending(ghost), 1, "entry must survive");
}
