//! Oversized payloads fragment, relay, and reassemble transparently.

use crate::*;
use gapmesh_node::controller::AppEvent;

fn long_text(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut state = 0x1234_5678u64;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            CHARSET[(state >> 33) as usize % CHARSET.len()] as char
        })
        .collect()
}

/// A 9000-byte private message crosses as at least five fragments (the
/// ciphertext is incompressible, the fragment ceiling is 2048) and
/// surfaces exactly once, byte-identical.
#[tokio::test(flavor = "multi_thread")]
async fn large_private_message_reassembles() {
    init_tracing();
    let bus = LoopbackBus::new();
    let clock = wall_clock();
    let mut a = spawn_mesh_node(&bus, "dev-a", "alice", clock.clone()).await;
    let mut b = spawn_mesh_node(&bus, "dev-b", "bob", clock).await;
    bus.link("dev-a", "dev-b");

    let b_id = b.peer_id;
    wait_for(&mut a.app, 10, "handshake", |e| {
        matches!(e, AppEvent::NoiseHandshakeComplete { peer, .. } if *peer == b_id)
    })
    .await;

    let text = long_text(9000);
    a.controller.send_private(&text, b_id).await.unwrap();

    let received = wait_for(&mut b.app, 20, "large message", |e| {
        matches!(e, AppEvent::MessageReceived { private: true, .. })
    })
    .await;
    match received {
        AppEvent::MessageReceived { text: got, .. } => {
            assert_eq!(got.len(), 9000);
            assert_eq!(got, text);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let extras = drain_for(&mut b.app, 1500).await;
    assert!(
        !extras
            .iter()
            .any(|e| matches!(e, AppEvent::MessageReceived { private: true, .. })),
        "large message surfaced more than once"
    );
}

/// A fragmented message also crosses a relay hop: the middle node
/// forwards fragments it cannot read.
#[tokio::test(flavor = "multi_thread")]
async fn fragments_survive_a_relay_hop() {
    init_tracing();
    let bus = LoopbackBus::new();
    let clock = wall_clock();
    let mut a = spawn_mesh_node(&bus, "dev-a", "alice", clock.clone()).await;
    let _b = spawn_mesh_node(&bus, "dev-b", "bob", clock.clone()).await;
    let mut c = spawn_mesh_node(&bus, "dev-c", "carol", clock).await;

    bus.link("dev-a", "dev-b");
    bus.link("dev-b", "dev-c");

    // A and C are not in range; the handshake and the fragments all ride
    // through B.
    let c_id = c.peer_id;
    wait_for(&mut a.app, 15, "carol visible", |e| {
        matches!(e, AppEvent::PeerAppeared { nickname, .. } if nickname == "carol")
    })
    .await;

    let text = long_text(5000);
    a.controller.send_private(&text, c_id).await.unwrap();

    let received = wait_for(&mut c.app, 20, "relayed large message", |e| {
        matches!(e, AppEvent::MessageReceived { private: true, .. })
    })
    .await;
    match received {
        AppEvent::MessageReceived { from, text: got, .. } => {
            assert_eq!(from, a.peer_id);
            assert_eq!(got, text);
        }
        other => panic!("unexpected event {other:?}"),
    }
}
