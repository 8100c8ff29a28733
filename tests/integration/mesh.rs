//! TTL-bounded flood relay across a line of nodes.

use crate::*;
use gapmesh_node::controller::AppEvent;

/// A—B—C—D in a line (no shortcut links). A public message from A reaches
/// B, C, and D exactly once each, carried only by store-and-forward
/// relay.
#[tokio::test(flavor = "multi_thread")]
async fn three_hop_flood_delivers_once_per_node() {
    init_tracing();
    let bus = LoopbackBus::new();
    let clock = wall_clock();
    let mut a = spawn_mesh_node(&bus, "dev-a", "alice", clock.clone()).await;
    let mut b = spawn_mesh_node(&bus, "dev-b", "bob", clock.clone()).await;
    let mut c = spawn_mesh_node(&bus, "dev-c", "carol", clock.clone()).await;
    let mut d = spawn_mesh_node(&bus, "dev-d", "dave", clock).await;

    bus.link("dev-a", "dev-b");
    bus.link("dev-b", "dev-c");
    bus.link("dev-c", "dev-d");

    // D is three hops from A; once its relayed announce reaches A the
    // whole line is forwarding.
    wait_for(&mut a.app, 15, "dave visible from a", |e| {
        matches!(e, AppEvent::PeerAppeared { nickname, .. } if nickname == "dave")
    })
    .await;

    a.controller.send_public("ping", &[]).await;

    let a_id = a.peer_id;
    for (name, node) in [("b", &mut b), ("c", &mut c), ("d", &mut d)] {
        let event = wait_for(&mut node.app, 15, "public ping", |e| {
            matches!(e, AppEvent::MessageReceived { private: false, text, .. } if text == "ping")
        })
        .await;
        match event {
            AppEvent::MessageReceived { from, .. } => {
                assert_eq!(from, a_id, "wrong sender seen on {name}");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    // Dedup means each node surfaces the flood exactly once.
    for (name, node) in [("b", &mut b), ("c", &mut c), ("d", &mut d)] {
        let extras = drain_for(&mut node.app, 1500).await;
        assert!(
            !extras.iter().any(|e| matches!(
                e,
                AppEvent::MessageReceived { private: false, text, .. } if text == "ping"
            )),
            "{name} saw the flood twice"
        );
    }
}
