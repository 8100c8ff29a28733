//! Service-UUID rotation interop: devices on opposite sides of a bucket
//! boundary still find each other through the overlap window.

use crate::*;
use gapmesh_core::rotation::BUCKET_MILLIS;
use gapmesh_node::controller::AppEvent;

/// X sits four minutes before the boundary of bucket `b` (inside the
/// overlap window); Y's clock is six minutes ahead, already in bucket
/// `b+1`. Their scan and advertise sets intersect at uuid(b+1), so
/// discovery and messaging work across the boundary.
#[tokio::test(flavor = "multi_thread")]
async fn discovery_across_bucket_boundary() {
    init_tracing();
    let bus = LoopbackBus::new();

    let bucket: u64 = 491_300;
    let boundary = (bucket + 1) * BUCKET_MILLIS;
    let x_clock = TestClock::at(boundary - 4 * 60 * 1000);
    let y_clock = TestClock::at(boundary + 2 * 60 * 1000);

    let mut x = spawn_mesh_node(&bus, "dev-x", "xavier", x_clock).await;
    let mut y = spawn_mesh_node(&bus, "dev-y", "yuki", y_clock).await;
    bus.link("dev-x", "dev-y");

    wait_for(&mut x.app, 15, "yuki visible across boundary", |e| {
        matches!(e, AppEvent::PeerAppeared { nickname, .. } if nickname == "yuki")
    })
    .await;
    wait_for(&mut y.app, 15, "xavier visible across boundary", |e| {
        matches!(e, AppEvent::PeerAppeared { nickname, .. } if nickname == "xavier")
    })
    .await;

    // And traffic flows: a private message survives the skew.
    let y_id = y.peer_id;
    wait_for(&mut x.app, 15, "handshake across boundary", |e| {
        matches!(e, AppEvent::NoiseHandshakeComplete { peer, .. } if *peer == y_id)
    })
    .await;
    x.controller.send_private("minutes apart", y_id).await.unwrap();
    let received = wait_for(&mut y.app, 15, "message across boundary", |e| {
        matches!(e, AppEvent::MessageReceived { private: true, .. })
    })
    .await;
    match received {
        AppEvent::MessageReceived { text, .. } => assert_eq!(text, "minutes apart"),
        other => panic!("unexpected event {other:?}"),
    }
}
