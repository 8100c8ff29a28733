//! Panic wipe: every secret and every queue, gone at once.

use crate::*;
use gapmesh_core::identity::IdentityStore;
use gapmesh_core::platform::Keychain;
use gapmesh_node::controller::AppEvent;

#[tokio::test(flavor = "multi_thread")]
async fn panic_wipe_destroys_everything_and_rotates_identity() {
    init_tracing();
    let registry = new_relay_registry();
    let clock = wall_clock();
    let mut a = spawn_internet_node(&registry, clock.clone()).await;
    let mut b = spawn_internet_node(&registry, clock).await;

    // Build up state on A: a live session with B, a favorite, and an
    // outbox entry for an unreachable peer.
    let b_id = b.peer_id;
    a.controller.send_private("warm up", b_id).await.unwrap();
    wait_for(&mut b.app, 10, "warm-up message", |e| {
        matches!(e, AppEvent::MessageReceived { private: true, .. })
    })
    .await;
    wait_for(&mut a.app, 10, "session with b", |e| {
        matches!(e, AppEvent::NoiseHandshakeComplete { peer, .. } if *peer == b_id)
    })
    .await;
    a.controller.set_favorite(b_id, true).await.unwrap();

    let ghost = gapmesh_core::wire::PeerId([0x77; 8]);
    a.controller.send_private("never sent", ghost).await.unwrap();
    assert_eq!(a.router.outbox_pending(ghost), 1);
    assert!(a.keychain.get("identity/static").is_some());
    assert!(a.keychain.get("favorites/v1").is_some());

    let old_peer_id = a.peer_id;

    a.controller.panic_wipe();

    // Keychain empty, outbox empty, sessions gone.
    assert!(keychain_is_empty(&a.keychain));
    assert_eq!(a.router.outbox_pending(ghost), 0);
    assert_eq!(a.router.outbox_pending(b_id), 0);

    // Encrypting to B now fails: the session is closed.
    assert!(a.controller.set_favorite(b_id, true).await.is_err());

    // A restart mints a different identity with a different fingerprint.
    let reborn = IdentityStore::open(a.keychain.clone());
    assert_ne!(reborn.peer_id(), old_peer_id);
}
