//! Multi-node end-to-end scenarios over the in-memory BLE bus and the
//! fake relay network. Run with `cargo test -p integration`.

mod infra;

mod fallback;
mod fragmentation;
mod mesh;
mod messaging;
mod rotation;
mod wipe;

pub use infra::*;

/// One-time tracing init so RUST_LOG works under the test harness.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
