//! gapmesh-node — routing, state, and the application-facing session
//! controller. Everything above the transports and below the UI.

pub mod commands;
pub mod controller;
pub mod favorites;
pub mod frames;
pub mod outbox;
pub mod peers;
pub mod router;

pub use controller::{AppEvent, SessionController};
pub use favorites::{FavoriteRecord, FavoritesBook};
pub use outbox::{Outbox, OutboxEntry};
pub use peers::{PeerRecord, PeerTable};
pub use router::Router;
