//! gapmesh-core — wire format, cryptography, and the pure protocol
//! machinery shared by every transport. All other gapmesh crates depend
//! on this one.

pub mod compress;
pub mod config;
pub mod crypto;
pub mod dedup;
pub mod fragment;
pub mod identity;
pub mod noise;
pub mod padding;
pub mod platform;
pub mod rotation;
pub mod wire;

pub use identity::{Fingerprint, IdentityStore};
pub use wire::{Packet, PacketType, PeerId};
