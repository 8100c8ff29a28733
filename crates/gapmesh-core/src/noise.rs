//! Per-peer Noise session machine.
//!
//! One slot per remote peer, holding the handshake in flight or the
//! established transport session:
//!
//! ```text
//! Idle -> HandshakeSent -----> Established -> Closed
//!      \> HandshakeReceived /
//! ```
//!
//! XX messages are distinguished by length (32 / 96 / 64 bytes), the same
//! dispatch a datagram listener uses. At most one handshake runs per peer;
//! simultaneous opens are resolved by comparing mesh addresses — the lower
//! address stays initiator, the other side discards its own message 1.
//!
//! Slot locks are plain std mutexes held only across in-memory crypto,
//! never across I/O.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use thiserror::Error;

use crate::crypto::{
    CryptoError, NoiseInitiator, NoiseResponder, ResponderPending, Session,
};
use crate::identity::IdentityStore;
use crate::platform::Clock;
use crate::wire::PeerId;

/// On-wire sizes of the three XX handshake messages.
pub const XX_MSG1_LEN: usize = 32;
pub const XX_MSG2_LEN: usize = 96;
pub const XX_MSG3_LEN: usize = 64;

/// Handshakes with no progress for this long are abandoned.
pub const HANDSHAKE_TIMEOUT_MILLIS: u64 = 30_000;

enum Slot {
    Idle,
    HandshakeSent {
        initiator: NoiseInitiator,
        started_at: u64,
    },
    HandshakeReceived {
        pending: ResponderPending,
        started_at: u64,
    },
    Established {
        session: Session,
        remote_static: [u8; 32],
    },
    Closed,
}

impl Slot {
    fn name(&self) -> &'static str {
        match self {
            Slot::Idle => "idle",
            Slot::HandshakeSent { .. } => "handshake-sent",
            Slot::HandshakeReceived { .. } => "handshake-received",
            Slot::Established { .. } => "established",
            Slot::Closed => "closed",
        }
    }
}

/// What processing one inbound handshake message produced.
pub struct HandshakeOutcome {
    /// Bytes to send back (message 2 or 3), if any.
    pub reply: Option<Vec<u8>>,
    /// Set once the session reaches Established: the peer's static key.
    /// The caller compares its fingerprint against anything previously
    /// trusted and surfaces a change to the application.
    pub established: Option<[u8; 32]>,
}

/// All Noise sessions for this device, keyed by peer address.
pub struct NoiseRegistry {
    identity: Arc<IdentityStore>,
    clock: Arc<dyn Clock>,
    slots: DashMap<PeerId, Arc<Mutex<Slot>>>,
}

impl NoiseRegistry {
    pub fn new(identity: Arc<IdentityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            identity,
            clock,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, peer: PeerId) -> Arc<Mutex<Slot>> {
        self.slots
            .entry(peer)
            .or_insert_with(|| Arc::new(Mutex::new(Slot::Idle)))
            .clone()
    }

    fn lock(slot: &Arc<Mutex<Slot>>) -> MutexGuard<'_, Slot> {
        slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin a handshake toward `peer`, returning message 1 to transmit.
    ///
    /// A handshake already in flight is an error — callers wait for it.
    /// An established (possibly expired) session is replaced.
    pub fn initiate_handshake(&self, peer: PeerId) -> Result<Vec<u8>, NoiseError> {
        let slot = self.slot(peer);
        let mut guard = Self::lock(&slot);
        match *guard {
            Slot::HandshakeSent { .. } | Slot::HandshakeReceived { .. } => {
                return Err(NoiseError::HandshakeInFlight(peer));
            }
            _ => {}
        }
        let (initiator, msg1) = NoiseInitiator::new(self.identity.noise_keypair())?;
        *guard = Slot::HandshakeSent {
            initiator,
            started_at: self.clock.monotonic_millis(),
        };
        tracing::debug!(peer = %peer, "handshake initiated");
        Ok(msg1)
    }

    /// Feed one inbound NoiseHandshake payload through the state machine.
    pub fn process_handshake(
        &self,
        peer: PeerId,
        message: &[u8],
    ) -> Result<HandshakeOutcome, NoiseError> {
        let slot = self.slot(peer);
        let mut guard = Self::lock(&slot);
        let now = self.clock.monotonic_millis();

        match message.len() {
            XX_MSG1_LEN => self.on_msg1(peer, &mut guard, message, now),
            XX_MSG2_LEN => self.on_msg2(peer, &mut guard, message),
            XX_MSG3_LEN => self.on_msg3(peer, &mut guard, message),
            len => Err(NoiseError::UnexpectedMessage {
                peer,
                state: guard.name(),
                len,
            }),
        }
    }

    fn on_msg1(
        &self,
        peer: PeerId,
        guard: &mut Slot,
        message: &[u8],
        now: u64,
    ) -> Result<HandshakeOutcome, NoiseError> {
        if let Slot::HandshakeSent { .. } = guard {
            // Simultaneous open. The lower mesh address keeps its
            // initiator role and ignores the peer's message 1.
            if self.identity.peer_id() < peer {
                tracing::debug!(peer = %peer, "simultaneous open, keeping initiator role");
                return Ok(HandshakeOutcome { reply: None, established: None });
            }
            tracing::debug!(peer = %peer, "simultaneous open, yielding to lower address");
            *guard = Slot::Idle;
        }
        if let Slot::HandshakeReceived { .. } = guard {
            // Duplicate message 1 while we already answered one.
            return Ok(HandshakeOutcome { reply: None, established: None });
        }

        let responder = NoiseResponder::new(self.identity.noise_keypair())?;
        let (pending, msg2) = responder.respond(message).map_err(|e| self.fail(peer, guard, e))?;
        *guard = Slot::HandshakeReceived { pending, started_at: now };
        Ok(HandshakeOutcome {
            reply: Some(msg2),
            established: None,
        })
    }

    fn on_msg2(
        &self,
        peer: PeerId,
        guard: &mut Slot,
        message: &[u8],
    ) -> Result<HandshakeOutcome, NoiseError> {
        let state = std::mem::replace(guard, Slot::Idle);
        let Slot::HandshakeSent { initiator, .. } = state else {
            *guard = state;
            return Err(NoiseError::UnexpectedMessage {
                peer,
                state: guard.name(),
                len: XX_MSG2_LEN,
            });
        };
        let now_wall = self.clock.now_millis();
        let (session, msg3, remote_static) = initiator
            .finish(message, now_wall)
            .map_err(|e| self.fail(peer, guard, e))?;
        *guard = Slot::Established { session, remote_static };
        tracing::info!(peer = %peer, "noise session established (initiator)");
        Ok(HandshakeOutcome {
            reply: Some(msg3),
            established: Some(remote_static),
        })
    }

    fn on_msg3(
        &self,
        peer: PeerId,
        guard: &mut Slot,
        message: &[u8],
    ) -> Result<HandshakeOutcome, NoiseError> {
        let state = std::mem::replace(guard, Slot::Idle);
        let Slot::HandshakeReceived { pending, .. } = state else {
            *guard = state;
            return Err(NoiseError::UnexpectedMessage {
                peer,
                state: guard.name(),
                len: XX_MSG3_LEN,
            });
        };
        let now_wall = self.clock.now_millis();
        let (session, remote_static) = pending
            .finish(message, now_wall)
            .map_err(|e| self.fail(peer, guard, e))?;
        *guard = Slot::Established { session, remote_static };
        tracing::info!(peer = %peer, "noise session established (responder)");
        Ok(HandshakeOutcome {
            reply: None,
            established: Some(remote_static),
        })
    }

    fn fail(&self, peer: PeerId, guard: &mut Slot, cause: CryptoError) -> NoiseError {
        *guard = Slot::Closed;
        tracing::warn!(peer = %peer, error = %cause, "noise failure, session closed");
        NoiseError::SessionFailed { peer, cause }
    }

    /// Encrypt for an established peer.
    pub fn encrypt(&self, peer: PeerId, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let slot = self.slot(peer);
        let mut guard = Self::lock(&slot);
        let result = match &mut *guard {
            Slot::Established { session, .. } => {
                let mut out = Vec::new();
                session.encrypt(plaintext, &mut out).map(|()| out)
            }
            _ => return Err(NoiseError::NotEstablished(peer)),
        };
        result.map_err(|e| self.fail(peer, &mut guard, e))
    }

    /// Decrypt from an established peer.
    ///
    /// Replay of an in-window nonce is reported but does not kill the
    /// session (duplicates are a fact of mesh life); authentication
    /// failures and pre-window arrivals are terminal — the slot closes and
    /// a fresh handshake is required.
    pub fn decrypt(&self, peer: PeerId, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let slot = self.slot(peer);
        let mut guard = Self::lock(&slot);
        let result = match &mut *guard {
            Slot::Established { session, .. } => {
                let mut out = Vec::new();
                session.decrypt(ciphertext, &mut out).map(|()| out)
            }
            _ => return Err(NoiseError::NotEstablished(peer)),
        };
        match result {
            Ok(out) => Ok(out),
            Err(e @ (CryptoError::Replay | CryptoError::TooShort)) => {
                Err(NoiseError::Transient { peer, cause: e })
            }
            Err(e) => Err(self.fail(peer, &mut guard, e)),
        }
    }

    /// Tear down the session for `peer`.
    pub fn close(&self, peer: PeerId) {
        if let Some(slot) = self.slots.get(&peer) {
            *Self::lock(slot.value()) = Slot::Closed;
        }
    }

    /// True when sending to `peer` needs a handshake first: no session,
    /// a closed session, or one past its maximum age.
    pub fn handshake_required(&self, peer: PeerId) -> bool {
        let slot = self.slot(peer);
        let guard = Self::lock(&slot);
        match &*guard {
            Slot::Established { session, .. } => session.is_expired(self.clock.now_millis()),
            Slot::HandshakeSent { .. } | Slot::HandshakeReceived { .. } => false,
            _ => true,
        }
    }

    /// True while a handshake is in flight.
    pub fn handshake_in_flight(&self, peer: PeerId) -> bool {
        let slot = self.slot(peer);
        let guard = Self::lock(&slot);
        matches!(
            &*guard,
            Slot::HandshakeSent { .. } | Slot::HandshakeReceived { .. }
        )
    }

    /// True once a transport session exists and has not expired or closed.
    pub fn is_established(&self, peer: PeerId) -> bool {
        !self.handshake_required(peer) && !self.handshake_in_flight(peer)
    }

    /// The peer's static key, once established.
    pub fn remote_static(&self, peer: PeerId) -> Option<[u8; 32]> {
        let slot = self.slot(peer);
        let guard = Self::lock(&slot);
        match &*guard {
            Slot::Established { remote_static, .. } => Some(*remote_static),
            _ => None,
        }
    }

    /// Abandon handshakes that made no progress inside the timeout.
    /// Returns the peers whose handshakes were dropped.
    pub fn sweep_stale_handshakes(&self) -> Vec<PeerId> {
        let cutoff = self
            .clock
            .monotonic_millis()
            .saturating_sub(HANDSHAKE_TIMEOUT_MILLIS);
        let mut dropped = Vec::new();
        for entry in self.slots.iter() {
            let mut guard = Self::lock(entry.value());
            let stale = matches!(
                &*guard,
                Slot::HandshakeSent { started_at, .. } | Slot::HandshakeReceived { started_at, .. }
                    if *started_at < cutoff
            );
            if stale {
                *guard = Slot::Closed;
                dropped.push(*entry.key());
            }
        }
        for peer in &dropped {
            tracing::warn!(peer = %peer, "handshake timed out");
        }
        dropped
    }

    /// Drop every slot. Used by panic wipe and emergency disconnect.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("handshake already in flight with {0}")]
    HandshakeInFlight(PeerId),

    #[error("no established session with {0}")]
    NotEstablished(PeerId),

    #[error("unexpected {len}-byte handshake message from {peer} in state {state}")]
    UnexpectedMessage {
        peer: PeerId,
        state: &'static str,
        len: usize,
    },

    #[error("session with {peer} failed: {cause}")]
    SessionFailed { peer: PeerId, cause: CryptoError },

    #[error("transient decrypt error from {peer}: {cause}")]
    Transient { peer: PeerId, cause: CryptoError },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
