//! Cryptographic primitives for gapmesh.
//!
//! Provides two things:
//!   1. SHA-256 hashing — peer fingerprints and key derivation contexts
//!   2. Noise_XX session establishment — mutually authenticated key exchange
//!
//! Keypairs are managed via x25519-dalek for explicit key control.
//! snow drives the Noise_XX state machine using those keys.
//!
//! All key material derives ZeroizeOnDrop — wiped from memory when dropped.
//! There is no unsafe code in this module.

use rand::RngCore;
use sha2::{Digest, Sha256};
use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── SHA-256 ───────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// The Noise protocol pattern gapmesh uses.
///
/// Noise_XX: mutual authentication, both static keys transmitted encrypted.
/// Neither key is visible to a passive observer.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// A device's long-term static X25519 keypair.
///
/// Generated once per identity and stored via the keychain. The first 8
/// bytes of the public key are the device's mesh address; the full key is
/// what a peer fingerprints. The private key never leaves this struct.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private key — zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; 32]>,
    /// Public key — transmitted inside the encrypted handshake.
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for the keychain.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    /// Derive a context-bound secondary secret from the static key.
    /// Deterministic, so derived identities (for example the relay-network
    /// key) survive restarts without another keychain slot.
    pub fn derive_subkey(&self, context: &[u8]) -> Zeroizing<[u8; 32]> {
        let mut hasher = Sha256::new();
        hasher.update(context);
        hasher.update(&*self.private);
        Zeroizing::new(hasher.finalize().into())
    }
}

// ── Noise Handshake ───────────────────────────────────────────────────────────

/// Initiator side of the Noise_XX handshake.
///
/// Sends message 1, consumes message 2, emits message 3, and produces a
/// completed Session together with the responder's static key.
pub struct NoiseInitiator {
    state: HandshakeState,
}

impl NoiseInitiator {
    /// Begin a handshake as the initiator.
    ///
    /// Returns the initiator state and the bytes of message 1, which travel
    /// inside a NoiseHandshake packet.
    pub fn new(keypair: &Keypair) -> Result<(Self, Vec<u8>), CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private)
            .build_initiator()
            .map_err(CryptoError::Noise)?;

        let mut initiator = Self { state };

        let mut msg1 = vec![0u8; 64];
        let len = initiator
            .state
            .write_message(&[], &mut msg1)
            .map_err(CryptoError::Noise)?;
        msg1.truncate(len);

        Ok((initiator, msg1))
    }

    /// Process the responder's message 2 and emit message 3.
    ///
    /// On success, returns the completed Session, message 3 to send, and
    /// the responder's static public key for identity verification.
    pub fn finish(
        mut self,
        msg2: &[u8],
        established_at_millis: u64,
    ) -> Result<(Session, Vec<u8>, [u8; 32]), CryptoError> {
        let mut payload = vec![0u8; msg2.len()];
        self.state
            .read_message(msg2, &mut payload)
            .map_err(CryptoError::Noise)?;

        let mut msg3 = vec![0u8; 96];
        let len = self
            .state
            .write_message(&[], &mut msg3)
            .map_err(CryptoError::Noise)?;
        msg3.truncate(len);

        let remote_static = remote_static_key(&self.state)?;
        let transport = self
            .state
            .into_stateless_transport_mode()
            .map_err(CryptoError::Noise)?;

        Ok((Session::new(transport, established_at_millis), msg3, remote_static))
    }
}

/// Responder side of the Noise_XX handshake.
pub struct NoiseResponder {
    state: HandshakeState,
}

impl NoiseResponder {
    pub fn new(keypair: &Keypair) -> Result<Self, CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private)
            .build_responder()
            .map_err(CryptoError::Noise)?;

        Ok(Self { state })
    }

    /// Process the initiator's message 1 and write message 2.
    pub fn respond(mut self, msg1: &[u8]) -> Result<(ResponderPending, Vec<u8>), CryptoError> {
        let mut payload = vec![0u8; msg1.len()];
        self.state
            .read_message(msg1, &mut payload)
            .map_err(CryptoError::Noise)?;

        let mut msg2 = vec![0u8; 128];
        let len = self
            .state
            .write_message(&[], &mut msg2)
            .map_err(CryptoError::Noise)?;
        msg2.truncate(len);

        Ok((ResponderPending { state: self.state }, msg2))
    }
}

/// Responder waiting for message 3 from the initiator.
pub struct ResponderPending {
    state: HandshakeState,
}

impl ResponderPending {
    /// Read message 3 and complete the handshake.
    ///
    /// Returns the completed Session and the initiator's static public key.
    pub fn finish(
        mut self,
        msg3: &[u8],
        established_at_millis: u64,
    ) -> Result<(Session, [u8; 32]), CryptoError> {
        let mut payload = vec![0u8; msg3.len()];
        self.state
            .read_message(msg3, &mut payload)
            .map_err(CryptoError::Noise)?;

        let remote_static = remote_static_key(&self.state)?;
        let transport = self
            .state
            .into_stateless_transport_mode()
            .map_err(CryptoError::Noise)?;

        Ok((Session::new(transport, established_at_millis), remote_static))
    }
}

fn remote_static_key(state: &HandshakeState) -> Result<[u8; 32], CryptoError> {
    let remote = state.get_remote_static().ok_or(CryptoError::MissingRemoteStatic)?;
    remote.try_into().map_err(|_| CryptoError::MissingRemoteStatic)
}

// ── Replay Window ─────────────────────────────────────────────────────────────

/// How far behind the highest accepted nonce a packet may arrive.
pub const REPLAY_WINDOW: u64 = 1024;

const NONCES_PER_BLOCK: u64 = 64;
/// One spare block beyond the window span, so the block holding the
/// horizon itself never collides with the oldest in-window block.
const RING_BLOCKS: usize = (REPLAY_WINDOW / NONCES_PER_BLOCK) as usize + 1;

/// How an incoming wire nonce relates to the window. The caller decides
/// severity: a duplicate is routine mesh noise, falling behind the window
/// is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceVerdict {
    /// Never accepted before; decrypt may proceed.
    Fresh,
    /// Already accepted — a relay echo or an actual replay.
    Duplicate,
    /// Fell behind the window; cannot be distinguished from an attack.
    TooOld,
}

/// Replay protection over the explicit wire nonces.
///
/// Seen-bits live in a ring of 64-nonce blocks addressed directly by
/// `nonce / 64`, so accepting a nonce never shuffles the bookkeeping:
/// when the horizon moves forward, the blocks that rotated out of the
/// window are zeroed in place and immediately describe the new range.
pub struct ReplayWindow {
    /// Highest nonce accepted so far; the window trails this by
    /// [`REPLAY_WINDOW`].
    horizon: u64,
    /// Seen-bits for the blocks covering `[horizon - REPLAY_WINDOW, horizon]`.
    ring: [u64; RING_BLOCKS],
    /// False until the first nonce lands (a horizon of 0 is otherwise
    /// ambiguous between "nothing yet" and "nonce 0 accepted").
    armed: bool,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            horizon: 0,
            ring: [0u64; RING_BLOCKS],
            armed: false,
        }
    }

    fn seen_bit(nonce: u64) -> (usize, u64) {
        let block = (nonce / NONCES_PER_BLOCK) as usize % RING_BLOCKS;
        (block, 1u64 << (nonce % NONCES_PER_BLOCK))
    }

    /// Classify a nonce without recording it. Call before decrypting.
    pub fn classify(&self, nonce: u64) -> NonceVerdict {
        if !self.armed || nonce > self.horizon {
            return NonceVerdict::Fresh;
        }
        if nonce + REPLAY_WINDOW < self.horizon {
            return NonceVerdict::TooOld;
        }
        let (block, mask) = Self::seen_bit(nonce);
        if self.ring[block] & mask != 0 {
            NonceVerdict::Duplicate
        } else {
            NonceVerdict::Fresh
        }
    }

    /// Record an authenticated nonce. Call only after the MAC verified.
    pub fn observe(&mut self, nonce: u64) {
        if !self.armed || nonce > self.horizon {
            // Blocks between the old horizon and the new one now cover
            // future nonces; zero them before their bits are read.
            let current = if self.armed {
                self.horizon / NONCES_PER_BLOCK
            } else {
                0
            };
            let target = nonce / NONCES_PER_BLOCK;
            let turned = (target - current).min(RING_BLOCKS as u64);
            for step in 1..=turned {
                self.ring[(current + step) as usize % RING_BLOCKS] = 0;
            }
            self.horizon = nonce;
        }
        let (block, mask) = Self::seen_bit(nonce);
        self.ring[block] |= mask;
        self.armed = true;
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Messages per direction between rekeys. Both sides derive the rekey
/// boundary from the wire nonce, so no extra signaling is needed: epoch
/// `n / REKEY_MESSAGES` determines how many times each cipher has been
/// rotated.
pub const REKEY_MESSAGES: u64 = 10_000;

/// Session age after which the whole session should be re-handshaken.
/// Wall clocks are not synchronized between peers, so age does not drive
/// an in-place rekey — it drives a fresh XX handshake.
pub const SESSION_MAX_AGE_MILLIS: u64 = 60 * 60 * 1000;

/// A completed Noise_XX session, ready for packet encryption/decryption.
///
/// Uses StatelessTransportState with explicit nonces — BLE notifications
/// and relayed packets may arrive out of order, so each ciphertext carries
/// an 8-byte LE nonce prefix on the wire:
///
///   [u64 nonce LE (8 bytes)] [Noise ciphertext (payload + 16-byte MAC)]
///
/// Session is NOT Sync — the nonce counters and replay window need
/// exclusive access. The registry wraps each one in a per-peer Mutex.
pub struct Session {
    transport: StatelessTransportState,
    send_nonce: u64,
    send_epoch: u64,
    recv_window: ReplayWindow,
    recv_epoch: u64,
    recv_count: u64,
    established_at_millis: u64,
}

impl Session {
    fn new(transport: StatelessTransportState, established_at_millis: u64) -> Self {
        Self {
            transport,
            send_nonce: 0,
            send_epoch: 0,
            recv_window: ReplayWindow::new(),
            recv_epoch: 0,
            recv_count: 0,
            established_at_millis,
        }
    }

    /// Encrypt plaintext into `out`: 8-byte LE nonce + ciphertext + MAC.
    /// Rotates the outgoing cipher whenever the nonce crosses a rekey
    /// boundary.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = self.send_nonce;
        self.send_nonce += 1;

        let epoch = nonce / REKEY_MESSAGES;
        while self.send_epoch < epoch {
            self.transport
                .rekey_outgoing();
            self.send_epoch += 1;
        }

        out.clear();
        out.extend_from_slice(&nonce.to_le_bytes());

        let offset = 8;
        out.resize(offset + plaintext.len() + 16, 0);
        let written = self
            .transport
            .write_message(nonce, plaintext, &mut out[offset..])
            .map_err(CryptoError::Noise)?;
        out.truncate(offset + written);
        Ok(())
    }

    /// Decrypt ciphertext into `out`. Reads the 8-byte LE nonce prefix,
    /// classifies it against the replay window, rotates the incoming
    /// cipher when the nonce's epoch has advanced, and verifies the
    /// Poly1305 MAC.
    ///
    /// Error severity follows the nonce verdict: an in-window duplicate
    /// is `Replay` (the session survives); a pre-window arrival is
    /// `OutOfWindow`, which — like MAC failure and a stale epoch — is
    /// terminal for the session.
    pub fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if ciphertext.len() < 8 + 16 {
            return Err(CryptoError::TooShort);
        }

        let nonce = u64::from_le_bytes(ciphertext[..8].try_into().unwrap());

        match self.recv_window.classify(nonce) {
            NonceVerdict::Fresh => {}
            NonceVerdict::Duplicate => return Err(CryptoError::Replay),
            NonceVerdict::TooOld => return Err(CryptoError::OutOfWindow),
        }

        let epoch = nonce / REKEY_MESSAGES;
        if epoch < self.recv_epoch {
            // A straggler from before the last rekey; its key is gone.
            return Err(CryptoError::StaleEpoch);
        }
        while self.recv_epoch < epoch {
            self.transport
                .rekey_incoming();
            self.recv_epoch += 1;
        }

        out.resize(ciphertext.len() - 8, 0);
        let written = self
            .transport
            .read_message(nonce, &ciphertext[8..], out)
            .map_err(CryptoError::Noise)?;
        out.truncate(written);

        self.recv_window.observe(nonce);
        self.recv_count += 1;
        Ok(())
    }

    /// True once the session is old enough that the caller should run a
    /// fresh handshake instead of trusting further rekeys.
    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis.saturating_sub(self.established_at_millis) >= SESSION_MAX_AGE_MILLIS
    }

    /// Total transport messages in both directions.
    pub fn message_count(&self) -> u64 {
        self.send_nonce + self.recv_count
    }

    pub fn established_at_millis(&self) -> u64 {
        self.established_at_millis
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string — this is a bug")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("handshake produced no remote static key")]
    MissingRemoteStatic,

    #[error("ciphertext too short (need at least 24 bytes: 8 nonce + 16 MAC)")]
    TooShort,

    #[error("nonce already accepted")]
    Replay,

    #[error("nonce fell behind the replay window")]
    OutOfWindow,

    #[error("nonce predates the current rekey epoch")]
    StaleEpoch,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
