//! Per-connection byte-stream framer.
//!
//! BLE notifications deliver arbitrary slices of the sender's write
//! stream: a frame may arrive in one piece, split across many
//! notifications, or glued to its neighbours. One assembler per
//! connection turns that stream back into whole frames.
//!
//! Framing is self-describing: the packet header names the payload length
//! and the flag-implied suffixes, and the sender pads frames to the block
//! sizes in `padding`, so the assembler can compute exactly how many
//! bytes belong to the frame at the head of its buffer. Recovery rules:
//!
//! - garbage before a frame: drop one byte at a time until a plausible
//!   version byte reaches the head (each drop is reported);
//! - a frame that claims more than the hard cap: reset;
//! - a partial frame that stalls past the threshold: reset;
//! - buffer growth past the cap: reset.
//!
//! A reset empties the buffer and is reported so the transport can log
//! and, past a threshold, tear the connection down.

use bytes::{Buf, BytesMut};

use gapmesh_core::padding;
use gapmesh_core::wire::{self, WireError};

/// Default stall threshold for an incomplete frame, in milliseconds.
pub const DEFAULT_STALL_MILLIS: u64 = 1_500;

/// Default hard cap on a single frame (logical payload cap plus framing
/// and padding slack).
pub const DEFAULT_MAX_FRAME: usize = wire::DEFAULT_MAX_PAYLOAD + 4096;

/// What one `append` call produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Complete frames, padding already stripped, in stream order.
    pub frames: Vec<Vec<u8>>,
    /// Leading garbage bytes discarded while resynchronizing.
    pub dropped_prefix: usize,
    /// True when the assembler threw its buffer away.
    pub did_reset: bool,
}

pub struct StreamAssembler {
    buffer: BytesMut,
    /// (total padded length expected, monotonic ms when first seen short)
    partial: Option<(usize, u64)>,
    stall_millis: u64,
    max_frame: usize,
}

impl StreamAssembler {
    pub fn new(stall_millis: u64, max_frame: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            partial: None,
            stall_millis,
            max_frame,
        }
    }

    /// Feed bytes from the notification stream. `now_monotonic` drives the
    /// stall clock.
    pub fn append(&mut self, chunk: &[u8], now_monotonic: u64) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        self.buffer.extend_from_slice(chunk);

        loop {
            if self.buffer.is_empty() {
                break;
            }

            // Step 1: resynchronize on the version byte.
            let head_version = self.buffer[0];
            if head_version != wire::VERSION_1 && head_version != wire::VERSION_2 {
                if self.partial.is_some() {
                    // Mid-frame corruption: state is unrecoverable.
                    self.reset(&mut outcome);
                    break;
                }
                self.buffer.advance(1);
                outcome.dropped_prefix += 1;
                continue;
            }

            // Step 2: compute the frame length from the header.
            let logical_len = match wire::frame_len(&self.buffer) {
                Ok(Some(len)) => len,
                Ok(None) => {
                    // Header not complete yet; wait, but on a stall clock.
                    if self.stalled(self.buffer.len(), now_monotonic) {
                        self.reset(&mut outcome);
                    }
                    break;
                }
                Err(WireError::UnknownVersion(_)) => unreachable!("version checked above"),
                Err(_) => {
                    self.reset(&mut outcome);
                    break;
                }
            };
            let total_len = padding::padded_len(logical_len);

            // Step 3: cap check.
            if total_len > self.max_frame {
                self.reset(&mut outcome);
                break;
            }

            // Step 4: wait for the rest of a partial frame.
            if self.buffer.len() < total_len {
                if self.stalled(total_len, now_monotonic) {
                    self.reset(&mut outcome);
                }
                break;
            }

            // Step 5: emit the frame, discard its padding, advance.
            outcome.frames.push(self.buffer[..logical_len].to_vec());
            self.buffer.advance(total_len);
            self.partial = None;
        }

        // Never hold more than the cap even if no frame boundary is in sight.
        if self.buffer.len() > self.max_frame {
            self.reset(&mut outcome);
        }

        outcome
    }

    /// Track the current partial frame; true when it has been incomplete
    /// longer than the stall threshold.
    fn stalled(&mut self, expected: usize, now_monotonic: u64) -> bool {
        match self.partial {
            Some((len, since)) if len == expected => {
                now_monotonic.saturating_sub(since) >= self.stall_millis
            }
            _ => {
                // New partial frame (or it grew a more precise length
                // estimate): restart the stall clock.
                self.partial = Some((expected, now_monotonic));
                false
            }
        }
    }

    fn reset(&mut self, outcome: &mut AppendOutcome) {
        self.buffer.clear();
        self.partial = None;
        outcome.did_reset = true;
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
