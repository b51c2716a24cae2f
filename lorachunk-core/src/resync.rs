//! Frame resynchronizer: recover frame boundaries from a raw serial byte stream.
//!
//! The serial link delivers arbitrary slices with no framing of its own and
//! may inject noise (module boot chatter, runs of zero bytes after a
//! brown-out). Each decision is made by [`step`], a pure function of the
//! buffered bytes; [`Resynchronizer`] applies it to a [`BytesMut`] backlog.

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::protocol::{Frame, FrameType, HEADER_LEN, SYNC_BYTE, TYPE_OFFSET};
use crate::wire::{Codec, LengthError};

/// A zero run this long is treated as line noise.
pub const NOISE_ZERO_RUN: usize = 16;

/// What to do with the front of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A complete frame of this many bytes starts at offset 0.
    Emit(usize),
    /// Drop this many leading bytes and look again.
    Skip(usize),
    /// No sync anywhere and the buffer is noise: drop all of it.
    Discard,
    /// No sync anywhere: keep only the last byte.
    KeepLast,
    /// Need more bytes.
    Wait,
}

/// Decide the next action for `buf`. Never returns `Skip(0)`, and `Emit(n)`
/// always has `n <= buf.len()`, so applying steps until `Wait` terminates.
pub fn step(codec: &Codec, buf: &[u8]) -> Step {
    if buf.len() < HEADER_LEN {
        return Step::Wait;
    }
    if buf[0] != SYNC_BYTE {
        return match buf[1..].iter().position(|&b| b == SYNC_BYTE) {
            Some(i) => Step::Skip(i + 1),
            None if looks_like_noise(buf) => Step::Discard,
            None => Step::KeepLast,
        };
    }
    let Ok(frame_type) = FrameType::try_from(buf[TYPE_OFFSET]) else {
        return Step::Skip(1);
    };
    match codec.decode_length(frame_type, buf) {
        Ok(len) if buf.len() >= len => Step::Emit(len),
        Ok(_) | Err(LengthError::NeedMore) => Step::Wait,
        Err(LengthError::CountTooLarge(_) | LengthError::CountMismatch { .. }) => Step::Skip(1),
    }
}

fn looks_like_noise(buf: &[u8]) -> bool {
    let mut zeros = 0usize;
    let mut run = 0usize;
    for &b in buf {
        if b == 0 {
            zeros += 1;
            run += 1;
            if run >= NOISE_ZERO_RUN {
                return true;
            }
        } else {
            run = 0;
        }
    }
    zeros * 2 >= buf.len()
}

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncStats {
    pub frames: u64,
    pub skipped_bytes: u64,
    pub noise_discards: u64,
}

/// Accumulates serial reads and yields whole frames.
#[derive(Debug)]
pub struct Resynchronizer {
    codec: Codec,
    buf: BytesMut,
    stats: ResyncStats,
}

impl Resynchronizer {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            buf: BytesMut::with_capacity(1024),
            stats: ResyncStats::default(),
        }
    }

    /// Append bytes from one read.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` when only a partial frame (or nothing) remains.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match step(&self.codec, &self.buf) {
                Step::Wait => return None,
                Step::Emit(len) => {
                    let raw = self.buf.split_to(len);
                    match self.codec.decode(&raw) {
                        Ok(frame) => {
                            self.stats.frames += 1;
                            trace!(frame_type = ?frame.frame_type(), len, "frame");
                            return Some(frame);
                        }
                        Err(e) => {
                            debug!(error = %e, len, "dropping undecodable frame");
                            self.stats.skipped_bytes += len as u64;
                        }
                    }
                }
                Step::Skip(n) => {
                    trace!(n, "skipping to sync");
                    self.buf.advance(n);
                    self.stats.skipped_bytes += n as u64;
                }
                Step::Discard => {
                    debug!(len = self.buf.len(), "discarding noise");
                    self.stats.skipped_bytes += self.buf.len() as u64;
                    self.stats.noise_discards += 1;
                    self.buf.clear();
                }
                Step::KeepLast => {
                    let n = self.buf.len() - 1;
                    trace!(n, "no sync in buffer");
                    self.buf.advance(n);
                    self.stats.skipped_bytes += n as u64;
                }
            }
        }
    }

    /// Every complete frame currently buffered, in order.
    pub fn drain(&mut self) -> Vec<Frame> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn stats(&self) -> ResyncStats {
        self.stats
    }
}
