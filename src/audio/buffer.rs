//! # Audio Ring Buffer
//!
//! A growable byte arena sitting between the producer (bytes arriving off the
//! channel in whatever sizes the transport delivers) and the consumer (the
//! renderer, which wants exactly one quantum per tick and must never wait).
//!
//! ## Key Features:
//! - **Growth without disturbance**: the arena grows to `write_offset + len`;
//!   existing bytes and offsets are untouched by growth
//! - **Alignment carry**: an odd trailing byte is held back and prepended to the
//!   next append, so the arena only ever contains whole samples
//! - **Silence on underrun**: a drain that finds too few bytes zero-fills the rest
//! - **End-of-stream once**: after `finish()`, the drain that finds the arena
//!   empty reports end-of-stream a single time and releases the memory
//! - **Bounded**: growth past `max_bytes` fails with an overflow error
//!
//! ## Offsets:
//! `0 <= read_offset <= write_offset <= arena.len() <= arena.capacity()`.
//! The producer only moves `write_offset`, the consumer only moves
//! `read_offset`. When the consumer catches up with the producer both rewind
//! to zero, so a long stream that is played as fast as it arrives keeps
//! reusing the same allocation.

use crate::audio::BYTES_PER_SAMPLE;
use crate::error::{RelayError, RelayResult};
use serde::Serialize;
use std::sync::{Arc, Mutex, TryLockError};
use tokio::sync::Notify;

/// Byte accounting for one ring buffer.
///
/// After teardown `appended == consumed + discarded`; `padded` counts the
/// silence the consumer was handed in place of missing bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RingStats {
    /// Raw bytes handed to `append`, carried byte included
    pub appended: u64,
    /// Real bytes handed to the consumer
    pub consumed: u64,
    /// Zero bytes filled in on underrun
    pub padded: u64,
    /// Bytes dropped by abort, plus a dangling half-sample at finish
    pub discarded: u64,
    /// Largest arena length reached
    pub peak_bytes: usize,
}

impl RingStats {
    pub fn is_conserved(&self) -> bool {
        self.appended == self.consumed + self.discarded
    }
}

/// What a drain produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// The block was filled; `filled` real bytes followed by zero padding
    Block { filled: usize },
    /// Producer finished and every byte was consumed; reported once
    EndOfStream,
    /// Nothing more will ever arrive (after end-of-stream or abort)
    Exhausted,
}

/// Single-owner ring arena. Wrap it in [`SharedRingBuffer`] to share it
/// between the producer and the renderer.
#[derive(Debug)]
pub struct AudioRingBuffer {
    arena: Vec<u8>,
    read_offset: usize,
    write_offset: usize,
    overflow_byte: Option<u8>,
    max_bytes: usize,
    finished: bool,
    eos_signalled: bool,
    aborted: bool,
    stats: RingStats,
}

impl AudioRingBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            arena: Vec::new(),
            read_offset: 0,
            write_offset: 0,
            overflow_byte: None,
            max_bytes,
            finished: false,
            eos_signalled: false,
            aborted: false,
            stats: RingStats::default(),
        }
    }

    /// Append raw PCM bytes from the producer.
    ///
    /// ## Alignment:
    /// A carried byte from the previous call goes first. If the combined run
    /// has odd length, its last byte becomes the new carry. Appending
    /// `[0x01]`, `[0x02, 0x03]`, `[0x04]` leaves the same arena contents as
    /// appending `[0x01, 0x02, 0x03, 0x04]` at once.
    ///
    /// Appends after `finish()` or `abort()` are dropped and counted as discarded.
    pub fn append(&mut self, bytes: &[u8]) -> RelayResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.finished || self.aborted {
            self.stats.appended += bytes.len() as u64;
            self.stats.discarded += bytes.len() as u64;
            return Ok(());
        }

        let carried = usize::from(self.overflow_byte.is_some());
        let total = carried + bytes.len();
        let aligned = total - total % BYTES_PER_SAMPLE;

        let new_len = self.write_offset + aligned;
        if new_len > self.max_bytes {
            return Err(RelayError::Overflow {
                requested: new_len,
                limit: self.max_bytes,
            });
        }
        self.stats.appended += bytes.len() as u64;

        if new_len > self.arena.len() {
            // resize keeps everything below write_offset in place
            self.arena.resize(new_len, 0);
        }

        let mut input = bytes;
        if aligned > 0 {
            let mut cursor = self.write_offset;
            if let Some(byte) = self.overflow_byte.take() {
                self.arena[cursor] = byte;
                cursor += 1;
            }
            let take = new_len - cursor;
            self.arena[cursor..new_len].copy_from_slice(&input[..take]);
            input = &input[take..];
            self.write_offset = new_len;
        }

        // At most one byte is left after alignment
        debug_assert!(input.len() < BYTES_PER_SAMPLE);
        if let Some(&byte) = input.last() {
            self.overflow_byte = Some(byte);
        }

        self.stats.peak_bytes = self.stats.peak_bytes.max(self.arena.len());
        Ok(())
    }

    /// Fill `out` from the read offset. Never waits.
    ///
    /// Missing bytes are zero-filled. `out` should be a whole number of samples.
    pub fn drain(&mut self, out: &mut [u8]) -> Drain {
        if self.aborted || self.eos_signalled {
            out.fill(0);
            return Drain::Exhausted;
        }

        let available = self.write_offset - self.read_offset;
        if available == 0 && self.finished {
            out.fill(0);
            self.eos_signalled = true;
            self.release();
            return Drain::EndOfStream;
        }

        let filled = available.min(out.len());
        out[..filled].copy_from_slice(&self.arena[self.read_offset..self.read_offset + filled]);
        out[filled..].fill(0);
        self.read_offset += filled;
        self.stats.consumed += filled as u64;
        self.stats.padded += (out.len() - filled) as u64;

        if self.read_offset == self.write_offset {
            self.read_offset = 0;
            self.write_offset = 0;
        }

        Drain::Block { filled }
    }

    /// Producer is done. A dangling half-sample can never be paired and is discarded.
    pub fn finish(&mut self) {
        if self.finished || self.aborted {
            return;
        }
        self.finished = true;
        if self.overflow_byte.take().is_some() {
            self.stats.discarded += 1;
        }
    }

    /// Drop everything unread and release the arena.
    ///
    /// Returns the number of bytes discarded by this call.
    pub fn abort(&mut self) -> usize {
        if self.aborted {
            return 0;
        }
        self.aborted = true;
        let dropped = (self.write_offset - self.read_offset)
            + usize::from(self.overflow_byte.take().is_some());
        self.stats.discarded += dropped as u64;
        self.release();
        dropped
    }

    fn release(&mut self) {
        self.arena = Vec::new();
        self.read_offset = 0;
        self.write_offset = 0;
    }

    /// Unread whole-sample bytes.
    pub fn buffered(&self) -> usize {
        self.write_offset - self.read_offset
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }
}

struct SharedRing {
    ring: Mutex<AudioRingBuffer>,
    readable: Notify,
}

/// Ring buffer shared by the producer task and the renderer.
///
/// The producer side locks normally; the lock is only held for a copy. The
/// renderer side uses [`try_drain`](Self::try_drain), which gives up instead
/// of waiting for the lock.
#[derive(Clone)]
pub struct SharedRingBuffer {
    inner: Arc<SharedRing>,
}

impl SharedRingBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(SharedRing {
                ring: Mutex::new(AudioRingBuffer::new(max_bytes)),
                readable: Notify::new(),
            }),
        }
    }

    fn with_ring<T>(&self, f: impl FnOnce(&mut AudioRingBuffer) -> T) -> T {
        // A panic mid-copy leaves offsets consistent, so a poisoned lock is still usable
        let mut ring = match self.inner.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut ring)
    }

    pub fn append(&self, bytes: &[u8]) -> RelayResult<()> {
        let result = self.with_ring(|ring| ring.append(bytes));
        self.inner.readable.notify_waiters();
        result
    }

    pub fn finish(&self) {
        self.with_ring(|ring| ring.finish());
        self.inner.readable.notify_waiters();
    }

    pub fn abort(&self) -> usize {
        let dropped = self.with_ring(|ring| ring.abort());
        self.inner.readable.notify_waiters();
        dropped
    }

    /// Drain without waiting for the lock. `None` means the producer holds it.
    pub fn try_drain(&self, out: &mut [u8]) -> Option<Drain> {
        match self.inner.ring.try_lock() {
            Ok(mut ring) => Some(ring.drain(out)),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner().drain(out)),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Wait until a drain of `block` bytes would be full, or would report
    /// end-of-stream, or the buffer was aborted.
    pub async fn readable(&self, block: usize) {
        loop {
            // Registered before the check so a notify in between is not lost
            let notified = self.inner.readable.notified();
            let ready = self.with_ring(|ring| {
                ring.buffered() >= block || ring.is_finished() || ring.is_aborted()
            });
            if ready {
                return;
            }
            notified.await;
        }
    }

    pub fn buffered(&self) -> usize {
        self.with_ring(|ring| ring.buffered())
    }

    pub fn stats(&self) -> RingStats {
        self.with_ring(|ring| ring.stats())
    }
}
