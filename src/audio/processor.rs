//! # PCM Renderer
//!
//! Turns the ring buffer into a steady stream of float quanta. One call to
//! [`PcmRenderer::render`] is one tick of the audio clock.
//!
//! ## Per-Tick Behaviour:
//! 1. Cancelled token: silence, the tick reports `Cancelled`
//! 2. Stream ended and every byte consumed: silence, `Completed` on the first such tick only
//! 3. Otherwise drain `quantum * 2` bytes and convert; a short drain is zero-padded
//!
//! A tick never awaits and never allocates once the scratch block exists. If
//! the producer is holding the ring lock at that instant the tick plays silence
//! and leaves the bytes for the next one.
//!
//! ## Sample Conversion:
//! Little-endian 16-bit values are mapped asymmetrically so the most negative
//! sample lands exactly on -1.0 and the most positive stays just below 1.0:
//! `v >= 0x8000 → -(0x10000 - v) / 0x8000`, otherwise `v / 0x7FFF`.

use crate::audio::buffer::{Drain, SharedRingBuffer};
use crate::audio::BYTES_PER_SAMPLE;
use crate::session::CancelToken;
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

/// Convert one raw 16-bit sample to a float in [-1, 1].
pub fn int16_to_float(raw: u16) -> f32 {
    if raw >= 0x8000 {
        -((0x10000 - raw as u32) as f32) / 0x8000 as f32
    } else {
        raw as f32 / 0x7FFF as f32
    }
}

/// Convert a whole number of little-endian samples into `out`.
///
/// Converts `min(bytes.len() / 2, out.len())` samples and returns that count.
pub fn convert_block(bytes: &[u8], out: &mut [f32]) -> usize {
    let samples = (bytes.len() / BYTES_PER_SAMPLE).min(out.len());
    for (i, slot) in out.iter_mut().take(samples).enumerate() {
        let at = i * BYTES_PER_SAMPLE;
        *slot = int16_to_float(LittleEndian::read_u16(&bytes[at..at + BYTES_PER_SAMPLE]));
    }
    samples
}

/// Outcome of one render tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// `samples` real samples were rendered, the rest of the quantum is silence
    Audio { samples: usize },
    /// No data was available; the quantum is silence
    Underrun,
    /// First tick after the last byte was played
    Completed,
    /// Any tick after completion
    Idle,
    /// Session was cancelled; the quantum is silence
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderStats {
    pub ticks: u64,
    pub audio_ticks: u64,
    pub underruns: u64,
    /// Ticks that found the ring locked by the producer
    pub contended: u64,
    pub samples_rendered: u64,
    pub silent_samples: u64,
}

/// Drains a shared ring buffer one quantum at a time.
pub struct PcmRenderer {
    ring: SharedRingBuffer,
    quantum: usize,
    scratch: Vec<u8>,
    token: CancelToken,
    completed: bool,
    stats: RenderStats,
}

impl PcmRenderer {
    pub fn new(ring: SharedRingBuffer, quantum: usize, token: CancelToken) -> Self {
        Self {
            ring,
            quantum,
            scratch: vec![0u8; quantum * BYTES_PER_SAMPLE],
            token,
            completed: false,
            stats: RenderStats::default(),
        }
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    /// Render one quantum into `out`, which must hold `quantum` samples.
    pub fn render(&mut self, out: &mut [f32]) -> Tick {
        debug_assert_eq!(out.len(), self.quantum);
        self.stats.ticks += 1;

        if self.token.is_cancelled() {
            return self.silence(out, Tick::Cancelled);
        }
        if self.completed {
            return self.silence(out, Tick::Idle);
        }

        let block = out.len() * BYTES_PER_SAMPLE;
        if self.scratch.len() != block {
            self.scratch.resize(block, 0);
        }

        match self.ring.try_drain(&mut self.scratch) {
            None => {
                self.stats.contended += 1;
                self.silence(out, Tick::Underrun)
            }
            Some(Drain::Block { filled: 0 }) => {
                self.stats.underruns += 1;
                self.silence(out, Tick::Underrun)
            }
            Some(Drain::Block { filled }) => {
                let samples = convert_block(&self.scratch[..filled], out);
                out[samples..].fill(0.0);
                self.stats.audio_ticks += 1;
                self.stats.samples_rendered += samples as u64;
                self.stats.silent_samples += (out.len() - samples) as u64;
                Tick::Audio { samples }
            }
            Some(Drain::EndOfStream) => {
                self.completed = true;
                self.silence(out, Tick::Completed)
            }
            Some(Drain::Exhausted) => {
                // Aborted ring without a cancelled token, or a second renderer
                self.completed = true;
                self.silence(out, Tick::Idle)
            }
        }
    }

    fn silence(&mut self, out: &mut [f32], tick: Tick) -> Tick {
        out.fill(0.0);
        self.stats.silent_samples += out.len() as u64;
        tick
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }
}
