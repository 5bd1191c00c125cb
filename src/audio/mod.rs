//! # Audio Pipeline
//!
//! Everything between the PCM bytes coming off the channel and the float
//! samples handed to a sink.
//!
//! ## Key Components:
//! - **Ring Buffer**: growable byte arena absorbing irregular producer writes
//! - **Renderer**: drains one fixed quantum per tick and converts it to `f32`
//! - **Sinks**: where rendered samples end up (WAV file, raw stream, memory)
//!
//! ## Audio Format:
//! - **Encoding**: signed 16-bit little-endian PCM
//! - **Channels**: mono
//! - **Sample Rate**: fixed per engine voice (22050 Hz for piper medium voices)

pub mod buffer; // Growable ring arena with alignment carry
pub mod processor; // Fixed-quantum renderer and sample conversion
pub mod sink; // Rendered sample destinations

/// Width of one PCM sample on the wire.
pub const BYTES_PER_SAMPLE: usize = 2;
