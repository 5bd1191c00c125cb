//! # piper-relay
//!
//! Streams raw PCM from a local piper TTS engine across a length-prefixed
//! duplex channel into a fixed-quantum renderer.
//!
//! ## Data Flow:
//! `{text, voice}` request → engine subprocess → PCM chunks → frames on the
//! channel → ring buffer → renderer ticks → audio sink.
//!
//! ## Module Layout:
//! - **codec**: length-prefixed frame encoder and streaming decoder
//! - **protocol**: request, error and PCM payloads carried inside frames
//! - **audio**: ring buffer, renderer and sinks
//! - **session**: per-request state machine, cancellation and teardown
//! - **engine**: launching the TTS engine behind a trait
//! - **relay**: the pumps between engine, channel and ring buffer
//! - **host**: the Native Messaging host loop
//! - **player**: the receiving end, plus in-process `speak`
//! - **config** / **error** / **state**: settings, error taxonomy, host counters

pub mod audio; // Ring buffer, renderer, sinks (audio/ directory)
pub mod codec; // Frame encoding and decoding (codec.rs)
pub mod config; // Configuration management (config.rs)
pub mod engine; // TTS engine launcher (engine.rs)
pub mod error; // Error types (error.rs)
pub mod host; // Native Messaging host loop (host.rs)
pub mod player; // Inbound playback and in-process speech (player.rs)
pub mod protocol; // Frame payload types (protocol.rs)
pub mod relay; // Stream pumps (relay.rs)
pub mod session; // Session lifecycle and cancellation (session.rs)
pub mod state; // Host metrics (state.rs)

pub use config::AppConfig;
pub use error::{RelayError, RelayResult};
pub use session::{CancelToken, SessionController};
