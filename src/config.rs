//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (`piper-relay.toml`, or an explicit `--config` path)
//! - Environment variables (with the `PIPER_RELAY` prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and TOML/env values
//! - **derive macros**: Automatically generate Debug, Clone, Serialize, Deserialize
//! - **Result<T, E>**: Loading and validation report problems instead of panicking
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`PIPER_RELAY_AUDIO__QUANTUM`, `PIPER_RELAY_ENGINE__PROGRAM`, ...)
//! 2. Configuration file
//! 3. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore because several field
//! names contain single underscores (`max_buffer_bytes`).

use crate::error::{RelayError, RelayResult};
use crate::protocol::PcmEncoding;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file name, resolved relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "piper-relay";

/// Main configuration that contains all settings.
///
/// ## Why separate config structs:
/// The engine, the audio pipeline and the transport are tuned independently,
/// so each gets its own table in the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub audio: AudioConfig,
    pub transport: TransportConfig,
    pub session: SessionConfig,
}

/// How to launch the TTS engine.
///
/// ## Fields:
/// - `program`: path to the piper executable
/// - `model_dir`: directory holding the `.onnx` voice models
/// - `model_template`: file name of a voice model, `{voice}` is substituted
/// - `length_scale` / `sentence_silence`: forwarded to piper unchanged
/// - `extra_args`: appended verbatim after the built-in arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub program: String,
    pub model_dir: String,
    pub model_template: String,
    pub length_scale: f32,
    pub sentence_silence: f32,
    // An empty list vanishes when the defaults are layered in, so it must default itself
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `sample_rate`: rate of the engine's mono s16le output (piper medium voices: 22050 Hz)
/// - `quantum`: samples rendered per tick
/// - `max_buffer_bytes`: ring buffer growth limit
/// - `clock`: what drives render ticks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub quantum: usize,
    pub max_buffer_bytes: usize,
    pub clock: ClockMode,
}

/// Duplex channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Largest payload accepted or sent in one frame
    pub max_frame_bytes: usize,
    /// Size of each read from the engine or the channel
    pub read_chunk_bytes: usize,
    /// How PCM bytes are carried inside a frame
    pub pcm_payload: PcmEncoding,
}

/// Request admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Voices a request may name; each must have a model file
    pub voices: Vec<String>,
    pub max_text_chars: usize,
    /// Exit the host loop after the first session reaches a terminal state
    pub single_session: bool,
}

/// Render tick clock, resolved once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Fixed-rate ticks at `quantum / sample_rate` seconds, like an audio device callback
    Realtime,
    /// Tick as soon as a full quantum is buffered or the stream has ended
    Freewheel,
}

impl std::str::FromStr for ClockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "realtime" | "real-time" => Ok(ClockMode::Realtime),
            "freewheel" | "fast" => Ok(ClockMode::Freewheel),
            _ => Err(format!("Unknown clock mode: {}", s)),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                program: "./piper/piper".to_string(),
                model_dir: ".".to_string(),
                model_template: "en_US-hfc_{voice}-medium.onnx".to_string(),
                length_scale: 1.0,
                sentence_silence: 0.0,
                extra_args: Vec::new(),
            },
            audio: AudioConfig {
                sample_rate: 22050,
                quantum: 128,                      // one Web Audio render quantum
                max_buffer_bytes: 16 * 1024 * 1024, // ~6 minutes of 22.05 kHz s16 mono
                clock: ClockMode::Realtime,
            },
            transport: TransportConfig {
                max_frame_bytes: 1024 * 1024, // browser cap for host → extension messages
                read_chunk_bytes: 4096,
                pcm_payload: PcmEncoding::JsonArray,
            },
            session: SessionConfig {
                voices: vec!["male".to_string(), "female".to_string()],
                max_text_chars: 10_000,
                single_session: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from `path`, or `piper-relay.toml` when no path is given
    ///    (the default file is optional, an explicit path is required to exist)
    /// 3. Override with environment variables prefixed with `PIPER_RELAY_`
    ///
    /// ## Environment Variable Examples:
    /// - `PIPER_RELAY_ENGINE__PROGRAM=/opt/piper/piper`
    /// - `PIPER_RELAY_AUDIO__CLOCK=freewheel`
    /// - `PIPER_RELAY_TRANSPORT__PCM_PAYLOAD=raw`
    pub fn load(path: Option<&Path>) -> RelayResult<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("PIPER_RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("engine.extra_args")
                    .with_list_parse_key("session.voices"),
            );

        let config: AppConfig = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - The engine program and model template are usable
    /// - The sample rate and quantum are non-zero
    /// - The ring buffer can hold at least one quantum
    /// - Frames fit a 4-byte length header
    pub fn validate(&self) -> RelayResult<()> {
        if self.engine.program.trim().is_empty() {
            return Err(RelayError::Config("Engine program cannot be empty".to_string()));
        }

        if !self.engine.model_template.contains("{voice}") {
            return Err(RelayError::Config(
                "Model template must contain a {voice} placeholder".to_string(),
            ));
        }

        if self.audio.sample_rate == 0 {
            return Err(RelayError::Config("Sample rate cannot be 0".to_string()));
        }

        if self.audio.quantum == 0 {
            return Err(RelayError::Config("Render quantum must be greater than 0".to_string()));
        }

        if self.audio.max_buffer_bytes < self.quantum_bytes() {
            return Err(RelayError::Config(format!(
                "Ring buffer limit ({} bytes) is smaller than one quantum ({} bytes)",
                self.audio.max_buffer_bytes,
                self.quantum_bytes()
            )));
        }

        if self.transport.max_frame_bytes == 0
            || self.transport.max_frame_bytes > u32::MAX as usize
        {
            return Err(RelayError::Config(
                "Frame limit must be between 1 and u32::MAX bytes".to_string(),
            ));
        }

        if self.transport.read_chunk_bytes == 0 {
            return Err(RelayError::Config("Read chunk size must be greater than 0".to_string()));
        }

        if self.session.voices.is_empty() {
            return Err(RelayError::Config("At least one voice must be configured".to_string()));
        }

        Ok(())
    }

    /// Bytes consumed from the ring buffer per render tick (2 bytes per sample).
    pub fn quantum_bytes(&self) -> usize {
        self.audio.quantum * crate::audio::BYTES_PER_SAMPLE
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> RelayResult<String> {
        toml::to_string_pretty(self).map_err(|e| RelayError::Config(e.to_string()))
    }
}
