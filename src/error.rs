//! # Error Handling
//!
//! Error taxonomy for the relay. Every stage (frame decoding, the engine
//! subprocess, the ring buffer, the renderer) reports through [`RelayError`],
//! and the session controller decides what a given error means for the
//! session's terminal state.
//!
//! ## Error Categories:
//! - **Framing**: truncated or malformed frame on the duplex channel
//! - **Process**: the TTS engine failed to spawn or exited non-zero
//! - **Overflow**: the ring buffer would grow past its configured maximum
//! - **Aborted**: explicit cancellation; a normal terminal outcome, not a failure
//! - **Request**: the caller sent an unusable `{text, voice}` request
//!
//! ## Wire Representation:
//! Errors cross the channel as a JSON payload framed like any other message:
//! ```json
//! { "message": "engine exited with exit status: 1" }
//! ```

use serde_json::json;
use thiserror::Error;

/// Errors produced by the relay pipeline.
///
/// ## Usage Example:
/// ```rust
/// use piper_relay::error::RelayError;
///
/// let err = RelayError::Framing("truncated payload: 3 of 27 bytes".to_string());
/// assert!(err.is_failure());
/// ```
#[derive(Debug, Error)]
pub enum RelayError {
    /// The channel closed mid-frame, or a header announced an oversized payload
    #[error("framing error: {0}")]
    Framing(String),

    /// The engine could not be spawned or reported a non-zero exit
    #[error("process error: {0}")]
    Process(String),

    /// The ring buffer reached its configured maximum
    #[error("buffer overflow: {requested} bytes requested, limit is {limit}")]
    Overflow { requested: usize, limit: usize },

    /// The session was cancelled
    #[error("aborted: {0}")]
    Aborted(String),

    /// The request payload was unusable (bad JSON, unknown voice, empty text)
    #[error("bad request: {0}")]
    Request(String),

    /// The audio sink rejected samples or could not be finalised
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration file or environment variable problems
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Whether the error should be reported as a session failure.
    ///
    /// Cancellation ends a session normally, everything else is surfaced.
    pub fn is_failure(&self) -> bool {
        !matches!(self, RelayError::Aborted(_))
    }

    /// Short machine-readable category, used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Framing(_) => "framing",
            RelayError::Process(_) => "process",
            RelayError::Overflow { .. } => "overflow",
            RelayError::Aborted(_) => "aborted",
            RelayError::Request(_) => "request",
            RelayError::Audio(_) => "audio",
            RelayError::Config(_) => "config",
            RelayError::Io(_) => "io",
            RelayError::Json(_) => "json",
        }
    }

    /// Serialise the error as the `{ "message": ... }` payload sent over the channel.
    pub fn to_payload(&self) -> Vec<u8> {
        json!({ "message": self.to_string() }).to_string().into_bytes()
    }
}

/// Configuration loading failures are server-side problems, not caller errors.
impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::Config(err.to_string())
    }
}

/// Shorthand for `Result<T, RelayError>`.
pub type RelayResult<T> = Result<T, RelayError>;
