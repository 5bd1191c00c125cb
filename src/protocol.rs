//! # Channel Message Types
//!
//! Payloads carried inside frames. Which payload a frame holds depends on the
//! direction of the channel:
//!
//! - **Caller → host**: a UTF-8 JSON [`SpeechRequest`] `{ "text", "voice" }`
//! - **Host → caller**: PCM chunks, or an [`ErrorMessage`] `{ "message" }`
//!
//! ## PCM Payload Encoding:
//! A browser's Native Messaging port only accepts JSON, so by default each
//! PCM chunk travels as a JSON array of byte values (`[0,128,255,127]`).
//! Trusted byte pipes can switch to `raw`, where a one-byte tag leads the
//! payload: `0x00` then PCM bytes, or `0x01` then the `{ "message" }` JSON.
//! With `json-array` the first significant byte tells the receiver what it
//! got: `[` is audio, `{` or `"` is an error. In both encodings an empty PCM
//! chunk (a zero-length raw frame, `[]`) is the end-of-session marker.

use crate::config::SessionConfig;
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};

/// One text-to-speech request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: String,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: voice.into(),
        }
    }

    /// Parse a request frame payload.
    pub fn from_payload(payload: &[u8]) -> RelayResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| RelayError::Request(format!("invalid request JSON: {}", e)))
    }

    /// Serialise as a request frame payload.
    pub fn to_payload(&self) -> RelayResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Check the request against the admission rules.
    ///
    /// ## Validation Checks:
    /// 1. Text is non-empty after trimming and within `max_text_chars`
    /// 2. Voice is a plain identifier (it becomes part of a file name)
    /// 3. Voice is one of the configured voices
    pub fn validate(&self, rules: &SessionConfig) -> RelayResult<()> {
        if self.text.trim().is_empty() {
            return Err(RelayError::Request("text is empty".to_string()));
        }

        let chars = self.text.chars().count();
        if chars > rules.max_text_chars {
            return Err(RelayError::Request(format!(
                "text is {} characters, limit is {}",
                chars, rules.max_text_chars
            )));
        }

        let well_formed = !self.voice.is_empty()
            && self
                .voice
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !well_formed {
            return Err(RelayError::Request(format!("invalid voice name: {:?}", self.voice)));
        }

        if !rules.voices.iter().any(|v| v == &self.voice) {
            return Err(RelayError::Request(format!(
                "unknown voice {:?}, expected one of {:?}",
                self.voice, rules.voices
            )));
        }

        Ok(())
    }
}

/// Error payload sent in place of audio when a session fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

/// How PCM bytes are placed inside a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PcmEncoding {
    /// Payload is the PCM bytes themselves
    Raw,
    /// Payload is a JSON array of byte values
    JsonArray,
}

impl std::str::FromStr for PcmEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(PcmEncoding::Raw),
            "json-array" | "json" => Ok(PcmEncoding::JsonArray),
            _ => Err(format!("Unknown PCM payload encoding: {}", s)),
        }
    }
}

/// A decoded host → caller payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Pcm(Vec<u8>),
    Error(ErrorMessage),
}

/// Leading byte of a raw audio payload.
pub const RAW_PCM_TAG: u8 = 0x00;
/// Leading byte of a raw error payload.
pub const RAW_ERROR_TAG: u8 = 0x01;

impl PcmEncoding {
    /// Wrap a chunk of engine output as a frame payload.
    pub fn encode_pcm(&self, pcm: &[u8]) -> RelayResult<Vec<u8>> {
        match self {
            // The marker stays a zero-length frame
            PcmEncoding::Raw if pcm.is_empty() => Ok(Vec::new()),
            PcmEncoding::Raw => {
                let mut payload = Vec::with_capacity(pcm.len() + 1);
                payload.push(RAW_PCM_TAG);
                payload.extend_from_slice(pcm);
                Ok(payload)
            }
            PcmEncoding::JsonArray => Ok(serde_json::to_vec(pcm)?),
        }
    }

    /// Wrap an error as the payload that ends a session on the caller's side.
    pub fn encode_error(&self, err: &RelayError) -> Vec<u8> {
        match self {
            PcmEncoding::Raw => {
                let mut payload = vec![RAW_ERROR_TAG];
                payload.extend(err.to_payload());
                payload
            }
            PcmEncoding::JsonArray => err.to_payload(),
        }
    }

    /// Classify and unwrap a host → caller payload.
    pub fn decode(&self, payload: Vec<u8>) -> RelayResult<Inbound> {
        match self {
            PcmEncoding::Raw => match payload.split_first() {
                None => Ok(Inbound::Pcm(Vec::new())),
                Some((&RAW_PCM_TAG, pcm)) => Ok(Inbound::Pcm(pcm.to_vec())),
                Some((&RAW_ERROR_TAG, body)) => Ok(Inbound::Error(serde_json::from_slice(body)?)),
                Some((tag, _)) => Err(RelayError::Framing(format!(
                    "unknown raw payload tag 0x{:02X}",
                    tag
                ))),
            },
            PcmEncoding::JsonArray => {
                let first = payload.iter().find(|b| !b.is_ascii_whitespace()).copied();
                match first {
                    Some(b'[') => {
                        let pcm: Vec<u8> = serde_json::from_slice(&payload).map_err(|e| {
                            RelayError::Framing(format!("malformed PCM array payload: {}", e))
                        })?;
                        Ok(Inbound::Pcm(pcm))
                    }
                    Some(b'{') => Ok(Inbound::Error(serde_json::from_slice(&payload)?)),
                    // Bare JSON strings are the older error form
                    Some(b'"') => Ok(Inbound::Error(ErrorMessage {
                        message: serde_json::from_slice(&payload)?,
                    })),
                    None => Ok(Inbound::Pcm(Vec::new())),
                    Some(other) => Err(RelayError::Framing(format!(
                        "unexpected payload starting with byte 0x{:02X}",
                        other
                    ))),
                }
            }
        }
    }
}
