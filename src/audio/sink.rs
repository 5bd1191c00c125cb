//! # Audio Sinks
//!
//! Destinations for rendered quanta. The renderer hands each sink exactly one
//! quantum of normalized `f32` samples per tick.
//!
//! - [`WavFileSink`]: mono 32-bit float WAV, written incrementally with `hound`
//! - [`RawStreamSink`]: bare little-endian `f32` samples on any writer (stdout for piping into a player)
//! - [`MemorySink`]: collects samples in memory

use crate::error::{RelayError, RelayResult};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Accepts rendered samples.
pub trait AudioSink: Send {
    /// Write one quantum.
    fn write(&mut self, samples: &[f32]) -> RelayResult<()>;

    /// Flush and finalise. Calling it twice is harmless.
    fn close(&mut self) -> RelayResult<()>;

    fn samples_written(&self) -> u64;
}

pub struct WavFileSink {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    written: u64,
}

impl WavFileSink {
    pub fn create(path: &Path, sample_rate: u32) -> RelayResult<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec).map_err(|e| {
            RelayError::Audio(format!("failed creating wav file {}: {}", path.display(), e))
        })?;
        Ok(Self {
            writer: Some(writer),
            written: 0,
        })
    }
}

impl AudioSink for WavFileSink {
    fn write(&mut self, samples: &[f32]) -> RelayResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RelayError::Audio("wav file already closed".to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| RelayError::Audio(e.to_string()))?;
        }
        self.written += samples.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> RelayResult<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .map_err(|e| RelayError::Audio(e.to_string()))?;
        }
        Ok(())
    }

    fn samples_written(&self) -> u64 {
        self.written
    }
}

/// Raw `f32le` sample stream.
pub struct RawStreamSink<W: Write + Send> {
    writer: W,
    written: u64,
}

impl<W: Write + Send> RawStreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }
}

impl<W: Write + Send> AudioSink for RawStreamSink<W> {
    fn write(&mut self, samples: &[f32]) -> RelayResult<()> {
        for &sample in samples {
            self.writer.write_f32::<LittleEndian>(sample)?;
        }
        self.written += samples.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> RelayResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn samples_written(&self) -> u64 {
        self.written
    }
}

/// Keeps every sample. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemorySink {
    samples: Arc<Mutex<Vec<f32>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<f32> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().map(|c| *c).unwrap_or(false)
    }
}

impl AudioSink for MemorySink {
    fn write(&mut self, samples: &[f32]) -> RelayResult<()> {
        self.samples
            .lock()
            .map_err(|_| RelayError::Audio("memory sink lock poisoned".to_string()))?
            .extend_from_slice(samples);
        Ok(())
    }

    fn close(&mut self) -> RelayResult<()> {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = true;
        }
        Ok(())
    }

    fn samples_written(&self) -> u64 {
        self.samples.lock().map(|s| s.len() as u64).unwrap_or(0)
    }
}
