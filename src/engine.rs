//! # TTS Engine Bridge
//!
//! The relay core never manages a process directly: it gets a byte source and
//! an exit signal through [`EngineProcess`], created by an [`EngineLauncher`].
//!
//! ## Piper:
//! [`PiperLauncher`] runs
//! `piper -q --length_scale <s> --sentence_silence <s> --model <voice model> --output_raw`,
//! writes the request text to the engine's stdin and reads raw s16le mono PCM
//! from its stdout. The text never goes through a shell.

use crate::config::EngineConfig;
use crate::error::{RelayError, RelayResult};
use crate::protocol::SpeechRequest;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Stderr lines kept for the error message when the engine fails.
const STDERR_TAIL_LINES: usize = 8;

/// Starts an engine for one request.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, request: &SpeechRequest) -> RelayResult<Box<dyn EngineProcess>>;
}

/// A running engine: a PCM byte source plus an exit signal.
#[async_trait]
pub trait EngineProcess: Send {
    /// Read output bytes. `Ok(0)` means the output is closed.
    async fn read(&mut self, buf: &mut [u8]) -> RelayResult<usize>;

    /// Wait for exit. A non-zero exit is a process error.
    async fn wait(&mut self) -> RelayResult<()>;

    /// Stop the engine and reap it.
    async fn kill(&mut self) -> RelayResult<()>;

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Launches the piper binary.
#[derive(Debug, Clone)]
pub struct PiperLauncher {
    config: EngineConfig,
}

impl PiperLauncher {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Model file for a voice, from `model_dir` and `model_template`.
    pub fn model_path(&self, voice: &str) -> PathBuf {
        PathBuf::from(&self.config.model_dir)
            .join(self.config.model_template.replace("{voice}", voice))
    }

    /// Arguments passed to piper for a voice.
    pub fn args(&self, voice: &str) -> Vec<String> {
        let mut args = vec![
            "-q".to_string(),
            "--length_scale".to_string(),
            self.config.length_scale.to_string(),
            "--sentence_silence".to_string(),
            self.config.sentence_silence.to_string(),
            "--model".to_string(),
            self.model_path(voice).to_string_lossy().into_owned(),
            "--output_raw".to_string(),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl EngineLauncher for PiperLauncher {
    async fn launch(&self, request: &SpeechRequest) -> RelayResult<Box<dyn EngineProcess>> {
        let model = self.model_path(&request.voice);
        if !model.exists() {
            return Err(RelayError::Process(format!(
                "voice model not found: {}",
                model.display()
            )));
        }

        let mut child = Command::new(&self.config.program)
            .args(self.args(&request.voice))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::Process(format!("failed to spawn {}: {}", self.config.program, e))
            })?;

        let pid = child.id();
        info!(pid, program = %self.config.program, voice = %request.voice, "Engine started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::Process("engine stdout was not captured".to_string()))?;

        // Feed the text from a separate task so a full stdin pipe cannot stall stdout reads
        if let Some(mut stdin) = child.stdin.take() {
            let text = request.text.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(text.as_bytes()).await {
                    debug!(error = %e, "Engine closed stdin early");
                }
                // Dropping stdin closes it, which tells piper the text is complete
            });
        }

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "piper_relay::engine::stderr", "{}", line);
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            });
        }

        Ok(Box::new(PiperProcess {
            program: self.config.program.clone(),
            child,
            stdout,
            stderr_tail,
        }))
    }
}

struct PiperProcess {
    program: String,
    child: Child,
    stdout: ChildStdout,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl PiperProcess {
    fn stderr_summary(&self) -> String {
        match self.stderr_tail.lock() {
            Ok(tail) if !tail.is_empty() => {
                format!(": {}", tail.iter().cloned().collect::<Vec<_>>().join(" | "))
            }
            _ => String::new(),
        }
    }
}

#[async_trait]
impl EngineProcess for PiperProcess {
    async fn read(&mut self, buf: &mut [u8]) -> RelayResult<usize> {
        Ok(self.stdout.read(buf).await?)
    }

    async fn wait(&mut self) -> RelayResult<()> {
        let status = self.child.wait().await?;
        if status.success() {
            debug!(pid = self.child.id(), "Engine exited cleanly");
            Ok(())
        } else {
            Err(RelayError::Process(format!(
                "{} exited with {}{}",
                self.program,
                status,
                self.stderr_summary()
            )))
        }
    }

    async fn kill(&mut self) -> RelayResult<()> {
        match self.child.try_wait()? {
            Some(_) => Ok(()),
            None => {
                warn!(pid = self.child.id(), "Killing engine");
                self.child.kill().await?;
                Ok(())
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Scripted engines for tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Emits fixed chunks, then exits with the configured result.
    #[derive(Clone, Default)]
    pub struct ScriptedLauncher {
        pub chunks: Vec<Vec<u8>>,
        pub exit_error: Option<String>,
        pub spawn_error: Option<String>,
        /// Delay before each chunk
        pub pace: Option<Duration>,
        /// Never close the output after the last chunk
        pub hang: bool,
        pub launches: Arc<AtomicUsize>,
        pub kills: Arc<AtomicUsize>,
        pub texts: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedLauncher {
        pub fn emitting(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks,
                ..Self::default()
            }
        }

        pub fn launch_count(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        pub fn kill_count(&self) -> usize {
            self.kills.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EngineLauncher for ScriptedLauncher {
        async fn launch(&self, request: &SpeechRequest) -> RelayResult<Box<dyn EngineProcess>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut texts) = self.texts.lock() {
                texts.push(request.text.clone());
            }
            if let Some(message) = &self.spawn_error {
                return Err(RelayError::Process(message.clone()));
            }
            Ok(Box::new(ScriptedProcess {
                chunks: self.chunks.iter().cloned().collect(),
                exit_error: self.exit_error.clone(),
                pace: self.pace,
                hang: self.hang,
                kills: self.kills.clone(),
            }))
        }
    }

    pub struct ScriptedProcess {
        chunks: VecDeque<Vec<u8>>,
        exit_error: Option<String>,
        pace: Option<Duration>,
        hang: bool,
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EngineProcess for ScriptedProcess {
        async fn read(&mut self, buf: &mut [u8]) -> RelayResult<usize> {
            if let Some(pace) = self.pace {
                tokio::time::sleep(pace).await;
            }
            match self.chunks.pop_front() {
                Some(mut chunk) => {
                    if chunk.len() > buf.len() {
                        let rest = chunk.split_off(buf.len());
                        self.chunks.push_front(rest);
                    }
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.hang => std::future::pending().await,
                None => Ok(0),
            }
        }

        async fn wait(&mut self) -> RelayResult<()> {
            match &self.exit_error {
                Some(message) => Err(RelayError::Process(message.clone())),
                None => Ok(()),
            }
        }

        async fn kill(&mut self) -> RelayResult<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
