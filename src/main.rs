//! # piper-relay - Command Line Entry Point
//!
//! One binary, several roles on the same framed channel:
//!
//! - `host` (default): Native Messaging host on stdin/stdout. A browser starts
//!   it with the extension origin as the only argument.
//! - `play`: read a framed PCM stream from stdin and render it
//! - `speak`: run engine, channel and renderer in-process
//! - `request`: write one framed request to stdout
//! - `config`: print the effective configuration
//!
//! `piper-relay request --text hi | piper-relay host | piper-relay play -o hi.wav`
//! crosses two real process boundaries.
//!
//! ## Logging:
//! stdout carries frames in `host` mode, so every log line goes to stderr.
//! `RUST_LOG` controls verbosity (`RUST_LOG=piper_relay=debug`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use piper_relay::audio::sink::{AudioSink, RawStreamSink, WavFileSink};
use piper_relay::codec::encode;
use piper_relay::config::{AppConfig, ClockMode};
use piper_relay::engine::PiperLauncher;
use piper_relay::host::serve;
use piper_relay::player::{play_transport, speak};
use piper_relay::protocol::SpeechRequest;
use piper_relay::session::{CancelToken, Session, SessionController};
use piper_relay::state::HostState;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "piper-relay", version, about, args_conflicts_with_subcommands = true)]
struct Cli {
    /// Configuration file (default: ./piper-relay.toml when present)
    #[arg(short, long, global = true, env = "PIPER_RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Arguments a browser passes when it launches the host directly
    #[arg(hide = true)]
    launcher_args: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve speech requests over stdin/stdout
    Host {
        /// Calling extension origin
        #[arg(hide = true)]
        origin: Vec<String>,
    },
    /// Render a framed PCM stream from stdin
    Play {
        /// WAV file to write; raw f32le samples go to stdout when omitted or `-`
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Override the render clock
        #[arg(long)]
        clock: Option<ClockMode>,
    },
    /// Synthesize text and render it in-process
    Speak {
        #[arg(short, long)]
        text: String,
        #[arg(short, long, default_value = "male")]
        voice: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        clock: Option<ClockMode>,
    },
    /// Write one framed speech request to stdout
    Request {
        #[arg(short, long)]
        text: String,
        #[arg(short, long, default_value = "male")]
        voice: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing()?;

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    config.validate()?;

    let shutdown = CancelToken::new();
    setup_signal_handlers(shutdown.clone());

    let command = cli.command.unwrap_or(Command::Host {
        origin: cli.launcher_args,
    });

    match command {
        Command::Host { origin } => run_host(&config, &origin, &shutdown).await,
        Command::Play { output, clock } => {
            if let Some(clock) = clock {
                config.audio.clock = clock;
            }
            run_play(&config, output.as_deref(), &shutdown).await
        }
        Command::Speak {
            text,
            voice,
            output,
            clock,
        } => {
            if let Some(clock) = clock {
                config.audio.clock = clock;
            }
            run_speak(&config, SpeechRequest::new(text, voice), output.as_deref(), &shutdown).await
        }
        Command::Request { text, voice } => {
            let request = SpeechRequest::new(text, voice);
            request.validate(&config.session)?;
            let frame = encode(&request.to_payload()?)?;
            let mut stdout = std::io::stdout();
            stdout.write_all(&frame)?;
            stdout.flush()?;
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run_host(config: &AppConfig, origin: &[String], shutdown: &CancelToken) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        origin = ?origin,
        engine = %config.engine.program,
        payload = ?config.transport.pcm_payload,
        "Starting piper-relay host"
    );

    let launcher = PiperLauncher::new(config.engine.clone());
    let state = HostState::new();
    let result = serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        &launcher,
        config,
        &state,
        shutdown,
    )
    .await;
    state.log_summary();

    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Host stopped");
            1
        }
    };
    // A parked stdin read runs on a blocking thread the runtime would wait for
    std::process::exit(code);
}

fn open_sink(output: Option<&Path>, sample_rate: u32) -> Result<Box<dyn AudioSink>> {
    match output {
        Some(path) if path != Path::new("-") => {
            Ok(Box::new(WavFileSink::create(path, sample_rate)?))
        }
        _ => Ok(Box::new(RawStreamSink::new(std::io::BufWriter::new(
            std::io::stdout(),
        )))),
    }
}

async fn run_play(config: &AppConfig, output: Option<&Path>, shutdown: &CancelToken) -> Result<()> {
    let mut sink = open_sink(output, config.audio.sample_rate)?;
    let reports = play_transport(tokio::io::stdin(), sink.as_mut(), config, shutdown).await?;
    info!(
        sessions = reports.len(),
        samples = sink.samples_written(),
        "Playback finished"
    );

    for report in &reports {
        info!(report = %serde_json::to_string(report)?, "Session report");
    }
    if let Some(failed) = reports.iter().find(|r| r.status == "failed") {
        bail!(
            "playback failed: {}",
            failed.reason.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn run_speak(
    config: &AppConfig,
    request: SpeechRequest,
    output: Option<&Path>,
    shutdown: &CancelToken,
) -> Result<()> {
    let launcher = PiperLauncher::new(config.engine.clone());
    let controller = SessionController::new(Session::new(&request));
    let mut sink = open_sink(output, config.audio.sample_rate)?;

    let (result, ()) = tokio::join!(
        speak(request, &launcher, sink.as_mut(), &controller, config),
        controller.abort_on(shutdown, "interrupted"),
    );
    let report = result?;
    info!(
        samples = sink.samples_written(),
        report = %serde_json::to_string(&report)?,
        "Session report"
    );

    if report.status == "failed" {
        bail!(
            "speech failed: {}",
            report.reason.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: what gets logged; defaults to `piper_relay=info`
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "piper_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
///
/// Whatever session is running is aborted, which is a normal terminal
/// outcome rather than a failure.
fn setup_signal_handlers(shutdown: CancelToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        error!(error = %e, "Failed to install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            info!("Received Ctrl+C");
        }

        shutdown.cancel();
    });
}
