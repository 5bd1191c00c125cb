//! # Player
//!
//! The receiving end: frames in, ring buffer, renderer ticks, samples out to
//! an [`AudioSink`].
//!
//! ## Concurrency:
//! The inbound pump and the render loop run as two futures joined in one
//! task. The pump only ever moves the ring's write side, the render loop only
//! ever moves its read side. Either side failing ends the session through the
//! controller, which cancels the token the other side is watching.
//!
//! ## Clock Strategy:
//! Chosen once per session from [`ClockMode`]:
//! - **Realtime**: a fixed-rate interval of `quantum / sample_rate` seconds,
//!   standing in for an audio device callback; underruns play silence
//! - **Freewheel**: tick as soon as a full quantum is buffered or the stream
//!   ended, for rendering to a file as fast as the data arrives

use crate::audio::buffer::SharedRingBuffer;
use crate::audio::processor::{PcmRenderer, Tick};
use crate::audio::sink::AudioSink;
use crate::codec::{FrameReader, FrameWriter};
use crate::config::{AppConfig, ClockMode};
use crate::engine::EngineLauncher;
use crate::error::RelayResult;
use crate::host::run_host_session;
use crate::protocol::SpeechRequest;
use crate::relay::{pump_transport_to_ring, StreamEnd};
use crate::session::{AbortOrigin, CancelToken, Session, SessionController, SessionReport};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Result of playing one inbound stream.
#[derive(Debug, Clone)]
pub struct Playback {
    pub report: SessionReport,
    /// How the inbound stream ended; `None` if it never ended cleanly
    pub end: Option<StreamEnd>,
}

impl Playback {
    /// Whether the channel may still carry another session.
    pub fn channel_open(&self) -> bool {
        self.end == Some(StreamEnd::Marker)
    }
}

/// Play one inbound stream from `reader` into `sink`.
///
/// Creates the session's ring buffer, registers its release with the
/// controller and runs the pump and the render loop until the stream is
/// fully rendered or the session ends otherwise. The sink is not closed here;
/// several streams may be played into one sink.
pub async fn play_stream<R>(
    reader: &mut FrameReader<R>,
    sink: &mut dyn AudioSink,
    controller: &SessionController,
    config: &AppConfig,
) -> Option<StreamEnd>
where
    R: AsyncRead + Unpin,
{
    let ring = SharedRingBuffer::new(config.audio.max_buffer_bytes);
    {
        let ring = ring.clone();
        controller.on_teardown(move || {
            let dropped = ring.abort();
            if dropped > 0 {
                debug!(bytes = dropped, "Discarded unplayed audio");
            }
        });
    }
    controller.begin();

    let token = controller.token();
    let encoding = config.transport.pcm_payload;

    let producer = async {
        match pump_transport_to_ring(reader, encoding, &ring, controller.session(), &token).await {
            Ok(end) => Some(end),
            Err(e) => {
                controller.fail(AbortOrigin::Producer, &e);
                None
            }
        }
    };

    let consumer = async {
        let mut renderer = PcmRenderer::new(ring.clone(), config.audio.quantum, token.clone());
        let result = render_loop(&mut renderer, &ring, sink, &token, config).await;
        controller.record_render_stats(renderer.stats());
        match result {
            Ok(true) => {
                controller.complete();
            }
            Ok(false) => {}
            Err(e) => {
                controller.fail(AbortOrigin::Consumer, &e);
            }
        }
    };

    let (end, ()) = tokio::join!(producer, consumer);
    controller.record_ring_stats(ring.stats());
    end
}

/// Tick until completion. Returns `Ok(true)` when the last byte was played,
/// `Ok(false)` when the session was cancelled.
async fn render_loop(
    renderer: &mut PcmRenderer,
    ring: &SharedRingBuffer,
    sink: &mut dyn AudioSink,
    token: &CancelToken,
    config: &AppConfig,
) -> RelayResult<bool> {
    let quantum = config.audio.quantum;
    let mut frame = vec![0.0f32; quantum];

    let mut interval = match config.audio.clock {
        ClockMode::Realtime => {
            let period =
                Duration::from_secs_f64(quantum as f64 / config.audio.sample_rate as f64);
            let mut interval = tokio::time::interval(period.max(Duration::from_micros(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            Some(interval)
        }
        ClockMode::Freewheel => None,
    };
    let block = quantum * crate::audio::BYTES_PER_SAMPLE;

    loop {
        match interval.as_mut() {
            Some(interval) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(false),
                    _ = interval.tick() => {}
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(false),
                    _ = ring.readable(block) => {}
                }
            }
        }

        match renderer.render(&mut frame) {
            Tick::Cancelled => return Ok(false),
            Tick::Completed | Tick::Idle => {
                sink.write(&frame)?;
                return Ok(true);
            }
            Tick::Audio { .. } | Tick::Underrun => sink.write(&frame)?,
        }
    }
}

/// Play every session on the channel until it closes, a session fails, or
/// `shutdown` fires.
///
/// A channel that closes right after an end-of-session marker (or before any
/// frame) yields no further session.
pub async fn play_transport<R>(
    reader: R,
    sink: &mut dyn AudioSink,
    config: &AppConfig,
    shutdown: &CancelToken,
) -> RelayResult<Vec<SessionReport>>
where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(
        reader,
        config.transport.max_frame_bytes,
        config.transport.read_chunk_bytes,
    );
    let mut reports = Vec::new();

    loop {
        // A session starts with its first frame; a clean close in between ends the channel
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Ok(false),
            next = reader.has_next() => next,
        };
        match next {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                sink.close()?;
                return Err(e);
            }
        }

        let controller = SessionController::new(Session::inbound());
        let (end, ()) = tokio::join!(
            play_stream(&mut reader, sink, &controller, config),
            controller.abort_on(shutdown, "playback interrupted"),
        );
        let report = controller.report();
        info!(
            session_id = %report.id,
            status = %report.status,
            bytes = report.bytes_in,
            "Playback finished"
        );
        let playback = Playback { report, end };
        let more = playback.channel_open()
            && playback.report.status != "failed"
            && !shutdown.is_cancelled();
        reports.push(playback.report);
        if !more {
            break;
        }
    }

    sink.close()?;
    Ok(reports)
}

/// Synthesize and render one request in-process.
///
/// The engine's output goes through a real frame writer and reader joined by
/// an in-memory pipe, so this exercises the same path as `request | host | play`.
pub async fn speak(
    request: SpeechRequest,
    launcher: &dyn EngineLauncher,
    sink: &mut dyn AudioSink,
    controller: &SessionController,
    config: &AppConfig,
) -> RelayResult<SessionReport> {
    request.validate(&config.session)?;

    let pipe_bytes = config.transport.max_frame_bytes.max(64 * 1024);
    let (outbound, inbound) = tokio::io::duplex(pipe_bytes);
    let mut writer = FrameWriter::new(outbound, config.transport.max_frame_bytes);
    let mut reader = FrameReader::new(
        inbound,
        config.transport.max_frame_bytes,
        config.transport.read_chunk_bytes,
    );

    let host_side = async {
        let result = run_host_session(&mut writer, launcher, &request, controller, config).await;
        if let Err(e) = &result {
            controller.fail(AbortOrigin::Producer, e);
        }
        // Closing the pipe lets the player see the end even if no marker was sent
        drop(writer);
        result
    };
    let player_side = play_stream(&mut reader, sink, controller, config);

    let (host_result, _) = tokio::join!(host_side, player_side);
    sink.close()?;

    match host_result {
        Err(e) if e.is_failure() => Err(e),
        _ => Ok(controller.report()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::MemorySink;
    use crate::codec::encode;
    use crate::engine::fake::ScriptedLauncher;
    use crate::protocol::PcmEncoding;
    use crate::session::SessionStatus;

    fn freewheel_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.audio.clock = ClockMode::Freewheel;
        config.audio.quantum = 4;
        config
    }

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[tokio::test]
    async fn test_play_renders_split_samples_in_order() {
        let config = freewheel_config();
        let encoding = config.transport.pcm_payload;
        let audio = pcm(&[i16::MIN, 0, 16384, i16::MAX, -16384]);

        // Odd-sized chunks split samples across frames
        let mut bytes = Vec::new();
        for chunk in audio.chunks(3) {
            bytes.extend(encode(&encoding.encode_pcm(chunk).unwrap()).unwrap());
        }
        bytes.extend(encode(&encoding.encode_pcm(&[]).unwrap()).unwrap());

        let sink = MemorySink::new();
        let mut writer = sink.clone();
        let reports = play_transport(std::io::Cursor::new(bytes), &mut writer, &config, &CancelToken::new())
            .await
            .unwrap();

        // The close after the marker does not start another session
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, "completed");
        assert_eq!(reports[0].bytes_in, 10);

        let samples = sink.samples();
        assert_eq!(samples[0], -1.0);
        assert_eq!(samples[1], 0.0);
        assert!((samples[2] - 16384.0 / 32767.0).abs() < 1e-6);
        assert!((samples[3] - 1.0).abs() < 1e-6);
        assert_eq!(samples[4], -0.5);
        assert!(samples[5..].iter().all(|s| *s == 0.0));
        assert!(sink.is_closed());

        let ring = reports[0].ring.unwrap();
        assert!(ring.is_conserved());
        assert_eq!(ring.appended, 10);
    }

    #[tokio::test]
    async fn test_error_frame_fails_playback() {
        let config = freewheel_config();
        let mut bytes = encode(b"[0,0]").unwrap();
        bytes.extend(encode(br#""spawn failed""#).unwrap());

        let mut sink = MemorySink::new();
        let reports = play_transport(std::io::Cursor::new(bytes), &mut sink, &config, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, "failed");
        assert_eq!(reports[0].error_kind, Some("process"));
    }

    #[tokio::test]
    async fn test_marker_then_close_is_one_session() {
        let config = freewheel_config();
        let encoding = config.transport.pcm_payload;
        let mut bytes = encode(&encoding.encode_pcm(&pcm(&[100, -100])).unwrap()).unwrap();
        bytes.extend(encode(&encoding.encode_pcm(&[]).unwrap()).unwrap());

        let sink = MemorySink::new();
        let mut writer = sink.clone();
        let shutdown = CancelToken::new();
        let reports = play_transport(std::io::Cursor::new(bytes), &mut writer, &config, &shutdown)
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].bytes_in, 4);
        // One audio quantum, then the silent quantum that reports completion
        assert_eq!(sink.samples().len(), 8);
    }

    #[tokio::test]
    async fn test_empty_channel_plays_nothing() {
        let config = freewheel_config();
        let mut sink = MemorySink::new();
        let shutdown = CancelToken::new();
        let reports = play_transport(std::io::Cursor::new(Vec::new()), &mut sink, &config, &shutdown)
            .await
            .unwrap();

        assert!(reports.is_empty());
        assert!(sink.samples().is_empty());
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_raw_error_frame_fails_playback() {
        let mut config = freewheel_config();
        config.transport.pcm_payload = PcmEncoding::Raw;
        let encoding = config.transport.pcm_payload;
        let failure = crate::error::RelayError::Process("piper exited with exit status: 1".to_string());

        let mut bytes = encode(&encoding.encode_pcm(&[0, 0]).unwrap()).unwrap();
        bytes.extend(encode(&encoding.encode_error(&failure)).unwrap());

        let sink = MemorySink::new();
        let mut writer = sink.clone();
        let shutdown = CancelToken::new();
        let reports = play_transport(std::io::Cursor::new(bytes), &mut writer, &config, &shutdown)
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, "failed");
        assert_eq!(reports[0].error_kind, Some("process"));
        assert_eq!(reports[0].bytes_in, 2);
        assert!(sink.samples().iter().all(|s| *s == 0.0));
    }

    #[tokio::test]
    async fn test_realtime_clock_plays_raw_stream() {
        let mut config = AppConfig::default();
        config.audio.quantum = 64;
        config.audio.sample_rate = 64_000; // 1 ms ticks
        config.transport.pcm_payload = PcmEncoding::Raw;

        let encoding = config.transport.pcm_payload;
        let audio = pcm(&[1000; 300]);
        let mut bytes = encode(&encoding.encode_pcm(&audio[..333]).unwrap()).unwrap();
        bytes.extend(encode(&encoding.encode_pcm(&audio[333..]).unwrap()).unwrap());

        let sink = MemorySink::new();
        let mut writer = sink.clone();
        let reports = play_transport(std::io::Cursor::new(bytes), &mut writer, &config, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, "completed");
        let samples = sink.samples();
        assert_eq!(samples.len() % 64, 0);
        let audible = samples.iter().filter(|s| **s != 0.0).count();
        assert_eq!(audible, 300);
    }

    #[tokio::test]
    async fn test_overflow_fails_session() {
        let mut config = freewheel_config();
        config.audio.max_buffer_bytes = 8;
        config.transport.pcm_payload = PcmEncoding::Raw;

        let bytes = encode(&PcmEncoding::Raw.encode_pcm(&[0u8; 16]).unwrap()).unwrap();
        let mut sink = MemorySink::new();
        let reports = play_transport(std::io::Cursor::new(bytes), &mut sink, &config, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(reports[0].status, "failed");
        assert_eq!(reports[0].error_kind, Some("overflow"));
    }

    #[tokio::test]
    async fn test_speak_end_to_end() {
        let config = freewheel_config();
        let launcher = ScriptedLauncher::emitting(vec![pcm(&[i16::MIN, 0, 0]), vec![0xFF, 0x7F]]);
        let controller = SessionController::new(Session::new(&SpeechRequest::new("hi", "male")));
        let sink = MemorySink::new();
        let mut writer = sink.clone();

        let report = speak(
            SpeechRequest::new("hi", "male"),
            &launcher,
            &mut writer,
            &controller,
            &config,
        )
        .await
        .unwrap();

        assert_eq!(controller.status(), SessionStatus::Completed);
        assert_eq!(controller.releases(), 1);
        assert_eq!(report.bytes_out, 8);
        assert_eq!(report.bytes_in, 8);
        let samples = sink.samples();
        assert_eq!(samples[0], -1.0);
        assert!((samples[3] - 1.0).abs() < 1e-6);
        assert_eq!(launcher.texts.lock().unwrap().as_slice(), ["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_speak_abort_mid_stream() {
        let mut config = freewheel_config();
        config.audio.clock = ClockMode::Realtime;
        let mut launcher = ScriptedLauncher::emitting(vec![pcm(&[100; 64])]);
        launcher.hang = true;
        let controller = SessionController::new(Session::new(&SpeechRequest::new("hi", "male")));
        let mut sink = MemorySink::new();

        let abort = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            controller.abort(AbortOrigin::External, "interrupted");
            controller.abort(AbortOrigin::External, "interrupted again");
        };
        let run = speak(
            SpeechRequest::new("hi", "male"),
            &launcher,
            &mut sink,
            &controller,
            &config,
        );
        let (report, ()) = tokio::join!(run, abort);

        let report = report.unwrap();
        assert_eq!(report.status, "aborted");
        assert_eq!(report.reason.as_deref(), Some("interrupted"));
        assert_eq!(controller.releases(), 1);
        assert_eq!(launcher.kill_count(), 1);
        assert!(report.ring.unwrap().is_conserved());
    }

    #[tokio::test]
    async fn test_speak_engine_failure() {
        let config = freewheel_config();
        let mut launcher = ScriptedLauncher::emitting(vec![pcm(&[5; 8])]);
        launcher.exit_error = Some("piper exited with exit status: 1".to_string());
        let controller = SessionController::new(Session::new(&SpeechRequest::new("hi", "male")));
        let mut sink = MemorySink::new();

        let err = speak(
            SpeechRequest::new("hi", "male"),
            &launcher,
            &mut sink,
            &controller,
            &config,
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "process error: piper exited with exit status: 1");
        assert!(matches!(controller.status(), SessionStatus::Failed(_)));
    }
}
