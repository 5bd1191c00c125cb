//! # Native Messaging Host
//!
//! Serves speech requests arriving as frames on one channel (stdin/stdout
//! when launched by a browser) and streams each request's PCM back on the
//! same channel.
//!
//! ## Half-Duplex Discipline:
//! Exactly one session streams at a time. While it streams the input side is
//! still read, so that:
//! - a request arriving early is queued and served after the current session ends
//! - end of input means "no more requests"; the current session still finishes
//! - corrupt input fails the current session and ends the loop
//!
//! ## Per-Session Output:
//! PCM frames, then either an empty end-of-session marker or one
//! `{ "message" }` error frame.

use crate::codec::{FrameReader, FrameWriter};
use crate::config::{AppConfig, SessionConfig};
use crate::engine::EngineLauncher;
use crate::error::{RelayError, RelayResult};
use crate::protocol::SpeechRequest;
use crate::relay::pump_engine_to_transport;
use crate::session::{AbortOrigin, CancelToken, Session, SessionController};
use crate::state::HostState;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

fn parse_request(payload: &[u8], rules: &SessionConfig) -> RelayResult<SpeechRequest> {
    let request = SpeechRequest::from_payload(payload)?;
    request.validate(rules)?;
    Ok(request)
}

/// Run one session's producer side: start the engine, relay its output as
/// frames, then send the end-of-session marker.
///
/// The engine is killed if relaying stops early for any reason.
pub async fn run_host_session<W>(
    writer: &mut FrameWriter<W>,
    launcher: &dyn EngineLauncher,
    request: &SpeechRequest,
    controller: &SessionController,
    config: &AppConfig,
) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
{
    controller.begin();
    let token = controller.token();
    let encoding = config.transport.pcm_payload;

    let mut process = tokio::select! {
        biased;
        _ = token.cancelled() => {
            return Err(RelayError::Aborted("cancelled before engine start".to_string()));
        }
        launched = launcher.launch(request) => launched?,
    };
    debug!(session_id = %controller.session().id, pid = ?process.pid(), "Relaying engine output");

    let result = pump_engine_to_transport(
        process.as_mut(),
        writer,
        encoding,
        controller.session(),
        &token,
        config.transport.read_chunk_bytes,
    )
    .await;

    if result.is_err() {
        if let Err(e) = process.kill().await {
            warn!(
                session_id = %controller.session().id,
                pid = ?process.pid(),
                error = %e,
                "Failed to stop engine"
            );
        }
        return result;
    }

    writer.send(&encoding.encode_pcm(&[])?).await?;
    Ok(())
}

/// Serve requests until the input closes, `shutdown` is cancelled, or (with
/// `single_session`) the first session ends.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    launcher: &dyn EngineLauncher,
    config: &AppConfig,
    state: &HostState,
    shutdown: &CancelToken,
) -> RelayResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(
        reader,
        config.transport.max_frame_bytes,
        config.transport.read_chunk_bytes,
    );
    let mut writer = FrameWriter::new(writer, config.transport.max_frame_bytes);
    let mut queued: VecDeque<Vec<u8>> = VecDeque::new();
    let mut input_open = true;

    loop {
        let payload = match queued.pop_front() {
            Some(payload) => payload,
            None if !input_open => break,
            None => {
                let frame = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    frame = reader.next_frame() => frame?,
                };
                match frame {
                    Some(payload) => payload,
                    None => {
                        debug!("Input closed");
                        break;
                    }
                }
            }
        };

        let request = match parse_request(&payload, &config.session) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Rejected request");
                state.record_rejected();
                writer.send(&config.transport.pcm_payload.encode_error(&e)).await?;
                continue;
            }
        };

        let controller = SessionController::new(Session::new(&request));
        state.record_started();
        let mut input_error = None;

        let outcome = {
            let session = run_host_session(&mut writer, launcher, &request, &controller, config);
            tokio::pin!(session);
            let mut shutdown_seen = false;

            loop {
                tokio::select! {
                    biased;
                    result = &mut session => break result,
                    _ = shutdown.cancelled(), if !shutdown_seen => {
                        shutdown_seen = true;
                        controller.abort(AbortOrigin::External, "host shutting down");
                    }
                    frame = reader.next_frame(), if input_open => match frame {
                        Ok(Some(next)) => {
                            debug!(queued = queued.len() + 1, "Request queued behind active session");
                            queued.push_back(next);
                        }
                        Ok(None) => {
                            debug!("Input closed while streaming");
                            input_open = false;
                        }
                        Err(e) => {
                            input_open = false;
                            controller.fail(AbortOrigin::External, &e);
                            input_error = Some(e);
                        }
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                controller.complete();
            }
            Err(e) => {
                // Only the error that ended the session is reported to the caller
                if controller.fail(AbortOrigin::Producer, &e) && e.is_failure() {
                    writer.send(&config.transport.pcm_payload.encode_error(&e)).await?;
                }
            }
        }

        let report = controller.report();
        state.record_finished(&report);
        info!(
            session_id = %report.id,
            status = %report.status,
            bytes = report.bytes_out,
            elapsed_ms = report.elapsed_ms,
            "Session finished"
        );

        if let Some(e) = input_error {
            return Err(e);
        }
        if shutdown.is_cancelled() || config.session.single_session {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::ScriptedLauncher;
    use crate::protocol::{ErrorMessage, Inbound, PcmEncoding};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    struct Client {
        writer: FrameWriter<DuplexStream>,
        reader: FrameReader<DuplexStream>,
    }

    /// Returns the client ends and the host ends of two pipes.
    fn channel() -> (Client, DuplexStream, DuplexStream) {
        let (client_out, host_in) = tokio::io::duplex(4096);
        let (host_out, client_in) = tokio::io::duplex(4096);
        let client = Client {
            writer: FrameWriter::new(client_out, 1 << 20),
            reader: FrameReader::new(client_in, 1 << 20, 512),
        };
        (client, host_in, host_out)
    }

    impl Client {
        async fn request(&mut self, text: &str, voice: &str) {
            let payload = SpeechRequest::new(text, voice).to_payload().unwrap();
            self.writer.send(&payload).await.unwrap();
        }

        /// Read one session's output: PCM until the marker, or an error.
        async fn session(&mut self) -> (Vec<u8>, Option<String>) {
            let mut pcm = Vec::new();
            loop {
                let payload = self.reader.next_frame().await.unwrap().expect("frame");
                match PcmEncoding::JsonArray.decode(payload).unwrap() {
                    Inbound::Pcm(bytes) if bytes.is_empty() => return (pcm, None),
                    Inbound::Pcm(bytes) => pcm.extend(bytes),
                    Inbound::Error(ErrorMessage { message }) => return (pcm, Some(message)),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_request_streams_pcm_then_marker() {
        let config = AppConfig::default();
        let state = HostState::new();
        let launcher = ScriptedLauncher::emitting(vec![vec![1, 2, 3], vec![4]]);
        let (mut client, host_in, host_out) = channel();

        let shutdown = CancelToken::new();
        let host = serve(host_in, host_out, &launcher, &config, &state, &shutdown);
        let caller = async {
            client.request("Hello there.", "female").await;
            let output = client.session().await;
            client.writer.close().await.unwrap();
            output
        };
        let (served, (pcm, error)) = tokio::join!(host, caller);

        served.unwrap();
        assert_eq!(pcm, vec![1, 2, 3, 4]);
        assert_eq!(error, None);
        let metrics = state.snapshot();
        assert_eq!(metrics.sessions_completed, 1);
        assert_eq!(metrics.bytes_relayed, 4);
    }

    #[tokio::test]
    async fn test_bad_request_gets_error_frame_and_loop_continues() {
        let config = AppConfig::default();
        let state = HostState::new();
        let launcher = ScriptedLauncher::emitting(vec![vec![7, 7]]);
        let (mut client, host_in, host_out) = channel();

        let shutdown = CancelToken::new();
        let host = serve(host_in, host_out, &launcher, &config, &state, &shutdown);
        let caller = async {
            client.request("hi", "robot").await;
            let rejected = client.session().await;
            client.writer.send(b"not json").await.unwrap();
            let malformed = client.session().await;
            client.request("hi", "male").await;
            let served = client.session().await;
            client.writer.close().await.unwrap();
            (rejected, malformed, served)
        };
        let (result, (rejected, malformed, served)) = tokio::join!(host, caller);

        result.unwrap();
        assert!(rejected.1.unwrap().contains("unknown voice"));
        assert!(malformed.1.unwrap().starts_with("bad request"));
        assert_eq!(served, (vec![7, 7], None));
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(state.snapshot().requests_rejected, 2);
    }

    #[tokio::test]
    async fn test_engine_failure_sends_error_after_audio() {
        let config = AppConfig::default();
        let state = HostState::new();
        let mut launcher = ScriptedLauncher::emitting(vec![vec![0, 1]]);
        launcher.exit_error = Some("piper exited with exit status: 1".to_string());
        let (mut client, host_in, host_out) = channel();

        let shutdown = CancelToken::new();
        let host = serve(host_in, host_out, &launcher, &config, &state, &shutdown);
        let caller = async {
            client.request("hi", "male").await;
            let output = client.session().await;
            client.writer.close().await.unwrap();
            output
        };
        let (result, (pcm, error)) = tokio::join!(host, caller);

        result.unwrap();
        assert_eq!(pcm, vec![0, 1]);
        assert_eq!(
            error.as_deref(),
            Some("process error: piper exited with exit status: 1")
        );
        assert_eq!(state.snapshot().sessions_failed, 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_sends_error_without_marker() {
        let config = AppConfig::default();
        let state = HostState::new();
        let mut launcher = ScriptedLauncher::emitting(vec![vec![1, 1]]);
        launcher.spawn_error = Some("failed to spawn ./piper/piper: not found".to_string());
        let (mut client, host_in, host_out) = channel();

        let shutdown = CancelToken::new();
        let host = serve(host_in, host_out, &launcher, &config, &state, &shutdown);
        let caller = async {
            client.request("first", "male").await;
            let first = client.session().await;
            client.request("second", "female").await;
            // A marker after the first error would show up here as an empty session
            let second = client.session().await;
            client.writer.close().await.unwrap();
            (first, second)
        };
        let (result, (first, second)) = tokio::join!(host, caller);

        result.unwrap();
        let expected = Some("process error: failed to spawn ./piper/piper: not found".to_string());
        assert_eq!(first, (Vec::new(), expected.clone()));
        assert_eq!(second, (Vec::new(), expected));
        assert_eq!(launcher.launch_count(), 2);
        assert_eq!(launcher.kill_count(), 0);
        let metrics = state.snapshot();
        assert_eq!(metrics.sessions_started, 2);
        assert_eq!(metrics.sessions_failed, 2);
    }

    #[tokio::test]
    async fn test_raw_engine_failure_reaches_player_as_failure() {
        use crate::audio::sink::MemorySink;
        use crate::config::ClockMode;
        use crate::player::play_transport;

        let mut config = AppConfig::default();
        config.transport.pcm_payload = PcmEncoding::Raw;
        config.audio.clock = ClockMode::Freewheel;
        let state = HostState::new();
        let mut launcher = ScriptedLauncher::emitting(vec![vec![0x10, 0x00, 0x20, 0x00]]);
        launcher.exit_error = Some("piper exited with exit status: 1".to_string());

        let (client_out, host_in) = tokio::io::duplex(4096);
        let (host_out, player_in) = tokio::io::duplex(4096);
        let shutdown = CancelToken::new();

        let host = serve(host_in, host_out, &launcher, &config, &state, &shutdown);
        let caller = async {
            let mut writer = FrameWriter::new(client_out, 1 << 20);
            let request = SpeechRequest::new("hi", "male").to_payload().unwrap();
            writer.send(&request).await.unwrap();
            writer.close().await.unwrap();

            let mut sink = MemorySink::new();
            play_transport(player_in, &mut sink, &config, &shutdown)
                .await
                .unwrap()
        };
        let (result, reports) = tokio::join!(host, caller);

        result.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, "failed");
        assert_eq!(reports[0].error_kind, Some("process"));
        let reason = reports[0].reason.as_deref().unwrap_or_default();
        assert!(reason.contains("piper exited with exit status: 1"), "{}", reason);
        assert_eq!(reports[0].bytes_in, 4);
        assert_eq!(state.snapshot().sessions_failed, 1);
    }

    #[tokio::test]
    async fn test_early_request_is_queued_and_eof_lets_sessions_finish() {
        let config = AppConfig::default();
        let state = HostState::new();
        let mut launcher = ScriptedLauncher::emitting(vec![vec![1, 1], vec![2, 2], vec![3, 3]]);
        launcher.pace = Some(Duration::from_millis(5));
        let (mut client, host_in, host_out) = channel();

        let shutdown = CancelToken::new();
        let host = serve(host_in, host_out, &launcher, &config, &state, &shutdown);
        let caller = async {
            client.request("first", "male").await;
            client.request("second", "female").await;
            client.writer.close().await.unwrap();
            let first = client.session().await;
            let second = client.session().await;
            (first, second)
        };
        let (result, (first, second)) = tokio::join!(host, caller);

        result.unwrap();
        assert_eq!(first, (vec![1, 1, 2, 2, 3, 3], None));
        assert_eq!(second, (vec![1, 1, 2, 2, 3, 3], None));
        assert_eq!(
            launcher.texts.lock().unwrap().as_slice(),
            ["first".to_string(), "second".to_string()]
        );
        assert_eq!(state.snapshot().sessions_completed, 2);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_active_session() {
        let config = AppConfig::default();
        let state = HostState::new();
        let mut launcher = ScriptedLauncher::emitting(vec![vec![5, 5]]);
        launcher.hang = true;
        let shutdown = CancelToken::new();
        let (mut client, host_in, host_out) = channel();

        let host = serve(host_in, host_out, &launcher, &config, &state, &shutdown);
        let caller = async {
            client.request("hi", "male").await;
            let first = client.reader.next_frame().await.unwrap();
            shutdown.cancel();
            // The host exits without another frame and drops its end
            let after = client.reader.next_frame().await.unwrap();
            (first, after)
        };
        let (result, (first, after)) = tokio::join!(host, caller);

        result.unwrap();
        assert_eq!(first, Some(b"[5,5]".to_vec()));
        assert_eq!(after, None);
        assert_eq!(launcher.kill_count(), 1);
        assert_eq!(state.snapshot().sessions_aborted, 1);
    }

    #[tokio::test]
    async fn test_single_session_exits_after_first() {
        let mut config = AppConfig::default();
        config.session.single_session = true;
        config.transport.pcm_payload = PcmEncoding::Raw;
        let state = HostState::new();
        let launcher = ScriptedLauncher::emitting(vec![vec![9; 6]]);
        let (mut client, host_in, host_out) = channel();

        let shutdown = CancelToken::new();
        let host = serve(host_in, host_out, &launcher, &config, &state, &shutdown);
        let caller = async {
            client.request("hi", "male").await;
            let pcm = client.reader.next_frame().await.unwrap();
            let marker = client.reader.next_frame().await.unwrap();
            let closed = client.reader.next_frame().await.unwrap();
            (pcm, marker, closed)
        };
        let (result, (pcm, marker, closed)) = tokio::join!(host, caller);

        result.unwrap();
        let mut tagged = vec![crate::protocol::RAW_PCM_TAG];
        tagged.extend([9; 6]);
        assert_eq!(pcm, Some(tagged));
        assert_eq!(marker, Some(Vec::new()));
        assert_eq!(closed, None);
    }

    #[tokio::test]
    async fn test_corrupt_input_fails_session_and_ends_loop() {
        use crate::codec::encode;
        use tokio::io::AsyncWriteExt;

        let mut config = AppConfig::default();
        config.transport.max_frame_bytes = 256;
        let state = HostState::new();
        let mut launcher = ScriptedLauncher::emitting(vec![vec![1, 2]]);
        launcher.hang = true;

        let (mut client_out, host_in) = tokio::io::duplex(4096);
        let (host_out, client_in) = tokio::io::duplex(4096);
        let mut client_reader = FrameReader::new(client_in, 1 << 20, 512);

        let shutdown = CancelToken::new();
        let host = serve(host_in, host_out, &launcher, &config, &state, &shutdown);
        let caller = async {
            let request = SpeechRequest::new("hi", "male").to_payload().unwrap();
            client_out.write_all(&encode(&request).unwrap()).await.unwrap();
            let first = client_reader.next_frame().await.unwrap();
            // Header announcing far more than the frame limit
            client_out.write_all(&[0xFF, 0xFF, 0xFF, 0x7F]).await.unwrap();
            let after = client_reader.next_frame().await.unwrap();
            (first, after)
        };
        let (result, (first, after)) = tokio::join!(host, caller);

        assert_eq!(result.unwrap_err().kind(), "framing");
        assert_eq!(first, Some(b"[1,2]".to_vec()));
        assert_eq!(after, None);
        assert_eq!(launcher.kill_count(), 1);
        assert_eq!(state.snapshot().sessions_failed, 1);
    }
}
