//! # Stream Relay
//!
//! The two pumps that move PCM across the channel:
//!
//! - [`pump_engine_to_transport`]: engine output → frames on the outbound channel
//! - [`pump_transport_to_ring`]: frames from the inbound channel → ring buffer
//!
//! Both check the session token before every read and every write and park
//! their reads in `tokio::select!` against cancellation, so an abort halts a
//! pump within one chunk. A frame that has started going out is always
//! finished: a half-written frame would desynchronise the channel for the
//! next session.

use crate::audio::buffer::SharedRingBuffer;
use crate::codec::{FrameReader, FrameWriter};
use crate::engine::EngineProcess;
use crate::error::{RelayError, RelayResult};
use crate::protocol::{Inbound, PcmEncoding};
use crate::session::{CancelToken, Session};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

fn check(token: &CancelToken, stage: &str) -> RelayResult<()> {
    if token.is_cancelled() {
        return Err(RelayError::Aborted(format!("cancelled during {}", stage)));
    }
    Ok(())
}

/// Relay engine output to the channel until the engine closes its output,
/// then wait for it to exit.
///
/// Each engine read becomes one frame. `bytes_out` counts PCM bytes, not
/// frame bytes.
pub async fn pump_engine_to_transport<W>(
    process: &mut dyn EngineProcess,
    writer: &mut FrameWriter<W>,
    encoding: PcmEncoding,
    session: &Session,
    token: &CancelToken,
    chunk_size: usize,
) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; chunk_size.max(1)];
    loop {
        check(token, "engine read")?;
        let n = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RelayError::Aborted("cancelled during engine read".to_string())),
            read = process.read(&mut chunk) => read?,
        };
        if n == 0 {
            break;
        }

        check(token, "frame write")?;
        let payload = encoding.encode_pcm(&chunk[..n])?;
        writer.send(&payload).await?;
        session.add_bytes_out(n);
        trace!(session_id = %session.id, bytes = n, "Relayed engine chunk");
    }

    debug!(session_id = %session.id, bytes = session.bytes_out(), "Engine output closed");
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(RelayError::Aborted("cancelled waiting for engine exit".to_string())),
        exit = process.wait() => exit,
    }
}

/// How an inbound stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The host sent its end-of-session marker; the channel may carry more sessions
    Marker,
    /// The channel closed
    Closed,
}

/// Feed inbound PCM frames into the ring buffer until the stream ends.
///
/// On a clean end the ring is marked finished so the renderer can report
/// end-of-stream once the remaining bytes are played. An error frame from
/// the host becomes a process error.
pub async fn pump_transport_to_ring<R>(
    reader: &mut FrameReader<R>,
    encoding: PcmEncoding,
    ring: &SharedRingBuffer,
    session: &Session,
    token: &CancelToken,
) -> RelayResult<StreamEnd>
where
    R: AsyncRead + Unpin,
{
    loop {
        check(token, "frame read")?;
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RelayError::Aborted("cancelled during frame read".to_string())),
            frame = reader.next_frame() => frame?,
        };

        let end = match frame {
            None => Some(StreamEnd::Closed),
            Some(payload) => match encoding.decode(payload)? {
                Inbound::Pcm(pcm) if pcm.is_empty() => Some(StreamEnd::Marker),
                Inbound::Pcm(pcm) => {
                    check(token, "ring append")?;
                    ring.append(&pcm)?;
                    session.add_bytes_in(pcm.len());
                    None
                }
                Inbound::Error(message) => return Err(RelayError::Process(message.message)),
            },
        };

        if let Some(end) = end {
            ring.finish();
            session.mark_end_of_stream();
            debug!(session_id = %session.id, bytes = session.bytes_in(), ?end, "Inbound stream ended");
            return Ok(end);
        }
    }
}
