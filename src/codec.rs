//! # Length-Prefixed Frame Codec
//!
//! Every message on the duplex channel is `[u32 little-endian length][payload]`.
//! This is the Native Messaging wire format, so the same codec talks to a
//! browser, to another `piper-relay` process, or to an in-memory pipe.
//!
//! ## Decoder State Machine:
//! - **AwaitingHeader**: accumulating toward the 4 header bytes
//! - **AccumulatingPayload**: accumulating toward `length` payload bytes
//!
//! Reads arrive in arbitrary chunks: a chunk may split the header, split the
//! payload, end exactly on a frame boundary or hold several frames. The
//! decoder buffers whatever is incomplete and only ever yields whole payloads.
//! Emitted frames advance a cursor; the consumed prefix is dropped at the
//! next `feed`, so a chunk holding many small frames is decoded in one pass.

use crate::error::{RelayError, RelayResult};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Encode the 4-byte little-endian length prefix for a payload.
pub fn encode_header(payload_len: usize) -> RelayResult<[u8; HEADER_LEN]> {
    let len = u32::try_from(payload_len).map_err(|_| {
        RelayError::Framing(format!("payload of {} bytes does not fit a u32 length", payload_len))
    })?;
    let mut header = [0u8; HEADER_LEN];
    LittleEndian::write_u32(&mut header, len);
    Ok(header)
}

/// Encode one frame: the length prefix followed by the payload.
///
/// The output is always `4 + payload.len()` bytes.
pub fn encode(payload: &[u8]) -> RelayResult<Vec<u8>> {
    let header = encode_header(payload.len())?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeader,
    AccumulatingPayload { length: usize },
    /// An oversized header was seen; the stream cannot be resynchronised
    Corrupt,
}

/// Streaming frame decoder.
///
/// ## Usage Example:
/// ```rust
/// use piper_relay::codec::{encode, FrameDecoder};
///
/// let frame = encode(b"hello").unwrap();
/// let mut decoder = FrameDecoder::new(1024);
///
/// // The header arrives split across two reads
/// assert_eq!(decoder.feed(&frame[..2]).count(), 0);
/// let payloads: Vec<Vec<u8>> = decoder.feed(&frame[2..]).collect::<Result<_, _>>().unwrap();
/// assert_eq!(payloads, vec![b"hello".to_vec()]);
/// assert!(decoder.finish().is_ok());
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    buffer: Vec<u8>,
    /// Start of the unconsumed bytes in `buffer`
    cursor: usize,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            buffer: Vec::new(),
            cursor: 0,
            max_frame_len,
        }
    }

    /// Append a chunk and return the frames it completes.
    ///
    /// The returned iterator is lazy: frames are cut out of the buffer as it is
    /// advanced. Frames that are not pulled stay buffered and come out of the
    /// next `feed` call, so dropping the iterator early loses nothing.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        if self.state != DecodeState::Corrupt {
            // Consumed bytes are dropped once per call, not once per frame
            if self.cursor > 0 {
                self.buffer.drain(..self.cursor);
                self.cursor = 0;
            }
            self.buffer.extend_from_slice(chunk);
        }
        Frames { decoder: self }
    }

    /// Bytes held toward an incomplete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// Check that the stream ended on a frame boundary.
    ///
    /// Called when the channel closes. A partial header or payload is a
    /// truncated frame.
    pub fn finish(&self) -> RelayResult<()> {
        match self.state {
            DecodeState::AwaitingHeader if self.pending() == 0 => Ok(()),
            DecodeState::AwaitingHeader => Err(RelayError::Framing(format!(
                "channel closed mid-header: {} of {} bytes",
                self.pending(),
                HEADER_LEN
            ))),
            DecodeState::AccumulatingPayload { length } => Err(RelayError::Framing(format!(
                "channel closed mid-payload: {} of {} bytes",
                self.pending(),
                length
            ))),
            DecodeState::Corrupt => Err(RelayError::Framing(
                "channel closed after a malformed frame".to_string(),
            )),
        }
    }

    fn next_frame(&mut self) -> Option<RelayResult<Vec<u8>>> {
        loop {
            match self.state {
                DecodeState::Corrupt => return None,
                DecodeState::AwaitingHeader => {
                    if self.pending() < HEADER_LEN {
                        return None;
                    }
                    let header = &self.buffer[self.cursor..self.cursor + HEADER_LEN];
                    let length = LittleEndian::read_u32(header) as usize;
                    if length > self.max_frame_len {
                        self.state = DecodeState::Corrupt;
                        self.buffer = Vec::new();
                        self.cursor = 0;
                        return Some(Err(RelayError::Framing(format!(
                            "frame announces {} bytes, limit is {}",
                            length, self.max_frame_len
                        ))));
                    }
                    self.cursor += HEADER_LEN;
                    self.state = DecodeState::AccumulatingPayload { length };
                }
                DecodeState::AccumulatingPayload { length } => {
                    if self.pending() < length {
                        return None;
                    }
                    let payload = self.buffer[self.cursor..self.cursor + length].to_vec();
                    self.cursor += length;
                    if self.cursor == self.buffer.len() {
                        self.buffer.clear();
                        self.cursor = 0;
                    }
                    self.state = DecodeState::AwaitingHeader;
                    return Some(Ok(payload));
                }
            }
        }
    }
}

/// Frames completed by one [`FrameDecoder::feed`] call.
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = RelayResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}

/// Reads whole frames from an async byte source.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    ready: VecDeque<Vec<u8>>,
    /// Decode error held back until the frames read before it are delivered
    failed: Option<RelayError>,
    closed: bool,
    chunk: Vec<u8>,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_len: usize, read_chunk: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(max_frame_len),
            ready: VecDeque::new(),
            failed: None,
            closed: false,
            chunk: vec![0u8; read_chunk.max(1)],
            bytes_read: 0,
        }
    }

    /// Next payload, or `None` once the channel closed on a frame boundary.
    ///
    /// Frames come out in channel order; a decode error is returned only after
    /// every whole frame before it. Cancel-safe: state only changes after a
    /// read completes, so the future can be dropped inside `tokio::select!`
    /// without losing bytes.
    pub async fn next_frame(&mut self) -> RelayResult<Option<Vec<u8>>> {
        loop {
            if let Some(payload) = self.ready.pop_front() {
                return Ok(Some(payload));
            }
            if let Some(err) = self.failed.take() {
                return Err(err);
            }
            if self.closed {
                self.decoder.finish()?;
                return Ok(None);
            }
            self.fill().await?;
        }
    }

    /// Wait until `next_frame` has something to return without reading.
    ///
    /// `false` means the channel closed cleanly with nothing left. A pending
    /// decode error counts as something to return. Cancel-safe.
    pub async fn has_next(&mut self) -> RelayResult<bool> {
        loop {
            if !self.ready.is_empty() || self.failed.is_some() {
                return Ok(true);
            }
            if self.closed {
                return Ok(self.decoder.finish().is_err());
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> RelayResult<()> {
        let n = self.reader.read(&mut self.chunk).await?;
        if n == 0 {
            self.closed = true;
            return Ok(());
        }
        self.bytes_read += n as u64;

        for frame in self.decoder.feed(&self.chunk[..n]) {
            match frame {
                Ok(payload) => self.ready.push_back(payload),
                Err(e) => {
                    self.failed = Some(e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Raw bytes read from the channel so far, headers included.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Writes frames to an async byte sink.
pub struct FrameWriter<W> {
    writer: W,
    max_frame_len: usize,
    frames_written: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, max_frame_len: usize) -> Self {
        Self {
            writer,
            max_frame_len,
            frames_written: 0,
        }
    }

    /// Send one payload as a frame and flush it.
    pub async fn send(&mut self, payload: &[u8]) -> RelayResult<()> {
        if payload.len() > self.max_frame_len {
            return Err(RelayError::Framing(format!(
                "refusing to send {} byte frame, limit is {}",
                payload.len(),
                self.max_frame_len
            )));
        }
        let header = encode_header(payload.len())?;
        self.writer.write_all(&header).await?;
        self.writer.write_all(payload).await?;
        self.writer.flush().await?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Flush and shut down the underlying writer, signalling end of stream.
    pub async fn close(&mut self) -> RelayResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
