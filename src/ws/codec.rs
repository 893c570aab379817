//! Frame encoding and decoding over an upgraded byte stream.
//!
//! Frame layout (RFC 6455 section 5.2):
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |  Masking-key, if MASK set to 1 |          Payload Data         |
//! +--------------------------------+-------------------------------+
//! ```
//!
//! Frames written by this client are always FIN-complete and masked with a fresh
//! random key. Incoming control frames are handled here: pings are answered with
//! pongs, pongs are swallowed, and close frames are answered and surfaced as
//! [`Message::Close`].

use std::sync::Arc;

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;
use tracing::trace;

use crate::{AgentError, Result};

/// Largest payload accepted or produced (32 MiB).
pub const MAX_FRAME_SIZE: u64 = 32 * 1024 * 1024;

/// Close status sent when answering a close frame.
pub const CLOSE_NORMAL: u16 = 1000;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    /// Decode the low nibble of the first header byte.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0f {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(bits) => bits & 0x0f,
        }
    }
}

/// A data frame or end-of-stream signal delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text payload. Bytes are not UTF-8 validated here.
    Text(Vec<u8>),
    Binary(Vec<u8>),
    /// Peer closed the connection; carries the original close payload.
    Close(Vec<u8>),
    /// Any other FIN-complete frame (continuation or reserved opcodes).
    Other { opcode: u8, payload: Vec<u8> },
}

/// XOR `payload` in place with `key`, cycling the key every four bytes.
///
/// Masking is its own inverse, so the same call unmasks.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Encode one FIN-complete frame.
///
/// With `mask = Some(key)` the mask bit is set, the key follows the length
/// field, and the payload is masked. Servers (and tests standing in for one)
/// pass `None`.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(14 + len);
    frame.push(0x80 | opcode.bits());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len <= 125 {
        frame.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    let body_start = match mask {
        Some(key) => {
            frame.extend_from_slice(&key);
            frame.len()
        }
        None => frame.len(),
    };
    frame.extend_from_slice(payload);
    if let Some(key) = mask {
        apply_mask(&mut frame[body_start..], key);
    }
    frame
}

/// Build a close payload: big-endian status code followed by a UTF-8 reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Write side of a connection. Cheap to clone; every clone shares one send lock
/// so concurrent writers never interleave bytes of two frames.
pub struct FrameWriter<S> {
    sink: Arc<Mutex<WriteHalf<S>>>,
}

impl<S> Clone for FrameWriter<S> {
    fn clone(&self) -> Self {
        Self { sink: Arc::clone(&self.sink) }
    }
}

impl<S> FrameWriter<S>
where
    S: AsyncRead + AsyncWrite,
{
    fn new(sink: WriteHalf<S>) -> Self {
        Self { sink: Arc::new(Mutex::new(sink)) }
    }

    /// Mask and write one frame as a single unit.
    pub async fn send(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > MAX_FRAME_SIZE {
            return Err(AgentError::FrameTooLarge {
                size: payload.len() as u64,
                max: MAX_FRAME_SIZE,
            });
        }
        let frame = encode_frame(opcode, payload, Some(rand::random()));

        let mut sink = self.sink.lock().await;
        sink.write_all(&frame).await.map_err(|e| AgentError::io("frame write", e))?;
        sink.flush().await.map_err(|e| AgentError::io("frame flush", e))?;
        trace!(opcode = ?opcode, len = payload.len(), "frame written");
        Ok(())
    }

    pub async fn send_text(&self, payload: &[u8]) -> Result<()> {
        self.send(Opcode::Text, payload).await
    }

    pub async fn send_ping(&self, payload: &[u8]) -> Result<()> {
        self.send(Opcode::Ping, payload).await
    }

    pub async fn send_pong(&self, payload: &[u8]) -> Result<()> {
        self.send(Opcode::Pong, payload).await
    }

    pub async fn send_close(&self, code: u16, reason: &str) -> Result<()> {
        self.send(Opcode::Close, &close_payload(code, reason)).await
    }

    /// Shut down the write side of the stream. Safe to call repeatedly and
    /// after errors.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.shutdown().await {
            trace!(error = %e, "shutdown after close");
        }
    }
}

/// Read side of a connection. Owned by exactly one task.
pub struct FrameReader<S> {
    source: BufReader<ReadHalf<S>>,
    writer: FrameWriter<S>,
}

impl<S> FrameReader<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Block until the next data frame or close arrives.
    ///
    /// Pings are answered and pongs dropped without returning. A close frame is
    /// answered with a normal close and returned as [`Message::Close`].
    pub async fn read_message(&mut self) -> Result<Message> {
        loop {
            let (opcode, payload) = self.read_frame().await?;
            match opcode {
                Opcode::Ping => {
                    trace!(len = payload.len(), "ping received");
                    self.writer.send_pong(&payload).await?;
                }
                Opcode::Pong => trace!("pong received"),
                Opcode::Close => {
                    if let Err(e) = self.writer.send_close(CLOSE_NORMAL, "bye").await {
                        trace!(error = %e, "close reply failed");
                    }
                    return Ok(Message::Close(payload));
                }
                Opcode::Text => return Ok(Message::Text(payload)),
                Opcode::Binary => return Ok(Message::Binary(payload)),
                other => return Ok(Message::Other { opcode: other.bits(), payload }),
            }
        }
    }

    /// Handle to the paired writer.
    pub fn writer(&self) -> FrameWriter<S> {
        self.writer.clone()
    }

    async fn read_frame(&mut self) -> Result<(Opcode, Vec<u8>)> {
        let mut head = [0u8; 2];
        self.read_exact(&mut head).await?;

        let fin = head[0] & 0x80 != 0;
        let opcode = Opcode::from_bits(head[0]);
        if !fin {
            return Err(AgentError::Fragmented);
        }

        let masked = head[1] & 0x80 != 0;
        let len = match head[1] & 0x7f {
            126 => {
                let mut ext = [0u8; 2];
                self.read_exact(&mut ext).await?;
                u64::from(u16::from_be_bytes(ext))
            }
            127 => {
                let mut ext = [0u8; 8];
                self.read_exact(&mut ext).await?;
                u64::from_be_bytes(ext)
            }
            short => u64::from(short),
        };
        if len > MAX_FRAME_SIZE {
            return Err(AgentError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE });
        }

        let mut key = [0u8; 4];
        if masked {
            self.read_exact(&mut key).await?;
        }

        let mut payload = vec![0u8; len as usize];
        self.read_exact(&mut payload).await?;
        if masked {
            apply_mask(&mut payload, key);
        }
        Ok((opcode, payload))
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.source.read_exact(buf).await.map_err(|e| AgentError::io("frame read", e))?;
        Ok(())
    }
}

/// An established connection: one reader, one shareable writer.
pub struct WsConnection<S> {
    reader: FrameReader<S>,
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap a stream that has already been upgraded.
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_parts(BufReader::new(read_half), write_half)
    }

    /// Reassemble from halves whose read buffer may already hold frame bytes.
    pub(crate) fn from_parts(source: BufReader<ReadHalf<S>>, sink: WriteHalf<S>) -> Self {
        let writer = FrameWriter::new(sink);
        Self { reader: FrameReader { source, writer } }
    }

    pub fn writer(&self) -> FrameWriter<S> {
        self.reader.writer()
    }

    pub async fn read_message(&mut self) -> Result<Message> {
        self.reader.read_message().await
    }

    pub fn into_split(self) -> (FrameReader<S>, FrameWriter<S>) {
        let writer = self.reader.writer();
        (self.reader, writer)
    }
}
