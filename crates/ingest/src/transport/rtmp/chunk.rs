//! RTMP handshake and chunk stream framing.

use std::{collections::HashMap, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{IngestError, IngestResult};

pub const HANDSHAKE_SIZE: usize = 1536;
pub const DEFAULT_CHUNK_SIZE: usize = 128;

pub const SET_CHUNK_SIZE: u8 = 1;
pub const ABORT: u8 = 2;
pub const ACKNOWLEDGEMENT: u8 = 3;
pub const USER_CONTROL: u8 = 4;
pub const WINDOW_ACK_SIZE: u8 = 5;
pub const SET_PEER_BANDWIDTH: u8 = 6;
pub const AUDIO: u8 = 8;
pub const VIDEO: u8 = 9;
pub const DATA_AMF0: u8 = 18;
pub const COMMAND_AMF0: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub chunk_stream_id: u32,
    pub timestamp: u32,
    pub type_id: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn control(type_id: u8, payload: Bytes) -> Self {
        Self {
            chunk_stream_id: 2,
            timestamp: 0,
            type_id,
            stream_id: 0,
            payload,
        }
    }
}

/// Client side of the simple (unsigned) handshake.
pub async fn handshake<S>(stream: &mut S) -> IngestResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
    c0c1[0] = 3;
    // time and zero fields stay zero, the rest is filler
    for (i, b) in c0c1[9..].iter_mut().enumerate() {
        *b = (i * 7 + 13) as u8;
    }
    stream.write_all(&c0c1).await?;
    stream.flush().await?;

    let mut s0s1 = vec![0u8; 1 + HANDSHAKE_SIZE];
    stream.read_exact(&mut s0s1).await?;
    if s0s1[0] != 3 {
        return Err(IngestError::Dial(format!(
            "unsupported RTMP version {}",
            s0s1[0]
        )));
    }
    let mut s2 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s2).await?;

    // C2 echoes S1
    stream.write_all(&s0s1[1..]).await?;
    stream.flush().await?;
    Ok(())
}

#[derive(Default)]
struct ChunkState {
    timestamp: u32,
    delta: u32,
    length: usize,
    type_id: u8,
    stream_id: u32,
    extended: bool,
    buffer: BytesMut,
}

/// Reassembles messages from interleaved chunks.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    streams: HashMap<u32, ChunkState>,
    bytes_read: u64,
    idle_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            bytes_read: 0,
            idle_timeout: None,
        }
    }

    /// Every read that waits longer than `timeout` fails with a stream error.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = Some(timeout);
    }

    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    async fn fill(&mut self, buf: &mut [u8]) -> IngestResult<()> {
        let read = self.reader.read_exact(buf);
        let result = match self.idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, read).await.map_err(|_| {
                IngestError::Stream(format!("RTMP connection idle for {timeout:?}"))
            })?,
            None => read.await,
        };
        result.map_err(|e| IngestError::Stream(format!("RTMP read failed: {e}")))?;
        self.bytes_read += buf.len() as u64;
        Ok(())
    }

    async fn read_u24(&mut self) -> IngestResult<u32> {
        let mut b = [0u8; 3];
        self.fill(&mut b).await?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub async fn read_message(&mut self) -> IngestResult<Message> {
        loop {
            if let Some(message) = self.read_chunk().await? {
                return Ok(message);
            }
        }
    }

    async fn read_chunk(&mut self) -> IngestResult<Option<Message>> {
        let mut first = [0u8; 1];
        self.fill(&mut first).await?;
        let fmt = first[0] >> 6;
        let chunk_stream_id = match first[0] & 0x3f {
            0 => {
                let mut b = [0u8; 1];
                self.fill(&mut b).await?;
                64 + b[0] as u32
            }
            1 => {
                let mut b = [0u8; 2];
                self.fill(&mut b).await?;
                64 + b[0] as u32 + b[1] as u32 * 256
            }
            id => id as u32,
        };

        let mut state = self.streams.remove(&chunk_stream_id).unwrap_or_default();
        let starts_message = state.buffer.is_empty();

        let mut raw_time = None;
        if fmt <= 2 {
            raw_time = Some(self.read_u24().await?);
        }
        if fmt <= 1 {
            state.length = self.read_u24().await? as usize;
            let mut type_id = [0u8; 1];
            self.fill(&mut type_id).await?;
            state.type_id = type_id[0];
        }
        if fmt == 0 {
            let mut stream_id = [0u8; 4];
            self.fill(&mut stream_id).await?;
            state.stream_id = u32::from_le_bytes(stream_id);
        }

        let time = match raw_time {
            Some(raw) => {
                state.extended = raw == 0xff_ffff;
                if state.extended {
                    let mut ext = [0u8; 4];
                    self.fill(&mut ext).await?;
                    Some(u32::from_be_bytes(ext))
                } else {
                    Some(raw)
                }
            }
            None => {
                if state.extended {
                    let mut ext = [0u8; 4];
                    self.fill(&mut ext).await?;
                }
                None
            }
        };

        if starts_message {
            match (fmt, time) {
                (0, Some(absolute)) => {
                    state.timestamp = absolute;
                    state.delta = 0;
                }
                (_, Some(delta)) => {
                    state.delta = delta;
                    state.timestamp = state.timestamp.wrapping_add(delta);
                }
                _ => state.timestamp = state.timestamp.wrapping_add(state.delta),
            }
        }

        let wanted = state
            .length
            .saturating_sub(state.buffer.len())
            .min(self.chunk_size);
        let mut payload = vec![0u8; wanted];
        self.fill(&mut payload).await?;
        state.buffer.extend_from_slice(&payload);

        let message = if state.buffer.len() >= state.length {
            Some(Message {
                chunk_stream_id,
                timestamp: state.timestamp,
                type_id: state.type_id,
                stream_id: state.stream_id,
                payload: state.buffer.split().freeze(),
            })
        } else {
            None
        };
        self.streams.insert(chunk_stream_id, state);
        Ok(message)
    }

    pub fn abort(&mut self, chunk_stream_id: u32) {
        if let Some(state) = self.streams.get_mut(&chunk_stream_id) {
            state.buffer.clear();
        }
    }
}

/// Splits messages into chunks: a full header first, then type-3 headers.
pub struct ChunkWriter<W> {
    writer: W,
    chunk_size: usize,
}

impl<W: AsyncWrite + Unpin> ChunkWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Announces and applies a new outgoing chunk size.
    pub async fn set_chunk_size(&mut self, size: u32) -> IngestResult<()> {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(size & 0x7fff_ffff);
        self.write_message(&Message::control(SET_CHUNK_SIZE, payload.freeze()))
            .await?;
        self.chunk_size = size as usize;
        Ok(())
    }

    pub async fn write_message(&mut self, message: &Message) -> IngestResult<()> {
        let mut buf = BytesMut::with_capacity(message.payload.len() + 16);
        let basic = |buf: &mut BytesMut, fmt: u8| {
            let id = message.chunk_stream_id;
            if id < 64 {
                buf.put_u8((fmt << 6) | id as u8);
            } else if id < 320 {
                buf.put_u8(fmt << 6);
                buf.put_u8((id - 64) as u8);
            } else {
                buf.put_u8((fmt << 6) | 1);
                buf.put_u16_le((id - 64) as u16);
            }
        };

        let extended = message.timestamp >= 0xff_ffff;
        basic(&mut buf, 0);
        let time_field = if extended { 0xff_ffff } else { message.timestamp };
        buf.put_uint(time_field as u64, 3);
        buf.put_uint(message.payload.len() as u64, 3);
        buf.put_u8(message.type_id);
        buf.put_u32_le(message.stream_id);
        if extended {
            buf.put_u32(message.timestamp);
        }

        for (i, chunk) in message.payload.chunks(self.chunk_size).enumerate() {
            if i > 0 {
                basic(&mut buf, 3);
                if extended {
                    buf.put_u32(message.timestamp);
                }
            }
            buf.put_slice(chunk);
        }

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
