//! Messages exchanged with a worker process over its stdin/stdout.
//!
//! Each message is one frame: a little-endian `u32` payload length followed
//! by a MessagePack payload. Stdin carries [`WorkerInput`] (the input
//! queue), stdout carries [`WorkerOutput`] (the output queue).

use crate::audio::AudioChunk;
use crate::defaults::MAX_FRAME_BYTES;
use crate::error::{LivescribeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Audio tagged with the session that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFrame {
    pub session_id: Option<String>,
    pub chunk: AudioChunk,
}

/// Items on a worker's input queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerInput {
    Audio(AudioFrame),
    /// Discard decode state without emitting anything.
    Reset,
    /// Emit whatever is pending as a final result.
    Flush { session_id: Option<String> },
    /// Exit the worker loop.
    Stop,
}

/// One transcription result, or a per-item failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub text: String,
    pub is_final: bool,
    pub model: String,
    pub error: Option<String>,
    /// Session of the audio that produced this result.
    pub session_id: Option<String>,
    /// Time spent processing the item that produced this result.
    pub latency_ms: f64,
    /// Set on the result that answers a `Flush`.
    #[serde(default)]
    pub flushed: bool,
}

impl WorkerResult {
    pub fn transcript(model: &str, text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
            model: model.to_string(),
            error: None,
            session_id: None,
            latency_ms: 0.0,
            flushed: false,
        }
    }

    pub fn failure(model: &str, message: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            is_final: false,
            model: model.to_string(),
            error: Some(message.into()),
            session_id: None,
            latency_ms: 0.0,
            flushed: false,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Items on a worker's output queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerOutput {
    /// Sent once after the model load attempt. `loaded == false` means the
    /// worker runs degraded and ignores audio.
    Ready { model: String, loaded: bool },
    Result(WorkerResult),
}

/// Encode `message` as a length-prefixed frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(message).map_err(|e| LivescribeError::Frame {
        message: format!("encode failed: {e}"),
    })?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(LivescribeError::Frame {
            message: format!(
                "payload of {} bytes exceeds the {MAX_FRAME_BYTES} byte limit",
                payload.len()
            ),
        });
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn payload_len(prefix: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(LivescribeError::Frame {
            message: format!("length prefix {len} exceeds the {MAX_FRAME_BYTES} byte limit"),
        });
    }
    Ok(len)
}

fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    rmp_serde::from_slice(payload).map_err(|e| LivescribeError::Frame {
        message: format!("decode failed: {e}"),
    })
}

fn truncated(what: &str) -> LivescribeError {
    LivescribeError::Frame {
        message: format!("stream ended inside {what}"),
    }
}

/// Write one frame and flush.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(truncated("a length prefix")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let mut payload = vec![0u8; payload_len(prefix)?];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            truncated("a payload")
        } else {
            e.into()
        }
    })?;
    decode_payload(&payload).map(Some)
}

/// Async counterpart of [`write_frame`].
pub async fn write_frame_async<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Async counterpart of [`read_frame`].
pub async fn read_frame_async<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => return Err(truncated("a length prefix")),
            n => filled += n,
        }
    }

    let mut payload = vec![0u8; payload_len(prefix)?];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            truncated("a payload")
        } else {
            LivescribeError::Io(e)
        }
    })?;
    decode_payload(&payload).map(Some)
}
