// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Framed message codec (§4.A): `type[4] || length[i32 BE] || seq[i32 BE] || payload`.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame's payload, guards against memory exhaustion from a
/// malicious or buggy peer (mirrors the size-capped decode pattern used elsewhere
/// in this codebase for untrusted input).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io")]
    Io,
    #[error("frame type must be 4 ASCII bytes")]
    BadType,
    #[error("declared frame length {0} exceeds the maximum of {MAX_FRAME_LEN}")]
    TooLarge(usize),
    #[error("stream ended mid-frame")]
    Truncated,
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Io
        }
    }
}

/// A single decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame type, normalized to uppercase ASCII.
    pub frame_type: [u8; 4],
    /// Per-conversation monotonic sequence number.
    pub seq: i32,
    /// Frame payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, uppercasing the type tag.
    pub fn new(frame_type: &[u8; 4], seq: i32, payload: Vec<u8>) -> Self {
        let mut t = *frame_type;
        t.make_ascii_uppercase();
        Self { frame_type: t, seq, payload }
    }

    /// Frame type as a `&str`, for dispatch-table lookups.
    pub fn type_str(&self) -> &str {
        std::str::from_utf8(&self.frame_type).unwrap_or("????")
    }

    /// Encode to the wire representation.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.payload.len() > MAX_FRAME_LEN {
            return Err(CodecError::TooLarge(self.payload.len()));
        }
        let mut out = Vec::with_capacity(4 + 4 + 4 + self.payload.len());
        out.extend_from_slice(&self.frame_type);
        out.extend_from_slice(&(self.payload.len() as i32).to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Write one frame to an async writer and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), CodecError> {
    let bytes = frame.encode()?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

/// Read exactly one frame from an async reader, or `Err(Truncated)` if the stream
/// ends before a complete frame arrives.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, CodecError> {
    let mut header = [0u8; 12];
    r.read_exact(&mut header).await?;

    let mut frame_type = [0u8; 4];
    frame_type.copy_from_slice(&header[0..4]);
    frame_type.make_ascii_uppercase();

    let length = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let seq = i32::from_be_bytes([header[8], header[9], header[10], header[11]]);

    if length < 0 || length as usize > MAX_FRAME_LEN {
        return Err(CodecError::TooLarge(length.max(0) as usize));
    }

    let mut payload = vec![0u8; length as usize];
    r.read_exact(&mut payload).await?;

    Ok(Frame { frame_type, seq, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let frame = Frame::new(b"hrtb", 7, b"".to_vec());
        let bytes = frame.encode().unwrap();
        let mut cursor = Cursor::new(bytes);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.frame_type, *b"HRTB");
        assert_eq!(decoded.seq, 7);
        assert!(decoded.payload.is_empty());
    }

    #[tokio::test]
    async fn round_trips_a_payload() {
        let frame = Frame::new(b"SUPD", 1, br#"{"services":{}}"#.to_vec());
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn truncated_stream_is_rejected() {
        let mut bytes = Frame::new(b"META", 0, vec![1, 2, 3, 4]).encode().unwrap();
        bytes.truncate(bytes.len() - 1);
        let mut cursor = Cursor::new(bytes);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_allocating() {
        let mut header = Vec::new();
        header.extend_from_slice(b"META");
        header.extend_from_slice(&((MAX_FRAME_LEN as i32) + 1).to_be_bytes());
        header.extend_from_slice(&0i32.to_be_bytes());
        let mut cursor = Cursor::new(header);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CodecError::TooLarge(_)));
    }
}
