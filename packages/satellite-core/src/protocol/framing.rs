//! Wyoming wire framing codec (C1, §4.1).
//!
//! A frame is `header_line ("\n"-terminated JSON) + optional data_line (JSON)
//! + optional payload (raw bytes)`. The header carries `type`, and optionally
//! `data_length`/`payload_length` byte counts for the two trailing sections.

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::FramingError;
use crate::events::EventEnvelope;

/// A decoded frame: the parsed header/data merged into an [`EventEnvelope`],
/// plus the raw payload bytes if one was attached.
#[derive(Debug, Clone)]
pub struct Frame {
    pub envelope: EventEnvelope,
    pub payload: Option<Bytes>,
}

impl Frame {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            envelope: EventEnvelope::new(kind),
            payload: None,
        }
    }

    pub fn with_data(kind: impl Into<String>, data: Value) -> Self {
        Self {
            envelope: EventEnvelope::with_data(kind, data),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Header<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_length: Option<usize>,
}

/// Reads one complete frame from `reader`. Returns `Ok(None)` on a clean EOF
/// at a frame boundary (the peer closed the connection); any other failure
/// is [`FramingError`], fatal for the containing connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FramingError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let header_line = match read_line(reader).await? {
        Some(line) => line,
        None => return Ok(None),
    };

    #[derive(serde::Deserialize)]
    struct RawHeader {
        #[serde(rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        data_length: Option<usize>,
        #[serde(default)]
        payload_length: Option<usize>,
    }

    let raw: RawHeader = serde_json::from_str(header_line.trim_end())?;
    let kind = raw.kind.ok_or(FramingError::MissingType)?;

    let data = match raw.data_length {
        Some(0) | None => None,
        Some(n) => {
            let mut buf = vec![0u8; n];
            read_exact_or_short(reader, &mut buf, "data").await?;
            Some(serde_json::from_slice::<Value>(&buf)?)
        }
    };

    let payload = match raw.payload_length {
        Some(0) | None => None,
        Some(n) => {
            let mut buf = vec![0u8; n];
            read_exact_or_short(reader, &mut buf, "payload").await?;
            Some(Bytes::from(buf))
        }
    };

    Ok(Some(Frame {
        envelope: EventEnvelope {
            kind,
            data,
            payload_length: raw.payload_length,
        },
        payload,
    }))
}

/// Writes one complete frame to `writer`.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FramingError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let data_bytes = match &frame.envelope.data {
        Some(v) => Some(serde_json::to_vec(v)?),
        None => None,
    };
    let payload_len = frame.payload.as_ref().map(|p| p.len());

    let header = Header {
        kind: &frame.envelope.kind,
        data_length: data_bytes.as_ref().map(|b| b.len()),
        payload_length: payload_len,
    };
    let mut header_line = serde_json::to_vec(&header)?;
    header_line.push(b'\n');

    writer
        .write_all(&header_line)
        .await
        .map_err(io_to_framing("header"))?;
    if let Some(data) = &data_bytes {
        writer
            .write_all(data)
            .await
            .map_err(io_to_framing("data"))?;
    }
    if let Some(payload) = &frame.payload {
        writer
            .write_all(payload)
            .await
            .map_err(io_to_framing("payload"))?;
    }
    writer.flush().await.map_err(io_to_framing("flush"))?;
    Ok(())
}

fn io_to_framing(section: &'static str) -> impl Fn(std::io::Error) -> FramingError {
    move |_e| FramingError::ShortRead {
        section,
        expected: 0,
        got: 0,
    }
}

async fn read_line<R>(reader: &mut R) -> Result<Option<String>, FramingError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader
            .read(&mut byte)
            .await
            .map_err(|_| FramingError::TruncatedHeader)?;
        if n == 0 {
            return if line.is_empty() {
                Ok(None)
            } else {
                Err(FramingError::TruncatedHeader)
            };
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| FramingError::TruncatedHeader)
}

async fn read_exact_or_short<R>(
    reader: &mut R,
    buf: &mut [u8],
    section: &'static str,
) -> Result<(), FramingError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let expected = buf.len();
    match reader.read_exact(buf).await {
        Ok(()) => Ok(()),
        Err(_) => Err(FramingError::ShortRead {
            section,
            expected,
            got: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trip_header_only() {
        let frame = Frame::new("ping");
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.envelope.kind, "ping");
        assert!(decoded.envelope.data.is_none());
        assert!(decoded.payload.is_none());
    }

    #[tokio::test]
    async fn round_trip_with_data_and_payload() {
        let frame = Frame::with_data("audio-chunk", serde_json::json!({"rate": 16000}))
            .with_payload(Bytes::from_static(b"\x01\x02\x03\x04"));
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.envelope.kind, "audio-chunk");
        assert_eq!(decoded.envelope.field_str("rate"), None);
        assert_eq!(decoded.payload.unwrap().as_ref(), b"\x01\x02\x03\x04");
    }

    #[tokio::test]
    async fn clean_eof_at_boundary_is_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn truncated_header_is_framing_error() {
        let mut cursor = Cursor::new(b"{\"type\":\"ping\"".to_vec());
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FramingError::TruncatedHeader));
    }

    #[tokio::test]
    async fn short_payload_is_framing_error() {
        let mut cursor =
            Cursor::new(b"{\"type\":\"audio-chunk\",\"payload_length\":10}\n\x01\x02".to_vec());
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FramingError::ShortRead { .. }));
    }
}
