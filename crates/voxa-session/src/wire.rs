//! Streaming wire protocol
//!
//! Client → server: binary PCM16-LE frames on a fixed cadence (~100ms).
//! Server → client: raw binary audio, JSON audio messages carrying base64
//! payloads, or an explicit interruption marker. Base64 payloads may arrive
//! with a leading data-URI prefix that must be stripped before decoding.

use crate::error::{SessionError, SessionResult};
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

/// An inbound audio chunk as received from the transport, before decoding.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Encoded payload bytes.
    pub payload: Vec<u8>,
    /// Optional format tag from the wire (e.g. "pcm16"). None for raw
    /// binary messages.
    pub format: Option<String>,
}

/// A parsed server → client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Decoded audio payload plus its optional format tag.
    Audio {
        payload: Vec<u8>,
        format: Option<String>,
    },
    /// Explicit interruption marker: `{"interrupt": true}` or
    /// `{"type": "interruption"}`.
    Interrupt,
}

#[derive(Debug, Deserialize)]
struct RawServerMessage {
    audio: Option<String>,
    audio_format: Option<String>,
    interrupt: Option<bool>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Strip a leading `data:...;base64,` prefix if present.
pub fn strip_data_uri(payload: &str) -> &str {
    if payload.starts_with("data:") {
        match payload.find(',') {
            Some(idx) => &payload[idx + 1..],
            None => payload,
        }
    } else {
        payload
    }
}

/// Parse a server JSON text message. Returns `Ok(None)` for well-formed JSON
/// that is neither audio nor an interrupt marker (unknown message kinds are
/// ignored, not fatal).
pub fn parse_server_text(text: &str) -> SessionResult<Option<ServerMessage>> {
    let raw: RawServerMessage = serde_json::from_str(text)
        .map_err(|e| SessionError::Decode(format!("malformed server message: {}", e)))?;

    if raw.interrupt == Some(true) || raw.kind.as_deref() == Some("interruption") {
        return Ok(Some(ServerMessage::Interrupt));
    }

    if let Some(audio) = raw.audio {
        let encoded = strip_data_uri(&audio);
        let payload = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SessionError::Decode(format!("base64 audio payload: {}", e)))?;
        return Ok(Some(ServerMessage::Audio {
            payload,
            format: raw.audio_format,
        }));
    }

    Ok(None)
}

/// Encode one capture frame as PCM16-LE bytes for the wire.
pub fn encode_frame_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}
