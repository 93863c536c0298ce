//! Wire protocol: JSON text frames over the WebSocket transport.
//!
//! Messages are tagged variants discriminated by `type`; unknown types fail
//! deserialization and surface as `protocol_error` at the boundary. All
//! binary payloads are base64-encoded; PCM is 16-bit little-endian.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::audio::AudioFormat;
use crate::errors::ErrorKind;

/// Upper bound for a single `text_delta` payload.
pub const MAX_TEXT_DELTA_BYTES: usize = 64 * 1024;

/// Messages accepted from clients.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a new session. Must be the first message on a connection.
    Start {
        #[serde(default)]
        session_id: Option<String>,
        audio_format: AudioFormat,
        sample_rate: u32,
        channels: u16,
    },

    /// Append text to the session's pending stream.
    TextDelta {
        session_id: String,
        seq: u64,
        text: String,
    },

    /// No more text: flush residual units, then end with `tts_end`.
    TextEnd { session_id: String, seq: u64 },

    /// Abandon in-flight synthesis.
    Cancel {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Re-attach to an orphaned session. Must be the first message on a
    /// connection.
    Resume {
        session_id: String,
        last_unit_index_received: u64,
    },
}

impl ClientMessage {
    /// Boundary size validation, to keep a hostile client from ballooning
    /// the text FIFO.
    pub fn validate_size(&self) -> Result<(), String> {
        if let Self::TextDelta { text, .. } = self {
            if text.len() > MAX_TEXT_DELTA_BYTES {
                return Err(format!(
                    "text_delta too large: {} bytes (max {})",
                    text.len(),
                    MAX_TEXT_DELTA_BYTES
                ));
            }
        }
        Ok(())
    }
}

/// Messages sent to clients.
///
/// `seq` is a per-session monotonic counter over every server message;
/// `chunk_seq` counts only audio chunks. `start_ack` always carries `seq` 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    StartAck {
        session_id: String,
        audio_format: AudioFormat,
        sample_rate: u32,
        channels: u16,
        seq: u64,
    },

    AudioChunk {
        seq: u64,
        chunk_seq: u64,
        unit_index_start: u64,
        unit_index_end: u64,
        audio_base64: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        wav_header_base64: Option<String>,
    },

    TtsEnd { seq: u64, cancelled: bool },

    Error {
        seq: u64,
        kind: ErrorKind,
        message: String,
    },
}

impl ServerMessage {
    pub fn audio_chunk(
        seq: u64,
        chunk_seq: u64,
        unit_index_start: u64,
        unit_index_end: u64,
        pcm: &Bytes,
        wav_header: Option<&Bytes>,
    ) -> Self {
        Self::AudioChunk {
            seq,
            chunk_seq,
            unit_index_start,
            unit_index_end,
            audio_base64: BASE64.encode(pcm),
            wav_header_base64: wav_header.map(|h| BASE64.encode(h)),
        }
    }

    /// Terminal frames end the session once written.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TtsEnd { .. })
    }
}

/// Decodes an `audio_base64` payload back into PCM bytes.
pub fn decode_audio_base64(audio_base64: &str) -> Result<Bytes, base64::DecodeError> {
    BASE64.decode(audio_base64).map(Bytes::from)
}
