//! Audio stream parameters and PCM16 container framing.
//!
//! The gateway moves raw PCM16 little-endian audio. The only container
//! support is an optional 44-byte streaming WAV header emitted with the
//! first chunk of a `pcm16_wav` session; there is no resampling, mixing,
//! or effects processing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sample rates accepted from clients. Anything else is rejected at `start`.
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [16000, 22050, 24000, 48000];

/// Bits per sample. The whole pipeline is PCM16.
const BITS_PER_SAMPLE: u16 = 16;

/// Size placeholder written into streaming WAV headers where the final
/// data length is unknowable.
const STREAMING_SIZE_SENTINEL: u32 = 0xFFFF_FFFF;

/// Output framing requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    /// Raw PCM16LE frames, no container.
    Pcm16Raw,
    /// Raw PCM16LE frames plus a one-shot streaming WAV header.
    Pcm16Wav,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm16Raw => "pcm16_raw",
            Self::Pcm16Wav => "pcm16_wav",
        }
    }
}

/// Validation failure for a client-declared [`AudioSpec`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioSpecError {
    #[error("unsupported sample_rate {0}; supported: 16000, 22050, 24000, 48000")]
    SampleRate(u32),
    #[error("unsupported channels {0}; supported: 1, 2")]
    Channels(u16),
}

/// Declared audio stream parameters for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSpec {
    pub audio_format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSpec {
    /// Checks the declared parameters against the accepted whitelist.
    pub fn validate(&self) -> Result<(), AudioSpecError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(AudioSpecError::SampleRate(self.sample_rate));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(AudioSpecError::Channels(self.channels));
        }
        Ok(())
    }

    /// Bytes per PCM frame (one sample across all channels).
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.channels) * usize::from(BITS_PER_SAMPLE / 8)
    }

    /// Bytes of audio per second at this spec.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_bytes()
    }

    /// Bytes covering `ms` milliseconds of audio, rounded down to a whole
    /// frame but never below one frame.
    pub fn bytes_for_ms(&self, ms: u64) -> usize {
        let raw = self.bytes_per_second() * ms as usize / 1000;
        let frame = self.frame_bytes();
        (raw / frame).max(1) * frame
    }

    /// Builds a 44-byte PCM16 WAV header for streaming delivery.
    ///
    /// The RIFF chunk size and data size are unknowable for a live stream,
    /// so both carry the `0xFFFF_FFFF` sentinel; clients that save to disk
    /// must patch the sizes themselves.
    pub fn wav_header(&self) -> Bytes {
        let byte_rate = self.bytes_per_second() as u32;
        let block_align = self.frame_bytes() as u16;

        let mut header = Vec::with_capacity(44);
        header.extend_from_slice(b"RIFF");
        header.extend_from_slice(&STREAMING_SIZE_SENTINEL.to_le_bytes());
        header.extend_from_slice(b"WAVE");
        header.extend_from_slice(b"fmt ");
        header.extend_from_slice(&16u32.to_le_bytes()); // PCM fmt chunk size
        header.extend_from_slice(&1u16.to_le_bytes()); // PCM format tag
        header.extend_from_slice(&self.channels.to_le_bytes());
        header.extend_from_slice(&self.sample_rate.to_le_bytes());
        header.extend_from_slice(&byte_rate.to_le_bytes());
        header.extend_from_slice(&block_align.to_le_bytes());
        header.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
        header.extend_from_slice(b"data");
        header.extend_from_slice(&STREAMING_SIZE_SENTINEL.to_le_bytes());
        Bytes::from(header)
    }
}
