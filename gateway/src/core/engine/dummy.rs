//! Deterministic in-process engine for development and tests.
//!
//! Produces a fixed waveform per input character (10 ms of a 440 Hz sine
//! wave), so the PCM for a given text and spec is a pure function of both.
//! An optional per-character delay simulates a busy model, and an optional
//! fixed native rate simulates a model that cannot serve arbitrary rates.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::audio::AudioSpec;

use super::{EngineError, EngineResult, PcmStream, TtsEngine};

/// Milliseconds of audio generated per input character.
const MS_PER_CHAR_AUDIO: u64 = 10;

/// Tone frequency of the generated sine wave.
const TONE_HZ: f64 = 440.0;

/// Peak amplitude, kept below full scale to avoid clipped-looking output.
const AMPLITUDE: f64 = 0.3;

/// Bytes per emitted stream chunk (frame-aligned for mono and stereo).
const STREAM_CHUNK_BYTES: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct DummyEngineConfig {
    /// Artificial synthesis delay per character, for exercising
    /// cancellation and backpressure paths. Zero by default.
    pub ms_per_char: u64,
    /// When set, the engine claims this fixed native rate and the gateway
    /// rejects sessions requesting any other rate.
    pub native_sample_rate: Option<u32>,
}

impl DummyEngineConfig {
    pub fn from_env() -> Self {
        let ms_per_char = std::env::var("WS_TTS_DUMMY_MS_PER_CHAR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let native_sample_rate = std::env::var("WS_TTS_DUMMY_NATIVE_RATE")
            .ok()
            .and_then(|v| v.parse().ok());
        Self {
            ms_per_char,
            native_sample_rate,
        }
    }
}

pub struct DummyEngine {
    config: DummyEngineConfig,
}

impl DummyEngine {
    pub fn new(config: DummyEngineConfig) -> Self {
        Self { config }
    }

    /// The exact PCM this engine produces for `text` at `spec`.
    ///
    /// Each character contributes an independent 10 ms sine burst, so the
    /// output for a text equals the concatenation of the outputs for any
    /// split of it.
    pub fn pcm_for(text: &str, spec: &AudioSpec) -> Bytes {
        let samples_per_char = (spec.sample_rate as u64 * MS_PER_CHAR_AUDIO / 1000) as usize;
        let char_count = text.chars().count();
        let mut pcm = Vec::with_capacity(char_count * samples_per_char * spec.frame_bytes());

        for _ in text.chars() {
            for n in 0..samples_per_char {
                let t = n as f64 / spec.sample_rate as f64;
                let value = (AMPLITUDE * (2.0 * std::f64::consts::PI * TONE_HZ * t).sin()
                    * f64::from(i16::MAX)) as i16;
                for _ in 0..spec.channels {
                    pcm.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
        Bytes::from(pcm)
    }
}

#[async_trait::async_trait]
impl TtsEngine for DummyEngine {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn native_sample_rate(&self) -> Option<u32> {
        self.config.native_sample_rate
    }

    async fn synthesize(
        &self,
        text: &str,
        spec: &AudioSpec,
        cancel: &CancellationToken,
    ) -> EngineResult<PcmStream> {
        let pcm = Self::pcm_for(text, spec);
        let pace_per_chunk = if self.config.ms_per_char == 0 {
            Duration::ZERO
        } else {
            // Spread the per-character delay across the chunks of the text.
            let total = Duration::from_millis(self.config.ms_per_char * text.chars().count() as u64);
            total / (pcm.len() / STREAM_CHUNK_BYTES + 1) as u32
        };

        let (tx, stream) = PcmStream::channel();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut offset = 0;
            while offset < pcm.len() {
                if cancel.is_cancelled() {
                    debug!("dummy synthesis cancelled mid-stream");
                    let _ = tx.send(Err(EngineError::Cancelled)).await;
                    return;
                }
                if !pace_per_chunk.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = tx.send(Err(EngineError::Cancelled)).await;
                            return;
                        }
                        _ = sleep(pace_per_chunk) => {}
                    }
                }
                let end = (offset + STREAM_CHUNK_BYTES).min(pcm.len());
                if tx.send(Ok(pcm.slice(offset..end))).await.is_err() {
                    return; // consumer gone
                }
                offset = end;
            }
        });

        Ok(stream)
    }
}
