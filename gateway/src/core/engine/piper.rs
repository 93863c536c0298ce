//! Piper CLI engine.
//!
//! Drives the open-source Piper synthesizer as a subprocess per call: text
//! goes in on stdin, a PCM16 WAV comes back either through a temp file or
//! stdout. Piper models have a fixed sample rate, declared through
//! `PIPER_SAMPLE_RATE`; a session requesting any other rate is rejected
//! before synthesis starts.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::audio::AudioSpec;

use super::{EngineError, EngineResult, PcmStream, TtsEngine};

/// Bytes per chunk when streaming the synthesized PCM to the session.
const STREAM_CHUNK_BYTES: usize = 8192;

/// Piper's default model rate (most published voices are 22.05 kHz).
const DEFAULT_SAMPLE_RATE: u32 = 22050;

/// How the Piper CLI returns audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PiperOutputMode {
    /// `--output_file <tmp>.wav`, read back and deleted afterwards.
    #[default]
    File,
    /// `--output_file -`, captured from stdout.
    Stdout,
}

#[derive(Debug, Clone)]
pub struct PiperConfig {
    pub bin_path: PathBuf,
    pub model_path: PathBuf,
    pub speaker_id: Option<u32>,
    pub extra_args: Vec<String>,
    pub output_mode: PiperOutputMode,
    /// Concurrent subprocess invocations allowed process-wide.
    pub max_concurrency: usize,
    /// Declared native rate of the configured model.
    pub sample_rate: u32,
}

impl PiperConfig {
    pub fn from_env() -> EngineResult<Self> {
        let bin_path = std::env::var("PIPER_BIN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                EngineError::Configuration("PIPER_BIN is required for the piper engine".into())
            })?;
        let model_path = std::env::var("PIPER_MODEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                EngineError::Configuration("PIPER_MODEL is required for the piper engine".into())
            })?;

        let speaker_id = match std::env::var("PIPER_SPEAKER_ID") {
            Ok(v) if !v.trim().is_empty() => Some(v.trim().parse().map_err(|_| {
                EngineError::Configuration(format!("invalid PIPER_SPEAKER_ID '{v}'"))
            })?),
            _ => None,
        };

        let extra_args = std::env::var("PIPER_EXTRA_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let output_mode = match std::env::var("PIPER_OUTPUT_MODE").as_deref() {
            Ok("stdout") => PiperOutputMode::Stdout,
            _ => PiperOutputMode::File,
        };

        let max_concurrency = std::env::var("PIPER_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(2);

        let sample_rate = std::env::var("PIPER_SAMPLE_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SAMPLE_RATE);

        Ok(Self {
            bin_path: PathBuf::from(bin_path),
            model_path: PathBuf::from(model_path),
            speaker_id,
            extra_args,
            output_mode,
            max_concurrency,
            sample_rate,
        })
    }
}

pub struct PiperEngine {
    config: PiperConfig,
    /// Bounds in-flight subprocess invocations.
    permits: Arc<Semaphore>,
}

impl PiperEngine {
    pub fn new(config: PiperConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency));
        Self { config, permits }
    }

    fn build_command(&self, output_file: &str) -> Command {
        let mut cmd = Command::new(&self.config.bin_path);
        cmd.arg("--model")
            .arg(&self.config.model_path)
            .arg("--output_file")
            .arg(output_file);
        if let Some(speaker) = self.config.speaker_id {
            cmd.arg("--speaker").arg(speaker.to_string());
        }
        cmd.args(&self.config.extra_args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_to_file(&self, text: &str) -> EngineResult<Vec<u8>> {
        let out_path = std::env::temp_dir().join(format!("piper-{}.wav", uuid::Uuid::new_v4()));
        let out_str = out_path.to_string_lossy().into_owned();

        let result = self.run_process(text, &out_str).await;
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let _ = tokio::fs::remove_file(&out_path).await;
                return Err(e);
            }
        };
        if !output.status.success() {
            let _ = tokio::fs::remove_file(&out_path).await;
            return Err(process_failure(&output));
        }

        let wav = tokio::fs::read(&out_path)
            .await
            .map_err(|e| EngineError::Io(format!("reading piper output failed: {e}")))?;
        let _ = tokio::fs::remove_file(&out_path).await;
        Ok(wav)
    }

    async fn run_to_stdout(&self, text: &str) -> EngineResult<Vec<u8>> {
        let output = self.run_process(text, "-").await?;
        if !output.status.success() {
            return Err(process_failure(&output));
        }
        Ok(output.stdout)
    }

    async fn run_process(&self, text: &str, output_file: &str) -> EngineResult<std::process::Output> {
        let mut child = self
            .build_command(output_file)
            .spawn()
            .map_err(|e| EngineError::Io(format!("spawning piper failed: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Io("piper stdin unavailable".into()))?;
        stdin
            .write_all(format!("{text}\n").as_bytes())
            .await
            .map_err(|e| EngineError::Io(format!("writing to piper failed: {e}")))?;
        drop(stdin);

        child
            .wait_with_output()
            .await
            .map_err(|e| EngineError::Io(format!("waiting for piper failed: {e}")))
    }
}

fn process_failure(output: &std::process::Output) -> EngineError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail: String = stderr.chars().take(2000).collect();
    EngineError::Synthesis(format!("piper exited with {}: {detail}", output.status))
}

#[async_trait::async_trait]
impl TtsEngine for PiperEngine {
    fn name(&self) -> &'static str {
        "piper"
    }

    fn native_sample_rate(&self) -> Option<u32> {
        Some(self.config.sample_rate)
    }

    async fn synthesize(
        &self,
        text: &str,
        spec: &AudioSpec,
        cancel: &CancellationToken,
    ) -> EngineResult<PcmStream> {
        let (tx, stream) = PcmStream::channel();
        if text.is_empty() {
            return Ok(stream); // nothing to say, empty stream
        }

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit
                .map_err(|_| EngineError::Io("piper semaphore closed".into()))?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let wav = tokio::select! {
            result = async {
                match self.config.output_mode {
                    PiperOutputMode::File => self.run_to_file(text).await,
                    PiperOutputMode::Stdout => self.run_to_stdout(text).await,
                }
            } => result?,
            _ = cancel.cancelled() => {
                debug!("piper synthesis cancelled before completion");
                return Err(EngineError::Cancelled);
            }
        };
        drop(permit);

        // Some piper builds emit raw PCM16 when asked; accept both shapes.
        let pcm = if is_riff_wav(&wav) {
            let parsed = parse_wav_pcm16(&wav)?;
            if parsed.sample_rate != spec.sample_rate {
                return Err(EngineError::Synthesis(format!(
                    "piper produced {} Hz but the session requires {} Hz",
                    parsed.sample_rate, spec.sample_rate
                )));
            }
            if parsed.channels != spec.channels {
                return Err(EngineError::Synthesis(format!(
                    "piper produced {} channel(s) but the session requires {}",
                    parsed.channels, spec.channels
                )));
            }
            parsed.data
        } else {
            warn!("piper output is not RIFF/WAVE, passing through as raw PCM16");
            Bytes::from(wav)
        };

        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut offset = 0;
            while offset < pcm.len() {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(EngineError::Cancelled)).await;
                    return;
                }
                let end = (offset + STREAM_CHUNK_BYTES).min(pcm.len());
                if tx.send(Ok(pcm.slice(offset..end))).await.is_err() {
                    return;
                }
                offset = end;
            }
        });

        Ok(stream)
    }
}

/// Parsed PCM payload of a RIFF/WAVE file.
#[derive(Debug)]
struct ParsedWav {
    sample_rate: u32,
    channels: u16,
    data: Bytes,
}

fn is_riff_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Minimal WAV reader for PCM16LE: walks chunks, extracts `fmt ` and `data`.
fn parse_wav_pcm16(wav: &[u8]) -> EngineResult<ParsedWav> {
    if !is_riff_wav(wav) {
        return Err(EngineError::Synthesis("not a RIFF/WAVE file".into()));
    }
    if wav.len() < 44 {
        return Err(EngineError::Synthesis("wav file too small".into()));
    }

    let u16_at = |at: usize| u16::from_le_bytes([wav[at], wav[at + 1]]);
    let u32_at = |at: usize| u32::from_le_bytes([wav[at], wav[at + 1], wav[at + 2], wav[at + 3]]);

    let mut offset = 12;
    let mut fmt: Option<(u16, u32, u16)> = None; // (channels, sample_rate, bits)
    let mut data: Option<Bytes> = None;

    while offset + 8 <= wav.len() {
        let chunk_id = &wav[offset..offset + 4];
        let size = u32_at(offset + 4) as usize;
        let payload_start = offset + 8;
        let payload_end = payload_start + size;
        if payload_end > wav.len() {
            break;
        }

        match chunk_id {
            b"fmt " => {
                if size < 16 {
                    return Err(EngineError::Synthesis("wav fmt chunk too small".into()));
                }
                let format_tag = u16_at(payload_start);
                if format_tag != 1 {
                    return Err(EngineError::Synthesis(format!(
                        "unsupported wav format tag {format_tag}"
                    )));
                }
                fmt = Some((
                    u16_at(payload_start + 2),
                    u32_at(payload_start + 4),
                    u16_at(payload_start + 14),
                ));
            }
            b"data" => {
                data = Some(Bytes::copy_from_slice(&wav[payload_start..payload_end]));
            }
            _ => {}
        }

        offset = payload_end + (size % 2); // chunks are word-aligned
        if fmt.is_some() && data.is_some() {
            break;
        }
    }

    let (channels, sample_rate, bits) = fmt
        .ok_or_else(|| EngineError::Synthesis("wav missing fmt chunk".into()))?;
    let data = data.ok_or_else(|| EngineError::Synthesis("wav missing data chunk".into()))?;
    if bits != 16 {
        return Err(EngineError::Synthesis(format!(
            "unsupported wav bits_per_sample {bits}"
        )));
    }

    Ok(ParsedWav {
        sample_rate,
        channels,
        data,
    })
}
