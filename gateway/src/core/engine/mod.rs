//! TTS engine abstraction.
//!
//! The gateway core only sees this contract: given a text fragment and a
//! cancellation signal, an engine yields a stream of PCM16LE frames and
//! declares its native sample rate (if it has a fixed one). Engines are free
//! to pool subprocesses, hold gRPC channels, or synthesize in-process.

mod dummy;
mod piper;
mod riva;

pub use dummy::{DummyEngine, DummyEngineConfig};
pub use piper::{PiperConfig, PiperEngine, PiperOutputMode};
pub use riva::{RivaConfig, RivaEngine};

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::audio::AudioSpec;

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine failure classification.
///
/// `Io` covers transient transport problems (subprocess spawn, gRPC
/// connectivity) and is retried once by the session; everything else
/// terminates the session immediately.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine configuration error: {0}")]
    Configuration(String),
    #[error("synthesis failed: {0}")]
    Synthesis(String),
    #[error("engine i/o error: {0}")]
    Io(String),
    #[error("synthesis cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether the session may retry the failed unit once.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Stream of PCM16LE byte chunks produced by one synthesis call.
///
/// Backed by a bounded channel so producer tasks observe backpressure from
/// the consumer; ends when the producer finishes, fails, or is cancelled.
pub struct PcmStream {
    rx: mpsc::Receiver<EngineResult<Bytes>>,
}

/// Channel depth between an engine producer task and the session consumer.
const PCM_STREAM_DEPTH: usize = 8;

impl PcmStream {
    /// Creates a stream and the sender its producer task feeds.
    pub fn channel() -> (mpsc::Sender<EngineResult<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(PCM_STREAM_DEPTH);
        (tx, Self { rx })
    }
}

impl Stream for PcmStream {
    type Item = EngineResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Capability contract every synthesis backend satisfies.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Stable engine identifier, as reported by `/healthz`.
    fn name(&self) -> &'static str;

    /// The model's fixed output sample rate, or `None` when the engine can
    /// synthesize at any whitelisted rate. A `Some` value that differs from
    /// the client's requested rate fails `start`: the core never resamples.
    fn native_sample_rate(&self) -> Option<u32>;

    /// Synthesizes one text fragment into a PCM stream.
    ///
    /// Implementations check `cancel` between emitted frames and stop
    /// promptly once it trips; a cancelled stream simply ends early.
    async fn synthesize(
        &self,
        text: &str,
        spec: &AudioSpec,
        cancel: &CancellationToken,
    ) -> EngineResult<PcmStream>;
}

impl fmt::Debug for dyn TtsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtsEngine").field("name", &self.name()).finish()
    }
}

/// Builds the engine selected by `WS_TTS_ENGINE`, reading engine-specific
/// settings from the environment.
pub fn create_engine(kind: &str) -> EngineResult<Arc<dyn TtsEngine>> {
    match kind.to_lowercase().trim() {
        "dummy" => Ok(Arc::new(DummyEngine::new(DummyEngineConfig::from_env()))),
        "piper" => Ok(Arc::new(PiperEngine::new(PiperConfig::from_env()?))),
        "riva" => Ok(Arc::new(RivaEngine::new(RivaConfig::from_env())?)),
        other => Err(EngineError::Configuration(format!(
            "unknown engine '{other}'; supported engines: dummy, piper, riva"
        ))),
    }
}
