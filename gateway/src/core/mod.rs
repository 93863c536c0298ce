//! Core building blocks: audio parameters, text segmentation, and the
//! synthesis engine contract with its implementations.

pub mod audio;
pub mod engine;
pub mod segmenter;

pub use audio::{AudioFormat, AudioSpec, AudioSpecError, SUPPORTED_SAMPLE_RATES};
pub use engine::{
    DummyEngine, DummyEngineConfig, EngineError, EngineResult, PcmStream, PiperConfig,
    PiperEngine, RivaConfig, RivaEngine, TtsEngine, create_engine,
};
pub use segmenter::{SegmenterConfig, TextSegmenter, TextUnit};
