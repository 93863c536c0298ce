//! NVIDIA Riva TTS engine.
//!
//! Talks to a Riva server over gRPC using tonic's low-level client and a
//! hand-rolled protobuf wire codec, so no proto codegen step is needed.
//!
//! ## Service definition
//!
//! ```protobuf
//! service RivaSpeechSynthesis {
//!     rpc SynthesizeOnline(SynthesizeSpeechRequest)
//!         returns (stream SynthesizeSpeechResponse);
//! }
//! ```

use bytes::{Buf, BufMut, Bytes};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status, Streaming};
use tracing::{debug, warn};

use crate::core::audio::AudioSpec;

use super::{EngineError, EngineResult, PcmStream, TtsEngine};

/// gRPC method path for streaming synthesis.
const GRPC_SERVICE_PATH: &str = "/nvidia.riva.tts.RivaSpeechSynthesis/SynthesizeOnline";

/// `AudioEncoding.LINEAR_PCM` in the Riva proto.
const ENCODING_LINEAR_PCM: u64 = 1;

#[derive(Debug, Clone)]
pub struct RivaConfig {
    /// host:port of the Riva gRPC endpoint.
    pub server: String,
    pub voice_name: Option<String>,
    pub language_code: String,
    /// Declared native rate, when the deployed model has a fixed one.
    pub sample_rate: Option<u32>,
}

impl RivaConfig {
    pub fn from_env() -> Self {
        Self {
            server: std::env::var("RIVA_SERVER").unwrap_or_else(|_| "localhost:50051".into()),
            voice_name: std::env::var("RIVA_VOICE").ok().filter(|v| !v.is_empty()),
            language_code: std::env::var("RIVA_LANGUAGE").unwrap_or_else(|_| "en-US".into()),
            sample_rate: std::env::var("RIVA_SAMPLE_RATE")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

pub struct RivaEngine {
    config: RivaConfig,
    channel: Channel,
}

impl RivaEngine {
    /// Builds the engine with a lazily connecting channel; the first
    /// synthesis call establishes the connection.
    pub fn new(config: RivaConfig) -> EngineResult<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", config.server))
            .map_err(|e| EngineError::Configuration(format!("invalid RIVA_SERVER: {e}")))?;
        let channel = endpoint.connect_lazy();
        Ok(Self { config, channel })
    }

    fn build_request(&self, text: &str, spec: &AudioSpec) -> SynthesizeSpeechRequest {
        SynthesizeSpeechRequest {
            text: text.to_string(),
            language_code: self.config.language_code.clone(),
            sample_rate_hz: spec.sample_rate,
            voice_name: self.config.voice_name.clone().unwrap_or_default(),
        }
    }
}

#[async_trait::async_trait]
impl TtsEngine for RivaEngine {
    fn name(&self) -> &'static str {
        "riva"
    }

    fn native_sample_rate(&self) -> Option<u32> {
        self.config.sample_rate
    }

    async fn synthesize(
        &self,
        text: &str,
        spec: &AudioSpec,
        cancel: &CancellationToken,
    ) -> EngineResult<PcmStream> {
        let (tx, stream) = PcmStream::channel();
        if text.is_empty() {
            return Ok(stream);
        }

        let request = self.build_request(text, spec);
        let mut responses = tokio::select! {
            result = synthesize_online(self.channel.clone(), request) => {
                result.map_err(status_to_engine_error)?
            }
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = responses.message() => message,
                    _ = cancel.cancelled() => {
                        debug!("riva synthesis cancelled mid-stream");
                        let _ = tx.send(Err(EngineError::Cancelled)).await;
                        return;
                    }
                };
                match message {
                    Ok(Some(frame)) => match SynthesizeSpeechResponse::decode(&frame) {
                        Ok(response) if !response.audio.is_empty() => {
                            if tx.send(Ok(response.audio)).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => {} // metadata-only frame
                        Err(e) => {
                            warn!(error = %e, "failed to decode riva response frame");
                            let _ = tx
                                .send(Err(EngineError::Synthesis(format!(
                                    "undecodable riva frame: {e}"
                                ))))
                                .await;
                            return;
                        }
                    },
                    Ok(None) => return, // stream complete
                    Err(status) => {
                        let _ = tx.send(Err(status_to_engine_error(status))).await;
                        return;
                    }
                }
            }
        });

        Ok(stream)
    }
}

/// Performs the SynthesizeOnline call through tonic's low-level client.
async fn synthesize_online(
    channel: Channel,
    request: SynthesizeSpeechRequest,
) -> Result<Streaming<Bytes>, Status> {
    use tonic::codegen::http::uri::PathAndQuery;

    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| Status::unavailable(format!("riva not ready: {e}")))?;

    let codec = RivaCodec;
    let path = PathAndQuery::from_static(GRPC_SERVICE_PATH);
    let response = grpc
        .server_streaming(Request::new(request.encode()), path, codec)
        .await?;
    Ok(response.into_inner())
}

fn status_to_engine_error(status: Status) -> EngineError {
    match status.code() {
        tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => {
            EngineError::Io(format!("riva unavailable: {}", status.message()))
        }
        tonic::Code::InvalidArgument => {
            EngineError::Configuration(format!("riva rejected request: {}", status.message()))
        }
        code => EngineError::Synthesis(format!("riva error {code:?}: {}", status.message())),
    }
}

/// Synthesis request, hand-encoded to the Riva proto wire format.
///
/// ```protobuf
/// message SynthesizeSpeechRequest {
///     string text = 1;
///     string language_code = 2;
///     AudioEncoding encoding = 3;
///     int32 sample_rate_hz = 4;
///     string voice_name = 5;
/// }
/// ```
#[derive(Debug, Clone)]
struct SynthesizeSpeechRequest {
    text: String,
    language_code: String,
    sample_rate_hz: u32,
    voice_name: String,
}

impl SynthesizeSpeechRequest {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.text.len() + 64);

        // Field 1: text (length-delimited)
        if !self.text.is_empty() {
            buf.push(0x0a);
            encode_varint(&mut buf, self.text.len() as u64);
            buf.extend_from_slice(self.text.as_bytes());
        }
        // Field 2: language_code (length-delimited)
        if !self.language_code.is_empty() {
            buf.push(0x12);
            encode_varint(&mut buf, self.language_code.len() as u64);
            buf.extend_from_slice(self.language_code.as_bytes());
        }
        // Field 3: encoding (varint), always LINEAR_PCM
        buf.push(0x18);
        encode_varint(&mut buf, ENCODING_LINEAR_PCM);
        // Field 4: sample_rate_hz (varint)
        buf.push(0x20);
        encode_varint(&mut buf, u64::from(self.sample_rate_hz));
        // Field 5: voice_name (length-delimited)
        if !self.voice_name.is_empty() {
            buf.push(0x2a);
            encode_varint(&mut buf, self.voice_name.len() as u64);
            buf.extend_from_slice(self.voice_name.as_bytes());
        }
        buf
    }
}

/// Streaming synthesis response; only the audio payload is consumed.
///
/// ```protobuf
/// message SynthesizeSpeechResponse {
///     bytes audio = 1;
///     // trailing metadata fields ignored
/// }
/// ```
#[derive(Debug, Clone, Default)]
struct SynthesizeSpeechResponse {
    audio: Bytes,
}

impl SynthesizeSpeechResponse {
    fn decode(buf: &Bytes) -> Result<Self, DecodeError> {
        let mut response = Self::default();
        let mut pos = 0;
        let bytes = buf.as_ref();

        while pos < bytes.len() {
            let (tag, consumed) = decode_varint(&bytes[pos..])?;
            pos += consumed;
            let field_number = tag >> 3;
            let wire_type = tag & 0x07;

            match (field_number, wire_type) {
                (1, 2) => {
                    let (len, consumed) = decode_varint(&bytes[pos..])?;
                    pos += consumed;
                    let end = pos + len as usize;
                    if end > bytes.len() {
                        return Err(DecodeError::BufferTooShort);
                    }
                    response.audio = buf.slice(pos..end);
                    pos = end;
                }
                (_, 0) => {
                    let (_, consumed) = decode_varint(&bytes[pos..])?;
                    pos += consumed;
                }
                (_, 2) => {
                    let (len, consumed) = decode_varint(&bytes[pos..])?;
                    pos += consumed + len as usize;
                    if pos > bytes.len() {
                        return Err(DecodeError::BufferTooShort);
                    }
                }
                (_, 5) => pos += 4,
                (_, 1) => pos += 8,
                _ => return Err(DecodeError::UnknownWireType(wire_type as u8)),
            }
        }

        Ok(response)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
enum DecodeError {
    #[error("buffer too short")]
    BufferTooShort,
    #[error("invalid varint")]
    InvalidVarint,
    #[error("unknown wire type: {0}")]
    UnknownWireType(u8),
}

fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn decode_varint(buf: &[u8]) -> Result<(u64, usize), DecodeError> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in buf.iter().enumerate() {
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return Err(DecodeError::InvalidVarint);
        }
    }
    Err(DecodeError::BufferTooShort)
}

/// Raw-bytes codec: requests are pre-encoded, responses decoded by hand.
#[derive(Debug, Clone, Default)]
struct RivaCodec;

impl tonic::codec::Codec for RivaCodec {
    type Encode = Vec<u8>;
    type Decode = Bytes;
    type Encoder = RivaEncoder;
    type Decoder = RivaDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RivaEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RivaDecoder
    }
}

#[derive(Debug, Clone, Default)]
struct RivaEncoder;

impl tonic::codec::Encoder for RivaEncoder {
    type Item = Vec<u8>;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut tonic::codec::EncodeBuf<'_>,
    ) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct RivaDecoder;

impl tonic::codec::Decoder for RivaDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut tonic::codec::DecodeBuf<'_>,
    ) -> Result<Option<Self::Item>, Self::Error> {
        let remaining = src.remaining();
        if remaining == 0 {
            Ok(None)
        } else {
            Ok(Some(src.copy_to_bytes(remaining)))
        }
    }
}
