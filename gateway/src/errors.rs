//! Error vocabulary shared between the wire protocol and the session layer.

use serde::{Deserialize, Serialize};

/// Error kinds surfaced to clients in `error.kind`.
///
/// Every `error` frame is terminal: it is followed by `tts_end{cancelled=true}`
/// (unless the transport is already gone) and session teardown. Per-session
/// errors never propagate to other sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed message, out-of-order `seq`, or a state-invalid operation.
    ProtocolError,
    /// Missing or invalid API key.
    AuthFailed,
    /// Global or per-key session cap exceeded.
    CapacityExhausted,
    /// Requested sample rate does not match the engine's native rate.
    UnsupportedSampleRate,
    /// Session unknown, not orphaned, or the retention window has passed.
    ResumeNotAvailable,
    /// Slow client: the outbound queue stayed full past the allowed stall.
    Backpressure,
    /// Synthesis failed after the local retry.
    EngineError,
    /// Anything unexpected.
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProtocolError => "protocol_error",
            Self::AuthFailed => "auth_failed",
            Self::CapacityExhausted => "capacity_exhausted",
            Self::UnsupportedSampleRate => "unsupported_sample_rate",
            Self::ResumeNotAvailable => "resume_not_available",
            Self::Backpressure => "backpressure",
            Self::EngineError => "engine_error",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::UnsupportedSampleRate).unwrap();
        assert_eq!(json, r#""unsupported_sample_rate""#);

        let kind: ErrorKind = serde_json::from_str(r#""backpressure""#).unwrap();
        assert_eq!(kind, ErrorKind::Backpressure);
    }

    #[test]
    fn test_as_str_matches_serde() {
        for kind in [
            ErrorKind::ProtocolError,
            ErrorKind::AuthFailed,
            ErrorKind::CapacityExhausted,
            ErrorKind::UnsupportedSampleRate,
            ErrorKind::ResumeNotAvailable,
            ErrorKind::Backpressure,
            ErrorKind::EngineError,
            ErrorKind::InternalError,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
