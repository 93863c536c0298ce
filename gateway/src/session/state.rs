//! Session lifecycle states and the legal transitions between them.

/// Per-session lifecycle.
///
/// ```text
/// IDLE ──text_delta──▶ RUNNING ──text_end──▶ DRAINING ──flushed──▶ CLOSED
///   │                     │                     │
///   └──────── cancel / fatal error ─────────────┴──▶ CANCELLING ──▶ CLOSED
///
/// any non-CLOSED ──transport lost──▶ ORPHAN ──resume──▶ RUNNING/DRAINING
///                                      └──grace expiry──▶ CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, awaiting the first `text_delta`.
    Idle,
    /// Actively synthesizing and emitting.
    Running,
    /// `text_end` received; flushing residual units.
    Draining,
    /// Cancel latch tripped; abandoning in-flight work.
    Cancelling,
    /// Terminal. Removed from the registry.
    Closed,
    /// Transport gone; awaiting `resume` within the grace window.
    Orphan,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Cancelling => "cancelling",
            Self::Closed => "closed",
            Self::Orphan => "orphan",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether moving to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Running) => true,
            (Running, Draining) => true,
            // Cancellation is reachable from every live phase.
            (Idle | Running | Draining, Cancelling) => true,
            // Losing the transport orphans every non-terminal phase.
            (Idle | Running | Draining | Cancelling, Orphan) => true,
            // Adoption restores the pre-orphan phase.
            (Orphan, Running | Draining) => true,
            (Idle | Running | Draining | Cancelling | Orphan, Closed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
