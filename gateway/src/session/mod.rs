//! Per-session state and the session registry.
//!
//! A session is owned by exactly two long-running tasks (synthesis + send)
//! that communicate through the bounded outbound queue, the cancellation
//! latch, and the shared state in [`Session`]. The registry holds the only
//! strong reference once the connection handler returns.

pub mod emitter;
pub mod registry;
pub mod retention;
pub mod state;
pub mod tasks;

pub use emitter::{ChunkEmitter, EmittedChunk};
pub use registry::{AdmissionError, RegistryConfig, SessionRegistry};
pub use retention::{RetainedChunk, RetentionRing};
pub use state::SessionState;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::audio::AudioSpec;
use crate::errors::ErrorKind;
use crate::protocol::ServerMessage;

/// Inbound text flow from the connection read loop to the synthesis task.
#[derive(Debug)]
pub enum TextEvent {
    Delta(String),
    End,
}

/// Why the cancellation latch tripped.
#[derive(Debug, Clone)]
pub enum CancelCause {
    /// Client-requested `cancel`: terminal frames only, no error frame.
    Client,
    /// A fault: the send task writes `error{kind}` before `tts_end`.
    Fault { kind: ErrorKind, message: String },
}

/// Why an adoption attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdoptError {
    #[error("session not found")]
    NotFound,
    #[error("session is not orphaned")]
    NotOrphan,
    #[error("retention window passed")]
    Evicted,
}

pub struct Session {
    pub session_id: String,
    pub api_key_id: Option<String>,
    pub spec: AudioSpec,
    /// The single out-of-band signal between the task pair. Tripping it is
    /// idempotent.
    pub cancel: CancellationToken,
    state: Mutex<SessionState>,
    cancel_cause: Mutex<Option<CancelCause>>,
    tts_end_emitted: AtomicBool,
    text_end_seen: AtomicBool,
    /// Next server message seq; `start_ack` always uses 0, so live frames
    /// count from 1.
    next_server_seq: AtomicU64,
    last_client_seq: Mutex<Option<u64>>,
    /// Current transport-facing queue; swapped atomically on adoption.
    outbound: Mutex<mpsc::Sender<ServerMessage>>,
    /// Clonable inlet of the session's text FIFO; the synthesis task owns
    /// the receiving end for the whole session lifetime.
    text_tx: mpsc::Sender<TextEvent>,
    resumed: Notify,
    /// The terminal frame once built but not yet written to a transport.
    /// Survives orphaning so a resumed client still receives its `tts_end`.
    pending_terminal: Mutex<Option<ServerMessage>>,
    retention: Mutex<RetentionRing>,
    orphaned_at: Mutex<Option<Instant>>,
    created_at: Instant,
    first_audio_at: Mutex<Option<Instant>>,
}

impl Session {
    pub fn new(
        session_id: String,
        api_key_id: Option<String>,
        spec: AudioSpec,
        outbound: mpsc::Sender<ServerMessage>,
        text_tx: mpsc::Sender<TextEvent>,
        retention: RetentionRing,
    ) -> Self {
        Self {
            session_id,
            api_key_id,
            spec,
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Idle),
            cancel_cause: Mutex::new(None),
            tts_end_emitted: AtomicBool::new(false),
            text_end_seen: AtomicBool::new(false),
            next_server_seq: AtomicU64::new(1),
            last_client_seq: Mutex::new(None),
            outbound: Mutex::new(outbound),
            text_tx,
            resumed: Notify::new(),
            pending_terminal: Mutex::new(None),
            retention: Mutex::new(retention),
            orphaned_at: Mutex::new(None),
            created_at: Instant::now(),
            first_audio_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Attempts a lifecycle transition; refuses and logs anything illegal.
    pub fn transition_to(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            debug!(
                session_id = %self.session_id,
                from = %*state,
                to = %next,
                "session state transition"
            );
            *state = next;
            true
        } else {
            debug!(
                session_id = %self.session_id,
                from = %*state,
                to = %next,
                "refusing illegal session state transition"
            );
            false
        }
    }

    /// Trips the cancellation latch. The first caller's cause wins;
    /// repeated calls are no-ops.
    pub fn begin_cancel(&self, cause: CancelCause) {
        {
            let mut slot = self.cancel_cause.lock();
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.transition_to(SessionState::Cancelling);
        self.cancel.cancel();
    }

    pub fn cancel_cause(&self) -> Option<CancelCause> {
        self.cancel_cause.lock().clone()
    }

    /// First-writer-wins guard for the terminal frame: exactly one
    /// `tts_end` is ever emitted per session, resumes included.
    pub fn try_emit_tts_end(&self) -> bool {
        self.tts_end_emitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_text_end(&self) {
        self.text_end_seen.store(true, Ordering::Release);
    }

    pub fn text_end_seen(&self) -> bool {
        self.text_end_seen.load(Ordering::Acquire)
    }

    pub fn next_server_seq(&self) -> u64 {
        self.next_server_seq.fetch_add(1, Ordering::AcqRel)
    }

    /// Validates that a client `seq` is strictly increasing.
    pub fn accept_client_seq(&self, seq: u64) -> bool {
        let mut last = self.last_client_seq.lock();
        match *last {
            Some(prev) if seq <= prev => {
                warn!(
                    session_id = %self.session_id,
                    seq,
                    prev,
                    "out-of-order client seq"
                );
                false
            }
            _ => {
                *last = Some(seq);
                true
            }
        }
    }

    pub fn sender(&self) -> mpsc::Sender<ServerMessage> {
        self.outbound.lock().clone()
    }

    pub fn text_sender(&self) -> mpsc::Sender<TextEvent> {
        self.text_tx.clone()
    }

    /// Swaps in the queue of a freshly adopted transport. Call
    /// [`notify_resumed`](Self::notify_resumed) once replay frames are
    /// queued so blocked producers pick the new sender up in order.
    pub fn install_sender(&self, tx: mpsc::Sender<ServerMessage>) {
        *self.outbound.lock() = tx;
    }

    pub fn notify_resumed(&self) {
        // notify_one stores a permit if the producer is not parked yet, so
        // an adoption racing the queue-detach observation is never lost.
        self.resumed.notify_one();
    }

    pub async fn wait_resumed(&self) {
        self.resumed.notified().await;
    }

    pub fn retention(&self) -> &Mutex<RetentionRing> {
        &self.retention
    }

    pub fn set_pending_terminal(&self, frame: ServerMessage) {
        *self.pending_terminal.lock() = Some(frame);
    }

    /// The undelivered terminal frame, if any. Cleared by the send task
    /// only after a successful write, so adoption can re-deliver it.
    pub fn pending_terminal(&self) -> Option<ServerMessage> {
        self.pending_terminal.lock().clone()
    }

    pub fn clear_pending_terminal(&self) {
        *self.pending_terminal.lock() = None;
    }

    /// Marks the transport as lost and starts the grace clock.
    pub fn mark_orphan(&self) -> bool {
        if self.transition_to(SessionState::Orphan) {
            *self.orphaned_at.lock() = Some(Instant::now());
            true
        } else {
            false
        }
    }

    pub fn orphan_expired(&self, grace: Duration) -> bool {
        self.orphaned_at
            .lock()
            .is_some_and(|at| at.elapsed() > grace)
    }

    /// Atomic adoption check: only an ORPHAN with an intact retention
    /// suffix past the client's cursor can be re-attached. On success the
    /// pre-orphan phase is restored and the replay set returned.
    pub fn try_adopt(&self, last_unit_index: u64) -> Result<Vec<RetainedChunk>, AdoptError> {
        let mut state = self.state.lock();
        if *state != SessionState::Orphan {
            return Err(AdoptError::NotOrphan);
        }
        let mut retention = self.retention.lock();
        if !retention.can_replay_after(last_unit_index) {
            return Err(AdoptError::Evicted);
        }
        let replay = retention.replay_after(last_unit_index);
        *state = if self.text_end_seen() {
            SessionState::Draining
        } else {
            SessionState::Running
        };
        *self.orphaned_at.lock() = None;
        Ok(replay)
    }

    /// Terminal shutdown: forces CLOSED and trips the latch so both tasks
    /// unwind.
    pub fn force_close(&self) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = SessionState::Closed;
        }
        drop(state);
        self.cancel.cancel();
    }

    /// Records the first audio emission; returns the TTFA on the first call.
    pub fn record_first_audio(&self) -> Option<Duration> {
        let mut slot = self.first_audio_at.lock();
        if slot.is_none() {
            *slot = Some(Instant::now());
            Some(self.created_at.elapsed())
        } else {
            None
        }
    }
}
