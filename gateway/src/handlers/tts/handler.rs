//! Connection lifecycle for the `/tts` endpoint.
//!
//! The first message routes the connection: `start` allocates a session,
//! `resume` adopts an orphaned one. After that the handler is the session's
//! read loop, feeding the text FIFO and relaying `cancel`; all outbound
//! traffic flows through the session's send task.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::audio::{AudioSpec, AudioSpecError};
use crate::core::segmenter::SegmenterConfig;
use crate::errors::ErrorKind;
use crate::middleware::Auth;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::tasks::{SynthesisParams, run_send, run_synthesis};
use crate::session::{
    AdmissionError, CancelCause, RetentionRing, Session, SessionState, TextEvent,
};
use crate::state::AppState;

/// WebSocket frame/message ceiling. The protocol is text-only JSON; audio
/// is base64 inside frames, so 4 MB is generous.
const MAX_WS_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Capacity of the pending-text FIFO between the read loop and the
/// synthesis task.
const TEXT_FIFO_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocket, Message>;
type WsReader = SplitStream<WebSocket>;

pub async fn tts_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<Auth>,
) -> Response {
    debug!(auth_id = ?auth.id, "tts websocket upgrade requested");
    ws.max_frame_size(MAX_WS_MESSAGE_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_tts_socket(socket, state, auth))
}

async fn handle_tts_socket(socket: WebSocket, state: Arc<AppState>, auth: Auth) {
    let (mut sink, mut reader) = socket.split();

    if auth.is_pending() {
        reject(&state, &mut sink, ErrorKind::AuthFailed, "invalid or missing API key").await;
        return;
    }

    // The first message decides what this connection is.
    let first = match next_message(&mut reader, state.config.idle_timeout).await {
        Inbound::Msg(msg) => msg,
        Inbound::Closed => return,
        Inbound::IdleTimeout => {
            reject(
                &state,
                &mut sink,
                ErrorKind::ProtocolError,
                "no start or resume within the idle window",
            )
            .await;
            return;
        }
        Inbound::ProtocolViolation(detail) => {
            reject(&state, &mut sink, ErrorKind::ProtocolError, &detail).await;
            return;
        }
    };

    match first {
        ClientMessage::Start {
            session_id,
            audio_format,
            sample_rate,
            channels,
        } => {
            let spec = AudioSpec {
                audio_format,
                sample_rate,
                channels,
            };
            handle_start(state, auth, sink, reader, session_id, spec).await;
        }
        ClientMessage::Resume {
            session_id,
            last_unit_index_received,
        } => {
            handle_resume(state, auth, sink, reader, session_id, last_unit_index_received).await;
        }
        other => {
            debug!(message = ?other, "invalid first message");
            reject(
                &state,
                &mut sink,
                ErrorKind::ProtocolError,
                "first message must be start or resume",
            )
            .await;
        }
    }
}

// ---------------------------------------------------------------------------
// start
// ---------------------------------------------------------------------------

async fn handle_start(
    state: Arc<AppState>,
    auth: Auth,
    mut sink: WsSink,
    reader: WsReader,
    session_id: Option<String>,
    spec: AudioSpec,
) {
    if let Err(e) = spec.validate() {
        let kind = match e {
            AudioSpecError::SampleRate(_) => ErrorKind::UnsupportedSampleRate,
            AudioSpecError::Channels(_) => ErrorKind::ProtocolError,
        };
        reject(&state, &mut sink, kind, &e.to_string()).await;
        return;
    }

    // The core does not resample: a fixed-rate engine serves its rate only.
    if let Some(native) = state.engine.native_sample_rate() {
        if native != spec.sample_rate {
            reject(
                &state,
                &mut sink,
                ErrorKind::UnsupportedSampleRate,
                &format!(
                    "engine native rate is {native} Hz, requested {} Hz",
                    spec.sample_rate
                ),
            )
            .await;
            return;
        }
    }

    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let config = &state.config;
    let (out_tx, out_rx) = mpsc::channel(config.queue_capacity);
    let (text_tx, text_rx) = mpsc::channel(TEXT_FIFO_CAPACITY);
    let session = Arc::new(Session::new(
        session_id.clone(),
        auth.id.clone(),
        spec,
        out_tx.clone(),
        text_tx,
        RetentionRing::new(config.retention_chunks, config.retention_max_age),
    ));

    match state.registry.insert(session.clone()) {
        Ok(()) => {}
        Err(AdmissionError::CapacityExhausted) => {
            reject(
                &state,
                &mut sink,
                ErrorKind::CapacityExhausted,
                "session capacity exhausted, try again later",
            )
            .await;
            return;
        }
        Err(AdmissionError::DuplicateSession(id)) => {
            reject(
                &state,
                &mut sink,
                ErrorKind::ProtocolError,
                &format!("session_id '{id}' is already active"),
            )
            .await;
            return;
        }
    }

    state.metrics.inc_sessions();
    info!(
        session_id = %session.session_id,
        auth_id = ?auth.id,
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        format = spec.audio_format.as_str(),
        "session started"
    );

    // The ack goes through the queue too, so it precedes any audio chunk.
    let ack = ServerMessage::StartAck {
        session_id,
        audio_format: spec.audio_format,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        seq: 0,
    };
    if out_tx.send(ack).await.is_err() {
        state.registry.remove(&session.session_id);
        return;
    }

    spawn_send_task(&state, &session, out_rx, sink);
    tokio::spawn(run_synthesis(
        session.clone(),
        state.engine.clone(),
        text_rx,
        SynthesisParams {
            segmenter: SegmenterConfig {
                flush_on_punct: config.flush_on_punct,
                flush_min_chars: config.flush_min_chars,
            },
            chunk_ms: config.chunk_ms,
            enqueue_timeout: config.backpressure_timeout,
        },
        state.metrics.clone(),
    ));
    read_loop(state, session, reader).await;
}

// ---------------------------------------------------------------------------
// resume
// ---------------------------------------------------------------------------

async fn handle_resume(
    state: Arc<AppState>,
    auth: Auth,
    mut sink: WsSink,
    reader: WsReader,
    session_id: String,
    last_unit_index_received: u64,
) {
    // An orphan belongs to whoever started it.
    if let Some(existing) = state.registry.lookup(&session_id) {
        if existing.api_key_id != auth.id {
            reject(&state, &mut sink, ErrorKind::AuthFailed, "session belongs to another key")
                .await;
            return;
        }
    }

    let (session, replay) = match state.registry.adopt(&session_id, last_unit_index_received) {
        Ok(adopted) => adopted,
        Err(e) => {
            debug!(session_id = %session_id, error = %e, "resume refused");
            reject(
                &state,
                &mut sink,
                ErrorKind::ResumeNotAvailable,
                "session not resumable, start a new one",
            )
            .await;
            return;
        }
    };

    info!(
        session_id = %session.session_id,
        last_unit_index_received,
        replay_chunks = replay.len(),
        "session resumed"
    );

    let (out_tx, out_rx) = mpsc::channel(state.config.queue_capacity);
    session.install_sender(out_tx.clone());
    spawn_send_task(&state, &session, out_rx, sink);

    // Replay strictly precedes live traffic: the synthesis task stays
    // parked until notify_resumed.
    for chunk in replay {
        let frame = ServerMessage::audio_chunk(
            chunk.seq,
            chunk.chunk_seq,
            chunk.unit_index_start,
            chunk.unit_index_end,
            &chunk.pcm,
            chunk.wav_header.as_ref(),
        );
        if out_tx.send(frame).await.is_err() {
            break; // transport already gone again; the orphan path recovers
        }
    }
    // A finish that never reached the old transport is re-delivered after
    // the replayed audio.
    if let Some(end) = session.pending_terminal() {
        let _ = out_tx.send(end).await;
    }
    session.notify_resumed();

    read_loop(state, session, reader).await;
}

fn spawn_send_task(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    out_rx: mpsc::Receiver<ServerMessage>,
    sink: WsSink,
) {
    tokio::spawn(run_send(
        session.clone(),
        out_rx,
        sink,
        state.registry.clone(),
        state.config.write_timeout,
        state.metrics.clone(),
    ));
}

// ---------------------------------------------------------------------------
// read loop
// ---------------------------------------------------------------------------

async fn read_loop(state: Arc<AppState>, session: Arc<Session>, mut reader: WsReader) {
    let idle = state.config.idle_timeout;

    loop {
        match next_message(&mut reader, idle).await {
            Inbound::Closed => break,
            Inbound::IdleTimeout => {
                fail(&session, "no message within the idle window");
                break;
            }
            Inbound::ProtocolViolation(detail) => {
                fail(&session, &detail);
                break;
            }
            Inbound::Msg(msg) => match msg {
                ClientMessage::TextDelta {
                    session_id,
                    seq,
                    text,
                } => {
                    if session_id != session.session_id {
                        fail(&session, "session_id mismatch");
                        break;
                    }
                    if !session.accept_client_seq(seq) {
                        fail(&session, "out-of-order seq");
                        break;
                    }
                    if session.text_end_seen() {
                        fail(&session, "text_delta after text_end");
                        break;
                    }
                    if session.state() == SessionState::Idle {
                        session.transition_to(SessionState::Running);
                    }
                    let tx = session.text_sender();
                    tokio::select! {
                        _ = session.cancel.cancelled() => break,
                        sent = tx.send(TextEvent::Delta(text)) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                ClientMessage::TextEnd { session_id, seq } => {
                    if session_id != session.session_id {
                        fail(&session, "session_id mismatch");
                        break;
                    }
                    if !session.accept_client_seq(seq) {
                        fail(&session, "out-of-order seq");
                        break;
                    }
                    if session.text_end_seen() {
                        fail(&session, "duplicate text_end");
                        break;
                    }
                    if session.cancel.is_cancelled() {
                        // cancel crossed text_end on the wire; first wins.
                        debug!(
                            session_id = %session.session_id,
                            "text_end lost the race against cancel, dropping"
                        );
                        break;
                    }
                    session.mark_text_end();
                    session.transition_to(SessionState::Draining);
                    let tx = session.text_sender();
                    tokio::select! {
                        _ = session.cancel.cancelled() => break,
                        sent = tx.send(TextEvent::End) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                ClientMessage::Cancel { session_id } => {
                    if let Some(id) = &session_id {
                        if *id != session.session_id {
                            fail(&session, "session_id mismatch");
                            break;
                        }
                    }
                    if session.text_end_seen() {
                        // text_end crossed cancel on the wire; first wins.
                        debug!(
                            session_id = %session.session_id,
                            "cancel lost the race against text_end, dropping"
                        );
                        continue;
                    }
                    info!(session_id = %session.session_id, "client cancelled session");
                    session.begin_cancel(CancelCause::Client);
                    // Terminal frames come from the send task; keep reading
                    // until the transport winds down.
                }
                ClientMessage::Start { .. } => {
                    fail(&session, "session already started on this connection");
                    break;
                }
                ClientMessage::Resume { .. } => {
                    fail(&session, "resume must be the first message on a connection");
                    break;
                }
            },
        }
    }

    // Transport is gone (or this loop gave up). A live session becomes an
    // orphan and waits out the grace window for a resume.
    if !session.state().is_terminal() && session.mark_orphan() {
        info!(
            session_id = %session.session_id,
            grace_s = state.config.resume_grace.as_secs(),
            "transport lost, session orphaned"
        );
    }
}

/// Mid-session failure: record the fault and trip the latch; the send task
/// writes `error` + `tts_end{cancelled=true}` and tears the session down.
fn fail(session: &Arc<Session>, message: &str) {
    warn!(session_id = %session.session_id, message, "protocol failure");
    session.begin_cancel(CancelCause::Fault {
        kind: ErrorKind::ProtocolError,
        message: message.to_string(),
    });
}

// ---------------------------------------------------------------------------
// inbound plumbing
// ---------------------------------------------------------------------------

enum Inbound {
    Msg(ClientMessage),
    Closed,
    IdleTimeout,
    ProtocolViolation(String),
}

async fn next_message(reader: &mut WsReader, idle: Duration) -> Inbound {
    loop {
        match timeout(idle, reader.next()).await {
            Err(_) => return Inbound::IdleTimeout,
            Ok(None) => return Inbound::Closed,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "websocket read error");
                return Inbound::Closed;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(msg) => {
                        if let Err(detail) = msg.validate_size() {
                            return Inbound::ProtocolViolation(detail);
                        }
                        return Inbound::Msg(msg);
                    }
                    Err(e) => {
                        return Inbound::ProtocolViolation(format!("malformed message: {e}"));
                    }
                }
            }
            Ok(Some(Ok(Message::Binary(_)))) => {
                return Inbound::ProtocolViolation("binary frames are not part of the protocol".into());
            }
            Ok(Some(Ok(Message::Close(_)))) => return Inbound::Closed,
            Ok(Some(Ok(_))) => continue, // ping/pong
        }
    }
}

/// Pre-session rejection: the error is written straight to the socket
/// (there is no send task yet) and the connection closed.
async fn reject(state: &Arc<AppState>, sink: &mut WsSink, kind: ErrorKind, message: &str) {
    warn!(kind = %kind, message, "rejecting connection");
    state.metrics.inc_error(kind);
    let frame = ServerMessage::Error {
        seq: 0,
        kind,
        message: message.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = sink.send(Message::Text(json.into())).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}
