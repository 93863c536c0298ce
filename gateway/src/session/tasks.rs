//! The per-session task pair: synthesis producer and send consumer.
//!
//! The synthesis task drains the text FIFO, drives the engine, and feeds the
//! bounded outbound queue. The send task drains that queue to the transport
//! under a per-write timeout. They share nothing else but the cancellation
//! latch and the session state; the synthesis path never touches the
//! transport directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::core::audio::AudioFormat;
use crate::core::engine::{EngineError, TtsEngine};
use crate::core::segmenter::{SegmenterConfig, TextSegmenter, TextUnit};
use crate::errors::ErrorKind;
use crate::metrics::Metrics;
use crate::protocol::ServerMessage;
use crate::session::emitter::ChunkEmitter;
use crate::session::registry::SessionRegistry;
use crate::session::retention::RetainedChunk;
use crate::session::{CancelCause, Session, TextEvent};

/// First-retry delay for a transient engine failure; doubles per attempt
/// but is capped at 500 ms. Only one retry is made.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(250);
const RETRY_BACKOFF_CAP: Duration = Duration::from_millis(500);

/// Knobs the synthesis task needs from the gateway configuration.
#[derive(Debug, Clone)]
pub struct SynthesisParams {
    pub segmenter: SegmenterConfig,
    /// Target chunk duration, in milliseconds of audio.
    pub chunk_ms: u64,
    /// How long an outbound enqueue may stall before the session is
    /// terminated for backpressure.
    pub enqueue_timeout: Duration,
}

/// Result of pushing work towards the client.
#[derive(Debug, PartialEq, Eq)]
enum SendOutcome {
    Sent,
    /// The latch tripped (cancel, fault, or teardown); stop producing.
    Stopped,
}

// ---------------------------------------------------------------------------
// Synthesis task
// ---------------------------------------------------------------------------

/// Runs until the text stream finishes, the latch trips, or the session is
/// torn down. Emits the terminal `tts_end{cancelled=false}` itself on the
/// clean path; every cancelled path leaves terminal frames to the send task.
pub async fn run_synthesis(
    session: Arc<Session>,
    engine: Arc<dyn TtsEngine>,
    mut text_rx: mpsc::Receiver<TextEvent>,
    params: SynthesisParams,
    metrics: Arc<Metrics>,
) {
    let spec = session.spec;
    let mut segmenter = TextSegmenter::new(params.segmenter.clone());
    let mut emitter = ChunkEmitter::new(&spec, params.chunk_ms);
    let mut wav_header =
        matches!(spec.audio_format, AudioFormat::Pcm16Wav).then(|| spec.wav_header());

    'main: loop {
        let event = tokio::select! {
            _ = session.cancel.cancelled() => break 'main,
            event = text_rx.recv() => match event {
                Some(event) => event,
                None => break 'main, // session torn down
            },
        };

        let (units, finished) = match event {
            TextEvent::Delta(text) => (segmenter.push(&text), false),
            TextEvent::End => (vec![segmenter.finish()], true),
        };

        for unit in units {
            if synthesize_unit(
                &session,
                engine.as_ref(),
                &unit,
                &mut emitter,
                &mut wav_header,
                &params,
                &metrics,
            )
            .await
                == SendOutcome::Stopped
            {
                break 'main;
            }
        }

        if finished {
            if let Some(chunk) = emitter.flush() {
                if enqueue_chunk(&session, chunk, &mut wav_header, &params, &metrics).await
                    == SendOutcome::Stopped
                {
                    break 'main;
                }
            }
            if session.try_emit_tts_end() {
                let end = ServerMessage::TtsEnd {
                    seq: session.next_server_seq(),
                    cancelled: false,
                };
                // Kept until a transport actually confirms the write, so a
                // resume after an orphaned finish can re-deliver it.
                session.set_pending_terminal(end.clone());
                enqueue_frame(&session, end, params.enqueue_timeout).await;
            }
            break 'main;
        }
    }

    debug!(session_id = %session.session_id, "synthesis task finished");
}

/// Synthesizes one unit, retrying a transient failure once as long as the
/// unit has not yet produced audio (a retry after partial audio would
/// duplicate samples on the wire).
async fn synthesize_unit(
    session: &Arc<Session>,
    engine: &dyn TtsEngine,
    unit: &TextUnit,
    emitter: &mut ChunkEmitter,
    wav_header: &mut Option<bytes::Bytes>,
    params: &SynthesisParams,
    metrics: &Arc<Metrics>,
) -> SendOutcome {
    if unit.text.is_empty() {
        return SendOutcome::Sent; // the emitter folds silent units in
    }

    let mut attempt: u32 = 0;
    loop {
        let mut emitted_audio = false;
        match stream_unit(
            session,
            engine,
            unit,
            emitter,
            wav_header,
            params,
            metrics,
            &mut emitted_audio,
        )
        .await
        {
            Ok(outcome) => return outcome,
            Err(EngineError::Cancelled) => return SendOutcome::Stopped,
            Err(e) if e.is_retriable() && attempt == 0 && !emitted_audio => {
                attempt += 1;
                let backoff = (RETRY_BACKOFF_BASE * 2u32.pow(attempt - 1)).min(RETRY_BACKOFF_CAP);
                warn!(
                    session_id = %session.session_id,
                    unit_index = unit.index,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient engine failure, retrying unit"
                );
                tokio::select! {
                    _ = session.cancel.cancelled() => return SendOutcome::Stopped,
                    _ = sleep(backoff) => {}
                }
            }
            Err(e) => {
                error!(
                    session_id = %session.session_id,
                    unit_index = unit.index,
                    error = %e,
                    "engine failure, terminating session"
                );
                session.begin_cancel(CancelCause::Fault {
                    kind: ErrorKind::EngineError,
                    message: e.to_string(),
                });
                return SendOutcome::Stopped;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_unit(
    session: &Arc<Session>,
    engine: &dyn TtsEngine,
    unit: &TextUnit,
    emitter: &mut ChunkEmitter,
    wav_header: &mut Option<bytes::Bytes>,
    params: &SynthesisParams,
    metrics: &Arc<Metrics>,
    emitted_audio: &mut bool,
) -> Result<SendOutcome, EngineError> {
    let mut pcm_stream = engine
        .synthesize(&unit.text, &session.spec, &session.cancel)
        .await?;

    loop {
        let item = tokio::select! {
            _ = session.cancel.cancelled() => return Err(EngineError::Cancelled),
            item = pcm_stream.next() => item,
        };
        let Some(item) = item else {
            return Ok(SendOutcome::Sent); // unit fully synthesized
        };
        let pcm = item?;

        for chunk in emitter.push(unit.index, &pcm) {
            *emitted_audio = true;
            if enqueue_chunk(session, chunk, wav_header, params, metrics).await
                == SendOutcome::Stopped
            {
                return Ok(SendOutcome::Stopped);
            }
        }
    }
}

/// Frames an emitted chunk, enqueues it, and copies it into retention once
/// the enqueue succeeded (an undelivered chunk must stay replayable through
/// the live retry path instead).
async fn enqueue_chunk(
    session: &Arc<Session>,
    chunk: crate::session::emitter::EmittedChunk,
    wav_header: &mut Option<bytes::Bytes>,
    params: &SynthesisParams,
    metrics: &Arc<Metrics>,
) -> SendOutcome {
    let retained = RetainedChunk {
        seq: session.next_server_seq(),
        chunk_seq: chunk.chunk_seq,
        unit_index_start: chunk.unit_index_start,
        unit_index_end: chunk.unit_index_end,
        pcm: chunk.pcm,
        wav_header: wav_header.take(),
        emitted_at: Instant::now(),
    };
    let message = ServerMessage::audio_chunk(
        retained.seq,
        retained.chunk_seq,
        retained.unit_index_start,
        retained.unit_index_end,
        &retained.pcm,
        retained.wav_header.as_ref(),
    );

    match enqueue_frame(session, message, params.enqueue_timeout).await {
        SendOutcome::Sent => {
            if let Some(ttfa) = session.record_first_audio() {
                metrics.observe_ttfa_ms(ttfa.as_secs_f64() * 1000.0);
            }
            session.retention().lock().push(retained);
            SendOutcome::Sent
        }
        SendOutcome::Stopped => SendOutcome::Stopped,
    }
}

/// Puts one frame on the outbound queue.
///
/// Three ways this can not complete immediately:
/// - queue full: bounded wait, then the session dies for backpressure;
/// - receiver gone: the transport dropped, so block until the session is
///   adopted by a new transport (or the latch trips / grace expires);
/// - latch tripped: give up.
async fn enqueue_frame(
    session: &Arc<Session>,
    message: ServerMessage,
    enqueue_timeout: Duration,
) -> SendOutcome {
    loop {
        let tx = session.sender();
        tokio::select! {
            _ = session.cancel.cancelled() => return SendOutcome::Stopped,
            result = timeout(enqueue_timeout, tx.send(message.clone())) => match result {
                Ok(Ok(())) => return SendOutcome::Sent,
                Ok(Err(_)) => {
                    // Transport gone; the registry reaper bounds this wait.
                    debug!(
                        session_id = %session.session_id,
                        "outbound queue detached, waiting for resume"
                    );
                    tokio::select! {
                        _ = session.cancel.cancelled() => return SendOutcome::Stopped,
                        _ = session.wait_resumed() => continue,
                    }
                }
                Err(_) => {
                    warn!(
                        session_id = %session.session_id,
                        stalled_ms = enqueue_timeout.as_millis() as u64,
                        "outbound queue full too long, terminating slow client"
                    );
                    session.begin_cancel(CancelCause::Fault {
                        kind: ErrorKind::Backpressure,
                        message: "client too slow to read audio".into(),
                    });
                    return SendOutcome::Stopped;
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Send task
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum WriteError {
    Timeout,
    Transport,
}

/// Drains the outbound queue to the transport in FIFO order.
///
/// Exits when: the terminal frame is written (session CLOSED), a write
/// fails or times out (session ORPHAN, grace clock starts), the latch trips
/// (terminal frames written directly), or the session is torn down.
pub async fn run_send<S>(
    session: Arc<Session>,
    mut rx: mpsc::Receiver<ServerMessage>,
    mut sink: S,
    registry: Arc<SessionRegistry>,
    write_timeout: Duration,
    metrics: Arc<Metrics>,
) where
    S: Sink<Message, Error = axum::Error> + Unpin + Send,
{
    loop {
        tokio::select! {
            // Once the latch trips, residual queued frames must be dropped,
            // not written; check it ahead of the queue.
            biased;
            _ = session.cancel.cancelled() => {
                flush_cancelled(&session, &mut rx, &mut sink, &registry, write_timeout, &metrics)
                    .await;
                return;
            }
            maybe = rx.recv() => match maybe {
                Some(message) => {
                    let terminal = message.is_terminal();
                    match write_frame(&mut sink, &message, write_timeout).await {
                        Ok(()) => {
                            if terminal {
                                session.clear_pending_terminal();
                                finish_closed(&session, &registry, &mut sink).await;
                                return;
                            }
                        }
                        Err(WriteError::Timeout) => {
                            warn!(
                                session_id = %session.session_id,
                                "transport write timed out, orphaning session"
                            );
                            session.mark_orphan();
                            return;
                        }
                        Err(WriteError::Transport) => {
                            debug!(
                                session_id = %session.session_id,
                                "transport write failed, orphaning session"
                            );
                            session.mark_orphan();
                            return;
                        }
                    }
                }
                None => return, // session torn down, sender side dropped
            },
        }
    }
}

/// Cancelled shutdown: residual queued frames are dropped (a queued
/// terminal frame survives), then `error` (for faults) and `tts_end` are
/// written directly before closing.
async fn flush_cancelled<S>(
    session: &Arc<Session>,
    rx: &mut mpsc::Receiver<ServerMessage>,
    sink: &mut S,
    registry: &Arc<SessionRegistry>,
    write_timeout: Duration,
    metrics: &Arc<Metrics>,
) where
    S: Sink<Message, Error = axum::Error> + Unpin + Send,
{
    let mut queued_end = None;
    while let Ok(message) = rx.try_recv() {
        if message.is_terminal() {
            queued_end = Some(message);
        }
    }

    if let Some(CancelCause::Fault { kind, message }) = session.cancel_cause() {
        metrics.inc_error(kind);
        let frame = ServerMessage::Error {
            seq: session.next_server_seq(),
            kind,
            message,
        };
        let _ = write_frame(sink, &frame, write_timeout).await;
    }

    let end = queued_end
        // A clean finish may have marked its terminal frame but lost the
        // enqueue race against the drain above.
        .or_else(|| session.pending_terminal())
        .or_else(|| {
            session.try_emit_tts_end().then(|| ServerMessage::TtsEnd {
                seq: session.next_server_seq(),
                cancelled: true,
            })
        });
    if let Some(end) = end {
        let _ = write_frame(sink, &end, write_timeout).await;
    }
    session.clear_pending_terminal();

    finish_closed(session, registry, sink).await;
}

async fn finish_closed<S>(session: &Arc<Session>, registry: &Arc<SessionRegistry>, sink: &mut S)
where
    S: Sink<Message, Error = axum::Error> + Unpin + Send,
{
    session.force_close();
    registry.remove(&session.session_id);
    let _ = sink.send(Message::Close(None)).await;
    info!(session_id = %session.session_id, "session closed");
}

async fn write_frame<S>(
    sink: &mut S,
    message: &ServerMessage,
    write_timeout: Duration,
) -> Result<(), WriteError>
where
    S: Sink<Message, Error = axum::Error> + Unpin + Send,
{
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            // A server-built frame failing to serialize is a bug; skip it
            // rather than kill the transport.
            error!(error = %e, "failed to serialize outbound frame");
            return Ok(());
        }
    };
    match timeout(write_timeout, sink.send(Message::Text(json.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(WriteError::Transport),
        Err(_) => Err(WriteError::Timeout),
    }
}
