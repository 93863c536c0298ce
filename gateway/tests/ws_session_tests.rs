//! End-to-end session flows over a real WebSocket transport.
//!
//! Every test binds the full router on an ephemeral port and drives it with
//! a tokio-tungstenite client against the deterministic dummy engine, so
//! the PCM concatenation identity is directly assertable.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use ws_tts_gateway::config::{ApiKey, GatewayConfig};
use ws_tts_gateway::core::audio::{AudioFormat, AudioSpec};
use ws_tts_gateway::core::engine::{DummyEngine, DummyEngineConfig};
use ws_tts_gateway::routes::build_router;
use ws_tts_gateway::{AppState, TtsEngine};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> GatewayConfig {
    GatewayConfig {
        engine: "dummy".into(),
        ..GatewayConfig::default()
    }
}

fn dummy_engine() -> Arc<dyn TtsEngine> {
    Arc::new(DummyEngine::new(DummyEngineConfig::default()))
}

async fn spawn_gateway(
    config: GatewayConfig,
    engine: Arc<dyn TtsEngine>,
) -> (SocketAddr, Arc<AppState>) {
    let state = AppState::new(config, engine);
    let _ = state.registry.spawn_reaper(Duration::from_millis(50));
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, query: &str) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/tts{query}"))
        .await
        .expect("websocket connect");
    ws
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(WsMessage::Text(value.to_string()))
        .await
        .expect("send frame");
}

/// Next JSON frame, or None once the server closed the connection.
async fn recv_json(ws: &mut WsClient) -> Option<Value> {
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")?;
        match frame {
            Ok(WsMessage::Text(text)) => {
                return Some(serde_json::from_str(&text).expect("frame is JSON"));
            }
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

fn start_message(session_id: &str, format: &str, sample_rate: u32) -> Value {
    json!({
        "type": "start",
        "session_id": session_id,
        "audio_format": format,
        "sample_rate": sample_rate,
        "channels": 1,
    })
}

/// Collects frames until `tts_end`, returning (audio chunks, tts_end).
async fn collect_until_end(ws: &mut WsClient) -> (Vec<Value>, Value) {
    let mut chunks = Vec::new();
    loop {
        let frame = recv_json(ws).await.expect("stream ended before tts_end");
        match frame["type"].as_str() {
            Some("audio_chunk") => chunks.push(frame),
            Some("tts_end") => return (chunks, frame),
            other => panic!("unexpected frame type {other:?}: {frame}"),
        }
    }
}

/// Asserts the universal stream invariants over a chunk sequence.
fn assert_chunk_invariants(chunks: &[Value], first_chunk_seq: u64) {
    let mut expected_chunk_seq = first_chunk_seq;
    let mut prev_server_seq = 0;
    let mut prev_unit_end: Option<u64> = None;
    for chunk in chunks {
        assert_eq!(
            chunk["chunk_seq"].as_u64().unwrap(),
            expected_chunk_seq,
            "chunk_seq must be dense"
        );
        expected_chunk_seq += 1;

        let seq = chunk["seq"].as_u64().unwrap();
        assert!(seq > prev_server_seq, "server seq must be monotone");
        prev_server_seq = seq;

        let start = chunk["unit_index_start"].as_u64().unwrap();
        let end = chunk["unit_index_end"].as_u64().unwrap();
        assert!(start <= end);
        if let Some(prev) = prev_unit_end {
            assert!(start <= prev + 1, "unit cover must not skip");
            assert!(prev <= end, "unit cover must not move backwards");
        }
        prev_unit_end = Some(end);
    }
}

fn decoded_pcm(chunks: &[Value]) -> Vec<u8> {
    chunks
        .iter()
        .flat_map(|c| {
            BASE64
                .decode(c["audio_base64"].as_str().unwrap())
                .expect("valid base64")
        })
        .collect()
}

// ===========================================================================
// S1: baseline happy path
// ===========================================================================

#[tokio::test]
async fn test_s1_baseline_start_text_end() {
    let (addr, _state) = spawn_gateway(test_config(), dummy_engine()).await;
    let mut ws = connect(addr, "").await;

    send_json(&mut ws, start_message("s1", "pcm16_raw", 16000)).await;
    let ack = recv_json(&mut ws).await.unwrap();
    assert_eq!(ack["type"], "start_ack");
    assert_eq!(ack["session_id"], "s1");
    assert_eq!(ack["audio_format"], "pcm16_raw");
    assert_eq!(ack["sample_rate"], 16000);
    assert_eq!(ack["channels"], 1);
    assert_eq!(ack["seq"], 0);

    send_json(
        &mut ws,
        json!({"type": "text_delta", "session_id": "s1", "seq": 1, "text": "Hello, world."}),
    )
    .await;
    send_json(&mut ws, json!({"type": "text_end", "session_id": "s1", "seq": 2})).await;

    let (chunks, end) = collect_until_end(&mut ws).await;
    assert!(!chunks.is_empty());
    assert_eq!(chunks[0]["unit_index_start"], 0);
    assert_eq!(end["cancelled"], false);
    assert_chunk_invariants(&chunks, 1);

    // Concatenated audio equals exactly what the engine produced for the
    // accepted text.
    let spec = AudioSpec {
        audio_format: AudioFormat::Pcm16Raw,
        sample_rate: 16000,
        channels: 1,
    };
    let expected = DummyEngine::pcm_for("Hello, world.", &spec);
    assert_eq!(decoded_pcm(&chunks), expected.to_vec());

    // The server closes after the terminal frame.
    assert!(recv_json(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_s1_wav_header_on_first_chunk_only() {
    let (addr, _state) = spawn_gateway(test_config(), dummy_engine()).await;
    let mut ws = connect(addr, "").await;

    send_json(&mut ws, start_message("wav1", "pcm16_wav", 22050)).await;
    let ack = recv_json(&mut ws).await.unwrap();
    assert_eq!(ack["audio_format"], "pcm16_wav");

    send_json(
        &mut ws,
        json!({"type": "text_delta", "session_id": "wav1", "seq": 1, "text": "One. Two. Three."}),
    )
    .await;
    send_json(&mut ws, json!({"type": "text_end", "session_id": "wav1", "seq": 2})).await;

    let (chunks, _end) = collect_until_end(&mut ws).await;
    assert!(chunks.len() >= 2);

    let header = BASE64
        .decode(chunks[0]["wav_header_base64"].as_str().expect("first chunk has header"))
        .unwrap();
    assert_eq!(header.len(), 44);
    assert_eq!(&header[0..4], b"RIFF");
    // Streaming sentinel in the data-size field.
    assert_eq!(&header[40..44], &0xFFFF_FFFFu32.to_le_bytes());

    for chunk in &chunks[1..] {
        assert!(chunk.get("wav_header_base64").is_none());
    }
}

// ===========================================================================
// S2: cancel mid-stream
// ===========================================================================

#[tokio::test]
async fn test_s2_cancel_mid_stream() {
    let engine = Arc::new(DummyEngine::new(DummyEngineConfig {
        ms_per_char: 20,
        native_sample_rate: None,
    }));
    let (addr, _state) = spawn_gateway(test_config(), engine).await;
    let mut ws = connect(addr, "").await;

    send_json(&mut ws, start_message("s2", "pcm16_raw", 16000)).await;
    recv_json(&mut ws).await.unwrap(); // ack

    send_json(
        &mut ws,
        json!({
            "type": "text_delta",
            "session_id": "s2",
            "seq": 1,
            "text": "A long sentence that will keep the engine busy for a while."
        }),
    )
    .await;

    // Wait for the first audio chunk, then cancel.
    let first = recv_json(&mut ws).await.unwrap();
    assert_eq!(first["type"], "audio_chunk");
    send_json(&mut ws, json!({"type": "cancel", "session_id": "s2"})).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut saw_end = false;
    while let Some(frame) = recv_json(&mut ws).await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "stream must settle promptly after cancel"
        );
        match frame["type"].as_str() {
            Some("audio_chunk") => continue, // frames already in flight
            Some("tts_end") => {
                assert_eq!(frame["cancelled"], true);
                saw_end = true;
            }
            other => panic!("unexpected frame after cancel: {other:?}"),
        }
        if saw_end {
            break;
        }
    }
    assert!(saw_end);
    // Nothing follows the terminal frame.
    assert!(recv_json(&mut ws).await.is_none());
}

// ===========================================================================
// S3/S4: resume
// ===========================================================================

#[tokio::test]
async fn test_s3_resume_replays_retained_chunks() {
    let (addr, _state) = spawn_gateway(test_config(), dummy_engine()).await;
    let mut ws = connect(addr, "").await;

    send_json(&mut ws, start_message("s3", "pcm16_raw", 16000)).await;
    recv_json(&mut ws).await.unwrap(); // ack
    send_json(
        &mut ws,
        json!({
            "type": "text_delta",
            "session_id": "s3",
            "seq": 1,
            "text": "First sentence. Second sentence. Third sentence."
        }),
    )
    .await;

    // Read a handful of chunks, remember where we stopped, then vanish.
    let mut received = Vec::new();
    for _ in 0..3 {
        let frame = recv_json(&mut ws).await.unwrap();
        assert_eq!(frame["type"], "audio_chunk");
        received.push(frame);
    }
    let cursor = received.last().unwrap()["unit_index_end"].as_u64().unwrap();
    drop(ws);

    // Give the server a moment to notice the dead transport.
    sleep(Duration::from_millis(100)).await;

    let mut ws = connect(addr, "").await;
    send_json(
        &mut ws,
        json!({"type": "resume", "session_id": "s3", "last_unit_index_received": cursor}),
    )
    .await;

    // Replayed chunks cover only units past the cursor, in order.
    let mut replayed_any = false;
    let mut prev_chunk_seq = 0;
    for _ in 0..50 {
        let frame = recv_json(&mut ws).await.unwrap();
        assert_eq!(frame["type"], "audio_chunk");
        let start = frame["unit_index_start"].as_u64().unwrap();
        assert!(start > cursor, "replay must be strictly past the cursor");
        let chunk_seq = frame["chunk_seq"].as_u64().unwrap();
        assert!(chunk_seq > prev_chunk_seq);
        prev_chunk_seq = chunk_seq;
        replayed_any = true;
        // Stop probing once the queue quiets down.
        if frame["unit_index_end"].as_u64().unwrap() >= 2 {
            break;
        }
    }
    assert!(replayed_any, "retained chunks past the cursor must replay");

    // The session is live again: more text streams more audio.
    send_json(
        &mut ws,
        json!({"type": "text_delta", "session_id": "s3", "seq": 2, "text": " And a fourth."}),
    )
    .await;
    send_json(&mut ws, json!({"type": "text_end", "session_id": "s3", "seq": 3})).await;

    let (live_chunks, end) = collect_until_end(&mut ws).await;
    assert!(!live_chunks.is_empty());
    assert_eq!(end["cancelled"], false);
}

#[tokio::test]
async fn test_s4_resume_after_grace_expiry() {
    let config = GatewayConfig {
        resume_grace: Duration::from_millis(200),
        ..test_config()
    };
    let (addr, _state) = spawn_gateway(config, dummy_engine()).await;
    let mut ws = connect(addr, "").await;

    send_json(&mut ws, start_message("s4", "pcm16_raw", 16000)).await;
    recv_json(&mut ws).await.unwrap(); // ack
    send_json(
        &mut ws,
        json!({"type": "text_delta", "session_id": "s4", "seq": 1, "text": "Some words here."}),
    )
    .await;
    drop(ws);

    // Sleep well past grace so the reaper sweeps the orphan.
    sleep(Duration::from_millis(600)).await;

    let mut ws = connect(addr, "").await;
    send_json(
        &mut ws,
        json!({"type": "resume", "session_id": "s4", "last_unit_index_received": 0}),
    )
    .await;
    let frame = recv_json(&mut ws).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "resume_not_available");
    assert!(recv_json(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_resume_rejected_for_live_session() {
    let (addr, _state) = spawn_gateway(test_config(), dummy_engine()).await;
    let mut ws = connect(addr, "").await;
    send_json(&mut ws, start_message("live", "pcm16_raw", 16000)).await;
    recv_json(&mut ws).await.unwrap();

    // A second connection cannot adopt a session that is not orphaned.
    let mut thief = connect(addr, "").await;
    send_json(
        &mut thief,
        json!({"type": "resume", "session_id": "live", "last_unit_index_received": 0}),
    )
    .await;
    let frame = recv_json(&mut thief).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "resume_not_available");
}

// ===========================================================================
// S6: engine-native sample rate mismatch
// ===========================================================================

#[tokio::test]
async fn test_s6_unsupported_sample_rate() {
    let engine = Arc::new(DummyEngine::new(DummyEngineConfig {
        ms_per_char: 0,
        native_sample_rate: Some(22050),
    }));
    let (addr, state) = spawn_gateway(test_config(), engine).await;
    let mut ws = connect(addr, "").await;

    send_json(&mut ws, start_message("s6", "pcm16_raw", 16000)).await;
    let frame = recv_json(&mut ws).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "unsupported_sample_rate");
    assert!(recv_json(&mut ws).await.is_none());
    assert_eq!(state.registry.active_count(), 0, "no session registered");
}

#[tokio::test]
async fn test_sample_rate_outside_whitelist() {
    let (addr, _state) = spawn_gateway(test_config(), dummy_engine()).await;
    let mut ws = connect(addr, "").await;
    send_json(&mut ws, start_message("w", "pcm16_raw", 44100)).await;
    let frame = recv_json(&mut ws).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "unsupported_sample_rate");
}

// ===========================================================================
// Admission control & auth
// ===========================================================================

#[tokio::test]
async fn test_capacity_exhausted() {
    let config = GatewayConfig {
        max_sessions: 1,
        ..test_config()
    };
    let (addr, _state) = spawn_gateway(config, dummy_engine()).await;

    let mut first = connect(addr, "").await;
    send_json(&mut first, start_message("one", "pcm16_raw", 16000)).await;
    recv_json(&mut first).await.unwrap(); // ack

    let mut second = connect(addr, "").await;
    send_json(&mut second, start_message("two", "pcm16_raw", 16000)).await;
    let frame = recv_json(&mut second).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "capacity_exhausted");
}

#[tokio::test]
async fn test_duplicate_session_id_rejected() {
    let (addr, _state) = spawn_gateway(test_config(), dummy_engine()).await;

    let mut first = connect(addr, "").await;
    send_json(&mut first, start_message("dup", "pcm16_raw", 16000)).await;
    recv_json(&mut first).await.unwrap();

    let mut second = connect(addr, "").await;
    send_json(&mut second, start_message("dup", "pcm16_raw", 16000)).await;
    let frame = recv_json(&mut second).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "protocol_error");
}

#[tokio::test]
async fn test_auth_failed_without_key() {
    let config = GatewayConfig {
        api_keys: vec![ApiKey {
            id: "alice".into(),
            key: "s3cret".into(),
        }],
        ..test_config()
    };
    let (addr, _state) = spawn_gateway(config, dummy_engine()).await;

    let mut ws = connect(addr, "").await;
    let frame = recv_json(&mut ws).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "auth_failed");
    assert!(recv_json(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_auth_via_query_parameter() {
    let config = GatewayConfig {
        api_keys: vec![ApiKey {
            id: "alice".into(),
            key: "s3cret".into(),
        }],
        ..test_config()
    };
    let (addr, _state) = spawn_gateway(config, dummy_engine()).await;

    // Browser-style auth: no headers, query parameter only.
    let mut ws = connect(addr, "?api_key=s3cret").await;
    send_json(&mut ws, start_message("authed", "pcm16_raw", 16000)).await;
    let ack = recv_json(&mut ws).await.unwrap();
    assert_eq!(ack["type"], "start_ack");
}

// ===========================================================================
// Protocol errors
// ===========================================================================

#[tokio::test]
async fn test_first_message_must_be_start_or_resume() {
    let (addr, _state) = spawn_gateway(test_config(), dummy_engine()).await;
    let mut ws = connect(addr, "").await;
    send_json(
        &mut ws,
        json!({"type": "text_delta", "session_id": "x", "seq": 1, "text": "hi"}),
    )
    .await;
    let frame = recv_json(&mut ws).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "protocol_error");
}

#[tokio::test]
async fn test_malformed_json_is_protocol_error() {
    let (addr, _state) = spawn_gateway(test_config(), dummy_engine()).await;
    let mut ws = connect(addr, "").await;
    ws.send(WsMessage::Text("{not json".into())).await.unwrap();
    let frame = recv_json(&mut ws).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "protocol_error");
}

#[tokio::test]
async fn test_out_of_order_seq_terminates_session() {
    let (addr, _state) = spawn_gateway(test_config(), dummy_engine()).await;
    let mut ws = connect(addr, "").await;
    send_json(&mut ws, start_message("seqs", "pcm16_raw", 16000)).await;
    recv_json(&mut ws).await.unwrap();

    send_json(
        &mut ws,
        json!({"type": "text_delta", "session_id": "seqs", "seq": 5, "text": "Hello, "}),
    )
    .await;
    send_json(
        &mut ws,
        json!({"type": "text_delta", "session_id": "seqs", "seq": 4, "text": "again"}),
    )
    .await;

    // Everything until the error is ordinary audio; then error + end.
    let mut saw_error = false;
    let mut saw_end = false;
    while let Some(frame) = recv_json(&mut ws).await {
        match frame["type"].as_str() {
            Some("audio_chunk") => continue,
            Some("error") => {
                assert_eq!(frame["kind"], "protocol_error");
                saw_error = true;
            }
            Some("tts_end") => {
                assert_eq!(frame["cancelled"], true);
                saw_end = true;
                break;
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert!(saw_error);
    assert!(saw_end);
}

// ===========================================================================
// Isolation (S5, functional half)
// ===========================================================================

#[tokio::test]
async fn test_stalled_session_does_not_affect_others() {
    let config = GatewayConfig {
        queue_capacity: 4,
        backpressure_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let (addr, _state) = spawn_gateway(config, dummy_engine()).await;

    // One client starts a large job and never reads.
    let mut stalled = connect(addr, "").await;
    send_json(&mut stalled, start_message("stalled", "pcm16_raw", 48000)).await;
    let big_text = "stall ".repeat(2000);
    send_json(
        &mut stalled,
        json!({"type": "text_delta", "session_id": "stalled", "seq": 1, "text": big_text}),
    )
    .await;
    send_json(&mut stalled, json!({"type": "text_end", "session_id": "stalled", "seq": 2})).await;
    // Deliberately stop reading `stalled` from here on.

    // Meanwhile several live sessions run to completion untouched.
    let mut workers = Vec::new();
    for i in 0..4 {
        let mut ws = connect(addr, "").await;
        let id = format!("ok-{i}");
        send_json(&mut ws, start_message(&id, "pcm16_raw", 16000)).await;
        recv_json(&mut ws).await.unwrap(); // ack
        send_json(
            &mut ws,
            json!({"type": "text_delta", "session_id": id, "seq": 1, "text": "Quick check."}),
        )
        .await;
        send_json(&mut ws, json!({"type": "text_end", "session_id": id, "seq": 2})).await;
        workers.push(ws);
    }

    for mut ws in workers {
        let (chunks, end) = collect_until_end(&mut ws).await;
        assert!(!chunks.is_empty());
        assert_eq!(end["cancelled"], false);
    }
}

#[tokio::test]
async fn test_concurrent_sessions_all_complete() {
    let (addr, _state) = spawn_gateway(test_config(), dummy_engine()).await;
    let mut handles = Vec::new();
    for i in 0..8 {
        let handle = tokio::spawn(async move {
            let mut ws = connect(addr, "").await;
            let id = format!("c{i}");
            send_json(&mut ws, start_message(&id, "pcm16_raw", 16000)).await;
            let ack = recv_json(&mut ws).await.unwrap();
            assert_eq!(ack["session_id"], id);
            let text = format!("Session {i} says hello, world.");
            send_json(
                &mut ws,
                json!({"type": "text_delta", "session_id": id, "seq": 1, "text": text}),
            )
            .await;
            send_json(&mut ws, json!({"type": "text_end", "session_id": id, "seq": 2})).await;

            let (chunks, end) = collect_until_end(&mut ws).await;
            assert_eq!(end["cancelled"], false);

            let spec = AudioSpec {
                audio_format: AudioFormat::Pcm16Raw,
                sample_rate: 16000,
                channels: 1,
            };
            let expected = DummyEngine::pcm_for(&text, &spec);
            let got: Vec<u8> = chunks
                .iter()
                .flat_map(|c| BASE64.decode(c["audio_base64"].as_str().unwrap()).unwrap())
                .collect();
            assert_eq!(got, expected.to_vec());
        });
        handles.push(handle);
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

// ===========================================================================
// HTTP introspection
// ===========================================================================

#[tokio::test]
async fn test_healthz_endpoint() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    let state = AppState::new(test_config(), dummy_engine());
    let app = build_router(state);

    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["engine_resolved"], "dummy");
    assert_eq!(json["sessions_active"], 0);
    assert!(json["uptime_s"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    let state = AppState::new(test_config(), dummy_engine());
    let app = build_router(state);

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("ws_tts_sessions_active 0"));
    assert!(text.contains("ws_tts_sessions_total"));
}
