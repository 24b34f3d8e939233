//! Integration tests for voice-stream.
//!
//! Pipelines run against the loopback backend or against small local
//! WebSocket and HTTP servers; no audio hardware is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;
use url::Url;
use voice_stream::mock::{LoopbackFactory, MockEngine, MockInput};
use voice_stream::{
    ExceptionCode, FrameAccumulator, LifecycleState, NetworkTransportFactory, PipelineConfig,
    PipelineError, PipelineException, PipelineListener, PipelineSettings, Protocol, RequestFrame,
    Session, Transport, TransportContext, TransportError, TransportFactory, VoicePipeline,
    BLOCK_SIZE, GENERIC_CONVERSION_MESSAGE,
};

const QUANTUM: Duration = Duration::from_millis(1);

/// Routes pipeline logs to the test output; filter with `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        poll_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

fn loopback_settings(protocol: Protocol) -> PipelineSettings {
    PipelineSettings::new("http://127.0.0.1:1/", protocol)
        .unwrap()
        .with_chunk_block_count(2)
}

fn frame(level: f32) -> RequestFrame {
    let mut acc = FrameAccumulator::new(2);
    acc.push(&[level; BLOCK_SIZE]);
    acc.push(&[level; BLOCK_SIZE]).unwrap()
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Listener that keeps every exception and counts performance samples.
#[derive(Clone, Default)]
struct Collected {
    exceptions: Arc<Mutex<Vec<PipelineException>>>,
    performance: Arc<AtomicUsize>,
    intervals: Arc<AtomicUsize>,
}

impl Collected {
    fn listener(&self) -> PipelineListener {
        let exceptions = Arc::clone(&self.exceptions);
        let performance = Arc::clone(&self.performance);
        let intervals = Arc::clone(&self.intervals);
        PipelineListener::new()
            .on_exception(move |e| exceptions.lock().push(e.clone()))
            .on_performance(move |_| {
                performance.fetch_add(1, Ordering::SeqCst);
            })
            .on_buffering_interval(move |_| {
                intervals.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn exception_codes(&self) -> Vec<ExceptionCode> {
        self.exceptions.lock().iter().map(|e| e.code).collect()
    }
}

fn loopback_pipeline(
    name: &str,
    factory: &LoopbackFactory,
    collected: &Collected,
    input: MockInput,
) -> (Session, MockEngine) {
    init_tracing();
    let (session, processor) = VoicePipeline::builder()
        .name(name)
        .settings(loopback_settings(Protocol::Stream))
        .with_config(fast_config())
        .listener(collected.listener())
        .transport_factory(factory.clone())
        .build()
        .unwrap();
    (session, MockEngine::spawn(processor, input, QUANTUM))
}

fn near(samples: &[f32], level: f32) -> bool {
    samples.iter().any(|&s| (s - level).abs() < 1e-3)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loopback_round_trip_plays_converted_audio() {
    let factory = LoopbackFactory::new();
    let collected = Collected::default();
    let (session, engine) =
        loopback_pipeline("loop", &factory, &collected, MockInput::Constant(0.5));

    session.start().await.unwrap();
    assert_eq!(session.state(), LifecycleState::Running);
    wait_until("exchanges", || session.stats().exchanges_completed >= 5).await;
    session.stop().await.unwrap();
    assert_eq!(session.state(), LifecycleState::Idle);

    assert!(near(&engine.rendered(), 0.5));
    assert!(collected.performance.load(Ordering::SeqCst) >= 5);
    assert!(collected.intervals.load(Ordering::SeqCst) >= 5);
    assert!(collected.exceptions.lock().is_empty());
    assert!(session.telemetry().exchanges >= 5);
    assert_eq!(factory.created(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_is_idempotent() {
    let factory = LoopbackFactory::new();
    let collected = Collected::default();
    let (session, _engine) = loopback_pipeline("idem", &factory, &collected, MockInput::Silence);

    session.start().await.unwrap();
    session.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(session.stats().start_directives, 1);
    session.stop().await.unwrap();
    // Stopping twice is a no-op too
    session.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recording_captures_converted_output() {
    let factory = LoopbackFactory::new();
    let collected = Collected::default();
    let (session, _engine) =
        loopback_pipeline("rec", &factory, &collected, MockInput::Constant(0.25));

    session.arm_recording();
    session.start().await.unwrap();
    wait_until("exchanges", || session.stats().exchanges_completed >= 3).await;
    session.stop().await.unwrap();
    let recording = session.disarm_recording();

    assert!(!recording.is_empty());
    assert_eq!(recording.len() % (2 * BLOCK_SIZE), 0);
    assert!(near(&recording, 0.25));

    // Disarmed: nothing more is captured.
    assert!(session.disarm_recording().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_relay_routes_output_to_other_pipeline() {
    let collected = Collected::default();
    let (a, engine_a) =
        loopback_pipeline("a", &LoopbackFactory::new(), &collected, MockInput::Constant(0.5));
    let (b, engine_b) = loopback_pipeline("b", &LoopbackFactory::new(), &collected, MockInput::Silence);

    a.set_relay_target(Some(b.playback_port()));
    a.start().await.unwrap();
    wait_until("relayed audio", || near(&engine_b.rendered(), 0.5)).await;
    a.stop().await.unwrap();

    assert!(engine_a.rendered().iter().all(|&s| s == 0.0));
    assert_eq!(b.state(), LifecycleState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconfigure_keeps_transport_while_relaying() {
    let factory = LoopbackFactory::new();
    let collected = Collected::default();
    let (a, _engine_a) = loopback_pipeline("a", &factory, &collected, MockInput::Constant(0.5));
    let (b, _engine_b) =
        loopback_pipeline("b", &LoopbackFactory::new(), &collected, MockInput::Silence);
    assert_eq!(factory.created(), 1);

    a.set_relay_target(Some(b.playback_port()));
    a.reconfigure(loopback_settings(Protocol::RequestResponse))
        .await
        .unwrap();
    assert_eq!(a.settings().protocol, Protocol::RequestResponse);
    assert_eq!(factory.created(), 1);

    // Deferred recreation happens once the relay is cleared.
    a.set_relay_target(None);
    a.reconfigure(a.settings()).await.unwrap();
    assert_eq!(factory.created(), 2);
    assert_eq!(factory.latest().unwrap().name(), "loopback-request");

    // Same settings again: nothing to recreate.
    a.reconfigure(a.settings()).await.unwrap();
    assert_eq!(factory.created(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconfigure_block_count_resizes_frames() {
    let factory = LoopbackFactory::new();
    let collected = Collected::default();
    let (session, _engine) =
        loopback_pipeline("resize", &factory, &collected, MockInput::Constant(0.5));

    session
        .reconfigure(loopback_settings(Protocol::Stream).with_chunk_block_count(4))
        .await
        .unwrap();
    session.arm_recording();
    session.start().await.unwrap();
    wait_until("exchanges", || session.stats().exchanges_completed >= 2).await;
    session.stop().await.unwrap();

    let recording = session.disarm_recording();
    assert!(!recording.is_empty());
    assert_eq!(recording.len() % (4 * BLOCK_SIZE), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_drops_late_responses() {
    let factory = LoopbackFactory::new().with_delay(Duration::from_millis(300));
    let collected = Collected::default();
    let (session, engine) =
        loopback_pipeline("late", &factory, &collected, MockInput::Constant(0.5));

    session.start().await.unwrap();
    wait_until("a frame in flight", || session.stats().frames_sent >= 1).await;
    session.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stats = session.stats();
    assert_eq!(stats.exchanges_completed, 0);
    assert!(stats.late_responses_dropped >= 1);
    assert!(engine.rendered().iter().all(|&s| s == 0.0));
    assert_eq!(collected.performance.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exchange_failure_is_reported_and_pipeline_continues() {
    let factory = LoopbackFactory::new();
    let collected = Collected::default();
    let (session, _engine) =
        loopback_pipeline("fail", &factory, &collected, MockInput::Constant(0.5));
    factory
        .latest()
        .unwrap()
        .fail_next(TransportError::TruncatedResponse { len: 4 });

    session.start().await.unwrap();
    wait_until("recovery", || session.stats().exchanges_completed >= 2).await;
    session.stop().await.unwrap();

    assert_eq!(collected.exception_codes(), vec![ExceptionCode::InvalidResponse]);
    assert_eq!(session.stats().exchange_failures, 1);
    assert!(!session.is_halted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sample_rate_not_supported_halts_until_reconfigured() {
    let factory = LoopbackFactory::new();
    let collected = Collected::default();
    let (session, _engine) =
        loopback_pipeline("halt", &factory, &collected, MockInput::Constant(0.5));
    factory
        .latest()
        .unwrap()
        .fail_next(TransportError::SampleRateNotSupported {
            message: "48000Hz".into(),
        });

    session.start().await.unwrap();
    wait_until("halt", || session.is_halted()).await;
    let sent = session.stats().frames_sent;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.stats().frames_sent, sent);
    assert_eq!(
        collected.exception_codes(),
        vec![ExceptionCode::SampleRateNotSupported]
    );

    session.reconfigure(session.settings()).await.unwrap();
    assert!(!session.is_halted());
    wait_until("exchanges", || session.stats().exchanges_completed >= 1).await;
    session.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_session() {
    let factory = LoopbackFactory::new();
    let collected = Collected::default();
    let (mut session, _engine) =
        loopback_pipeline("closing", &factory, &collected, MockInput::Silence);

    session.start().await.unwrap();
    session.shutdown().await.unwrap();
    session.shutdown().await.unwrap();

    assert!(matches!(session.start().await, Err(PipelineError::Closed)));
    assert!(matches!(session.truncate_buffer(), Err(PipelineError::Closed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_state_follows_late_start_acknowledgement() {
    init_tracing();
    let (session, processor) = VoicePipeline::builder()
        .settings(loopback_settings(Protocol::Stream))
        .with_config(PipelineConfig {
            ack_timeout: Duration::from_millis(50),
            ..fast_config()
        })
        .transport_factory(LoopbackFactory::new())
        .build()
        .unwrap();

    // No engine yet: the Start directive sits in the queue.
    assert!(matches!(
        session.start().await,
        Err(PipelineError::AcknowledgementTimeout { directive: "start" })
    ));
    assert_eq!(session.state(), LifecycleState::Idle);

    let _engine = MockEngine::spawn(processor, MockInput::Silence, QUANTUM);
    wait_until("late start", || session.state() == LifecycleState::Running).await;

    session.stop().await.unwrap();
    assert_eq!(session.state(), LifecycleState::Idle);
}

#[test]
fn test_settings_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.toml");
    std::fs::write(
        &path,
        "chunk_block_count = 12\nprotocol = \"rest\"\nserver_endpoint = \"http://10.0.0.2:18888/\"\n",
    )
    .unwrap();

    let settings = PipelineSettings::load(&path).unwrap();
    assert_eq!(settings.chunk_block_count, 12);
    assert_eq!(settings.protocol, Protocol::RequestResponse);
    assert_eq!(settings.server_endpoint.as_str(), "http://10.0.0.2:18888/");
}

// WebSocket backend

/// What the WebSocket backend does with one request message.
enum WsReply {
    /// Send these messages after the delay.
    Send(Duration, Vec<String>),
    /// Drop the socket without answering.
    Hangup,
}

/// Serves WebSocket clients, answering each request message with whatever
/// `reply(timestamp, base64_audio)` returns.
async fn spawn_ws_backend<F>(reply: F) -> Url
where
    F: Fn(i64, &str) -> Vec<String> + Send + Sync + 'static,
{
    spawn_scripted_ws_backend(move |_, ts, audio| WsReply::Send(Duration::ZERO, reply(ts, audio)))
        .await
}

/// Like [`spawn_ws_backend`], but `reply(connection, timestamp, audio)` also
/// sees which connection (counting from 0) the request arrived on.
async fn spawn_scripted_ws_backend<F>(reply: F) -> Url
where
    F: Fn(usize, i64, &str) -> WsReply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let reply = Arc::new(reply);

    tokio::spawn(async move {
        let mut connections = 0;
        while let Ok((tcp, _)) = listener.accept().await {
            let reply = Arc::clone(&reply);
            let connection = connections;
            connections += 1;
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["event"] != "request_message" {
                        continue;
                    }
                    let ts = value["data"][0].as_i64().unwrap();
                    let audio = value["data"][1].as_str().unwrap();
                    let WsReply::Send(delay, messages) = reply(connection, ts, audio) else {
                        return;
                    };
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    for out in messages {
                        if ws.send(Message::Text(out)).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    Url::parse(&format!("http://{addr}/")).unwrap()
}

fn ws_response(ts: i64, audio: &str) -> String {
    json!({"event": "response", "data": [ts, audio, 1.5, 0.2, [0.001, 0.002, 0.001]]}).to_string()
}

fn stream_transport(endpoint: &Url) -> Arc<dyn Transport> {
    let settings = PipelineSettings {
        server_endpoint: endpoint.clone(),
        ..PipelineSettings::local().unwrap()
    };
    NetworkTransportFactory
        .create(
            &settings,
            TransportContext::from_config(&PipelineConfig::default()),
        )
        .unwrap()
}

#[tokio::test]
async fn test_stream_transport_echo() {
    init_tracing();
    let endpoint = spawn_ws_backend(|ts, audio| vec![ws_response(ts, audio)]).await;
    let transport = stream_transport(&endpoint);

    let envelope = transport.exchange(&frame(0.5), 1_000).await.unwrap();
    assert_eq!(envelope.sent_at_ms, 1_000);
    assert_eq!(envelope.audio, frame(0.5).to_le_bytes());
    assert_eq!(envelope.round_trip_extra_ms, 1.5);

    // Same socket, next frame.
    let envelope = transport.exchange(&frame(0.5), 1_001).await.unwrap();
    assert_eq!(envelope.sent_at_ms, 1_001);
    transport.close().await;
}

#[tokio::test]
async fn test_stream_transport_skips_stale_response() {
    let endpoint =
        spawn_ws_backend(|ts, audio| vec![ws_response(ts - 1, audio), ws_response(ts, audio)])
            .await;
    let transport = stream_transport(&endpoint);

    let envelope = transport.exchange(&frame(0.1), 2_000).await.unwrap();
    assert_eq!(envelope.sent_at_ms, 2_000);
}

#[tokio::test]
async fn test_stream_transport_newer_response_is_mismatch() {
    let endpoint = spawn_ws_backend(|ts, audio| vec![ws_response(ts + 10, audio)]).await;
    let transport = stream_transport(&endpoint);

    let err = transport.exchange(&frame(0.1), 3_000).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::ResponseMismatch {
            expected: 3_000,
            received: 3_010
        }
    ));
}

#[tokio::test]
async fn test_stream_transport_truncated_response() {
    let short = STANDARD.encode([0u8; 10]);
    let endpoint = spawn_ws_backend(move |ts, _| vec![ws_response(ts, &short)]).await;
    let transport = stream_transport(&endpoint);

    let err = transport.exchange(&frame(0.1), 4_000).await.unwrap_err();
    assert!(matches!(err, TransportError::TruncatedResponse { len: 10 }));
    assert_eq!(err.to_exception().code, ExceptionCode::InvalidResponse);
}

#[tokio::test]
async fn test_stream_transport_connect_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let endpoint = Url::parse(&format!("http://{addr}/")).unwrap();
    let err = stream_transport(&endpoint)
        .exchange(&frame(0.1), 1)
        .await
        .unwrap_err();
    assert_eq!(err.to_exception().code, ExceptionCode::ConnectFailed);
}

#[tokio::test]
async fn test_stream_transport_discards_reply_to_abandoned_frame() {
    init_tracing();
    let endpoint = spawn_scripted_ws_backend(|_, ts, audio| {
        if ts == 1 {
            let error = json!({
                "event": "error",
                "data": ["ERR_SAMPLE_RATE_NOT_SUPPORTED", "too late"]
            });
            WsReply::Send(Duration::from_millis(100), vec![error.to_string()])
        } else {
            WsReply::Send(Duration::ZERO, vec![ws_response(ts, audio)])
        }
    })
    .await;
    let transport = stream_transport(&endpoint);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), transport.exchange(&frame(0.1), 1)).await;
    assert!(abandoned.is_err());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The error meant for frame 1 must not fail frame 2.
    let envelope = transport.exchange(&frame(0.1), 2).await.unwrap();
    assert_eq!(envelope.sent_at_ms, 2);
}

fn stream_pipeline(endpoint: &Url, collected: &Collected) -> (Session, MockEngine) {
    let (session, processor) = VoicePipeline::builder()
        .settings(
            PipelineSettings::new(endpoint.as_str(), Protocol::Stream)
                .unwrap()
                .with_chunk_block_count(2),
        )
        .with_config(fast_config())
        .listener(collected.listener())
        .build()
        .unwrap();
    (
        session,
        MockEngine::spawn(processor, MockInput::Constant(0.5), QUANTUM),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_pipeline_reconnects_after_hangup() {
    init_tracing();
    let connections = Arc::new(AtomicUsize::new(0));
    let endpoint = {
        let connections = Arc::clone(&connections);
        spawn_scripted_ws_backend(move |connection, ts, audio| {
            connections.fetch_max(connection + 1, Ordering::SeqCst);
            if connection == 0 {
                WsReply::Hangup
            } else {
                WsReply::Send(Duration::ZERO, vec![ws_response(ts, audio)])
            }
        })
        .await
    };

    let collected = Collected::default();
    let (session, _engine) = stream_pipeline(&endpoint, &collected);

    session.start().await.unwrap();
    wait_until("exchanges", || session.stats().exchanges_completed >= 3).await;

    assert_eq!(session.state(), LifecycleState::Running);
    assert_eq!(collected.exception_codes(), vec![ExceptionCode::ConnectFailed]);
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    session.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconfigure_abandons_exchange_on_silent_backend() {
    init_tracing();
    let silent = spawn_ws_backend(|_, _| Vec::new()).await;
    let live = spawn_ws_backend(|ts, audio| vec![ws_response(ts, audio)]).await;

    let collected = Collected::default();
    let (session, _engine) = stream_pipeline(&silent, &collected);

    session.start().await.unwrap();
    wait_until("a frame in flight", || session.stats().frames_sent >= 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let began = Instant::now();
    session
        .reconfigure(
            PipelineSettings::new(live.as_str(), Protocol::Stream)
                .unwrap()
                .with_chunk_block_count(2),
        )
        .await
        .unwrap();
    assert!(began.elapsed() < Duration::from_secs(2));

    wait_until("exchanges", || session.stats().exchanges_completed >= 2).await;
    session.stop().await.unwrap();

    // The abandoned exchange reports nothing.
    assert!(collected.exceptions.lock().is_empty());
    assert!(session.stats().late_responses_dropped >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_pipeline_with_server_stats() {
    init_tracing();
    let endpoint = spawn_ws_backend(|ts, audio| {
        vec![
            json!({"event": "server_stats", "data": [0.3, [0.001, 0.002, 0.001]]}).to_string(),
            ws_response(ts, audio),
        ]
    })
    .await;

    let collected = Collected::default();
    let (session, processor) = VoicePipeline::builder()
        .settings(
            PipelineSettings::new(endpoint.as_str(), Protocol::Stream)
                .unwrap()
                .with_chunk_block_count(2),
        )
        .with_config(fast_config())
        .listener(collected.listener())
        .build()
        .unwrap();
    let engine = MockEngine::spawn(processor, MockInput::Constant(0.5), QUANTUM);

    session.start().await.unwrap();
    wait_until("exchanges", || session.stats().exchanges_completed >= 3).await;
    session.stop().await.unwrap();

    assert!(near(&engine.rendered(), 0.5));
    // Every exchange plus every stats push reaches the performance listener.
    assert!(collected.performance.load(Ordering::SeqCst) >= 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_pipeline_sample_rate_not_supported() {
    init_tracing();
    let endpoint = spawn_ws_backend(|_, _| {
        vec![json!({
            "event": "error",
            "data": ["ERR_SAMPLE_RATE_NOT_SUPPORTED", "48000Hz is not supported"]
        })
        .to_string()]
    })
    .await;

    let collected = Collected::default();
    let (session, processor) = VoicePipeline::builder()
        .settings(
            PipelineSettings::new(endpoint.as_str(), Protocol::Stream)
                .unwrap()
                .with_chunk_block_count(2),
        )
        .with_config(fast_config())
        .listener(collected.listener())
        .build()
        .unwrap();
    let _engine = MockEngine::spawn(processor, MockInput::Constant(0.5), QUANTUM);

    session.start().await.unwrap();
    wait_until("halt", || session.is_halted()).await;
    session.stop().await.unwrap();

    let exceptions = collected.exceptions.lock().clone();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].code, ExceptionCode::SampleRateNotSupported);
    assert_eq!(exceptions[0].message, "48000Hz is not supported");
}

// HTTP backend

async fn spawn_rest_backend(router: Router) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/")).unwrap()
}

async fn echo(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "sendTimestamp": body["timestamp"],
        "audio": body["buffer"],
        "ping": 2.0,
        "vol": 0.1,
        "perf": [0.001, 0.002, 0.001],
    }))
}

fn request_transport(endpoint: &Url) -> Arc<dyn Transport> {
    let settings = PipelineSettings {
        server_endpoint: endpoint.clone(),
        protocol: Protocol::RequestResponse,
        ..PipelineSettings::local().unwrap()
    };
    NetworkTransportFactory
        .create(
            &settings,
            TransportContext::from_config(&PipelineConfig::default()),
        )
        .unwrap()
}

#[tokio::test]
async fn test_request_transport_echo() {
    init_tracing();
    let endpoint = spawn_rest_backend(Router::new().route("/test", post(echo))).await;
    let transport = request_transport(&endpoint);
    assert!(transport.concurrent());

    let envelope = transport.exchange(&frame(0.5), 5_000).await.unwrap();
    assert_eq!(envelope.sent_at_ms, 5_000);
    assert_eq!(envelope.audio, frame(0.5).to_le_bytes());
    assert_eq!(envelope.round_trip_extra_ms, 2.0);
    assert_eq!(envelope.volume, 0.1);
}

#[tokio::test]
async fn test_request_transport_http_error_is_generic() {
    let router = Router::new().route("/test", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
    let endpoint = spawn_rest_backend(router).await;

    let err = request_transport(&endpoint)
        .exchange(&frame(0.5), 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::BackendConversion { ref code, .. } if code == "HTTP_500"
    ));

    let exception = err.to_exception();
    assert_eq!(exception.code, ExceptionCode::GenericConversion);
    assert_eq!(exception.message, GENERIC_CONVERSION_MESSAGE);
}

#[tokio::test]
async fn test_request_transport_backend_error_body() {
    let router = Router::new().route(
        "/test",
        post(|| async {
            Json(json!({
                "error": true,
                "details": {"code": "ERR_SAMPLE_RATE_NOT_SUPPORTED", "message": "use 48000"}
            }))
        }),
    );
    let endpoint = spawn_rest_backend(router).await;

    let err = request_transport(&endpoint)
        .exchange(&frame(0.5), 1)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.to_exception().message, "use 48000");
}

#[tokio::test]
async fn test_request_transport_rejects_foreign_timestamp() {
    let router = Router::new().route(
        "/test",
        post(|Json(body): Json<Value>| async move {
            Json(json!({
                "sendTimestamp": i64::MIN,
                "audio": body["buffer"],
                "perf": [0.001, 0.002, 0.001],
            }))
        }),
    );
    let endpoint = spawn_rest_backend(router).await;

    let err = request_transport(&endpoint)
        .exchange(&frame(0.5), 7)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::ResponseMismatch {
            expected: 7,
            received: i64::MIN
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_pipeline_survives_bogus_timestamps() {
    init_tracing();
    let router = Router::new().route(
        "/test",
        post(|Json(body): Json<Value>| async move {
            Json(json!({"sendTimestamp": i64::MIN, "audio": body["buffer"]}))
        }),
    );
    let endpoint = spawn_rest_backend(router).await;

    let collected = Collected::default();
    let (session, processor) = VoicePipeline::builder()
        .settings(
            PipelineSettings::new(endpoint.as_str(), Protocol::RequestResponse)
                .unwrap()
                .with_chunk_block_count(2),
        )
        .with_config(fast_config())
        .listener(collected.listener())
        .build()
        .unwrap();
    let _engine = MockEngine::spawn(processor, MockInput::Constant(0.5), QUANTUM);

    session.start().await.unwrap();
    wait_until("failures", || session.stats().exchange_failures >= 3).await;
    session.stop().await.unwrap();

    assert_eq!(session.stats().exchanges_completed, 0);
    assert!(collected
        .exception_codes()
        .iter()
        .all(|&code| code == ExceptionCode::InvalidResponse));
}

#[tokio::test]
async fn test_request_transport_completes_out_of_order() {
    let router = Router::new().route(
        "/test",
        post(|Json(body): Json<Value>| async move {
            if body["timestamp"].as_i64() == Some(1) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            echo(Json(body)).await
        }),
    );
    let endpoint = spawn_rest_backend(router).await;
    let transport = request_transport(&endpoint);

    let completed = Arc::new(Mutex::new(Vec::new()));
    let exchange = |ts: i64| {
        let transport = Arc::clone(&transport);
        let completed = Arc::clone(&completed);
        async move {
            let envelope = transport.exchange(&frame(0.5), ts).await.unwrap();
            completed.lock().push(envelope.sent_at_ms);
        }
    };
    futures::join!(exchange(1), exchange(2));

    assert_eq!(*completed.lock(), vec![2, 1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_pipeline_delivers_overlapping_exchanges() {
    init_tracing();
    let served = Arc::new(AtomicUsize::new(0));
    let router = Router::new().route(
        "/test",
        post({
            let served = Arc::clone(&served);
            move |body: Json<Value>| {
                let n = served.fetch_add(1, Ordering::SeqCst);
                async move {
                    // Every third frame is overtaken by the two after it.
                    if n % 3 == 0 {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                    }
                    echo(body).await
                }
            }
        }),
    );
    let endpoint = spawn_rest_backend(router).await;

    let collected = Collected::default();
    let (session, processor) = VoicePipeline::builder()
        .settings(
            PipelineSettings::new(endpoint.as_str(), Protocol::RequestResponse)
                .unwrap()
                .with_chunk_block_count(2),
        )
        .with_config(fast_config())
        .listener(collected.listener())
        .build()
        .unwrap();
    let _engine = MockEngine::spawn(processor, MockInput::Constant(0.5), QUANTUM);

    session.arm_recording();
    session.start().await.unwrap();
    wait_until("exchanges", || session.stats().exchanges_completed >= 12).await;
    session.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = session.stats();
    let recording = session.disarm_recording();
    assert_eq!(stats.exchange_failures, 0);
    assert!(collected.exceptions.lock().is_empty());
    assert_eq!(recording.len(), stats.exchanges_completed as usize * 2 * BLOCK_SIZE);
    assert_eq!(
        collected.performance.load(Ordering::SeqCst),
        stats.exchanges_completed as usize
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_pipeline_round_trip() {
    init_tracing();
    let endpoint = spawn_rest_backend(Router::new().route("/test", post(echo))).await;

    let collected = Collected::default();
    let (session, processor) = VoicePipeline::builder()
        .settings(
            PipelineSettings::new(endpoint.as_str(), Protocol::RequestResponse)
                .unwrap()
                .with_chunk_block_count(2),
        )
        .with_config(fast_config())
        .listener(collected.listener())
        .build()
        .unwrap();
    let engine = MockEngine::spawn(processor, MockInput::Constant(0.5), QUANTUM);

    session.start().await.unwrap();
    wait_until("exchanges", || session.stats().exchanges_completed >= 5).await;
    session.stop().await.unwrap();

    assert!(near(&engine.rendered(), 0.5));
    assert!(collected.exceptions.lock().is_empty());
}
