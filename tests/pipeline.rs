//! End-to-end controller scenarios against simulated devices and a scripted
//! duplex session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use voicelink::audio::sim::{SimSink, SimSource};
use voicelink::controller::{PipelineOptions, SessionController, StatusEvent};
use voicelink::protocol::{SessionConfig, SessionEvent, TransportEnvelope};
use voicelink::session::{Connector, DuplexSession};
use voicelink::state::SessionState;
use voicelink::TransportError;

struct ScriptedSession {
    sent: Arc<Mutex<Vec<TransportEnvelope>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl DuplexSession for ScriptedSession {
    async fn send(&self, envelope: TransportEnvelope) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }
    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedConnector {
    events: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    sent: Arc<Mutex<Vec<TransportEnvelope>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        _config: &SessionConfig,
    ) -> Result<(Box<dyn DuplexSession>, mpsc::Receiver<SessionEvent>), TransportError> {
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .expect("connector used twice");
        Ok((
            Box::new(ScriptedSession {
                sent: self.sent.clone(),
                closed: self.closed.clone(),
            }),
            events,
        ))
    }
}

/// Connector stuck forever in the handshake.
struct NeverConnector;

#[async_trait]
impl Connector for NeverConnector {
    async fn connect(
        &self,
        _config: &SessionConfig,
    ) -> Result<(Box<dyn DuplexSession>, mpsc::Receiver<SessionEvent>), TransportError> {
        std::future::pending().await
    }
}

struct Harness {
    backend_tx: mpsc::Sender<SessionEvent>,
    sent: Arc<Mutex<Vec<TransportEnvelope>>>,
    closed: Arc<AtomicUsize>,
    source_released: Arc<AtomicUsize>,
    sink_released: Arc<AtomicUsize>,
}

fn options(connect_timeout: Option<Duration>, cancel_on_interrupt: bool) -> PipelineOptions {
    PipelineOptions {
        session: SessionConfig {
            endpoint: "wss://backend.test/live".to_string(),
            token: "test-token".to_string(),
            system_instruction: "coach".to_string(),
            voice_response: true,
            send_sample_rate: 16000,
            receive_sample_rate: 24000,
        },
        connect_timeout,
        cancel_on_interrupt,
    }
}

fn start_pipeline(
    opts: PipelineOptions,
    source_blocks: usize,
) -> (
    voicelink::ControllerHandle,
    mpsc::Receiver<StatusEvent>,
    Harness,
) {
    let (backend_tx, backend_rx) = mpsc::channel(32);
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicUsize::new(0));
    let source_released = Arc::new(AtomicUsize::new(0));
    let sink_released = Arc::new(AtomicUsize::new(0));

    let connector = ScriptedConnector {
        events: Mutex::new(Some(backend_rx)),
        sent: sent.clone(),
        closed: closed.clone(),
    };

    let (sink_tx, sink_rx) = mpsc::channel(32);
    let source = SimSource::new(16000, 4096)
        .with_block_limit(source_blocks)
        .with_release_counter(source_released.clone());
    let sink = SimSink::new(24000, sink_tx).with_release_counter(sink_released.clone());

    let (handle, status_rx) = SessionController::spawn(
        opts,
        Box::new(source),
        Box::new(sink),
        sink_rx,
        Box::new(connector),
    );
    (
        handle,
        status_rx,
        Harness {
            backend_tx,
            sent,
            closed,
            source_released,
            sink_released,
        },
    )
}

async fn next_state(rx: &mut mpsc::Receiver<StatusEvent>) -> SessionState {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for status")
            .expect("status stream ended early");
        if let StatusEvent::State(state) = event {
            return state;
        }
    }
}

async fn next_level(rx: &mut mpsc::Receiver<StatusEvent>) -> f32 {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for status")
            .expect("status stream ended early");
        if let StatusEvent::InputLevel(level) = event {
            return level;
        }
    }
}

/// `ms` milliseconds of silence at the 24 kHz inbound rate.
fn delta(ms: u64) -> SessionEvent {
    SessionEvent::AudioDelta(bytes::Bytes::from(vec![0u8; (24 * 2 * ms) as usize]))
}

#[tokio::test(start_paused = true)]
async fn full_conversation_cycle() {
    let (handle, mut status, h) = start_pipeline(options(None, false), 3);

    assert_eq!(next_state(&mut status).await, SessionState::Connecting);
    h.backend_tx.send(SessionEvent::Opened).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Listening);

    // Three capture blocks flow out once the session is open, each with a
    // level reading.
    for _ in 0..3 {
        let level = next_level(&mut status).await;
        assert!(level > 0.0, "sine input should meter above zero");
    }
    tokio::task::yield_now().await;
    {
        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|e| e.mime_type == "audio/pcm;rate=16000"));
    }

    // First response byte: Speaking.
    h.backend_tx.send(delta(500)).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Speaking);
    h.backend_tx.send(delta(300)).await.unwrap();
    h.backend_tx.send(SessionEvent::TurnComplete).await.unwrap();

    // Back to Listening only after the last scheduled chunk ends.
    assert_eq!(next_state(&mut status).await, SessionState::Listening);

    handle.stop().await;
    assert_eq!(next_state(&mut status).await, SessionState::Closed);

    // No status after stop completes, and each device released exactly once.
    handle.join().await;
    while let Some(event) = status.recv().await {
        assert!(
            !matches!(event, StatusEvent::State(_)),
            "no state changes after Closed"
        );
    }
    assert_eq!(h.source_released.load(Ordering::SeqCst), 1);
    assert_eq!(h.sink_released.load(Ordering::SeqCst), 1);
    assert_eq!(h.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_delta_is_skipped_without_state_change() {
    let (handle, mut status, h) = start_pipeline(options(None, false), 0);

    assert_eq!(next_state(&mut status).await, SessionState::Connecting);
    h.backend_tx.send(SessionEvent::Opened).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Listening);

    // Odd byte count: dropped locally, session stays in Listening.
    h.backend_tx
        .send(SessionEvent::AudioDelta(bytes::Bytes::from(vec![0u8; 41])))
        .await
        .unwrap();

    // A well-formed delta right after still works, proving the session
    // survived and exactly one chunk was lost.
    h.backend_tx.send(delta(100)).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Speaking);

    handle.stop().await;
    assert_eq!(next_state(&mut status).await, SessionState::Closed);
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn interruption_returns_to_listening_and_truncates() {
    let (handle, mut status, h) = start_pipeline(options(None, true), 0);

    assert_eq!(next_state(&mut status).await, SessionState::Connecting);
    h.backend_tx.send(SessionEvent::Opened).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Listening);

    // Long backlog, then barge-in.
    h.backend_tx.send(delta(500)).await.unwrap();
    h.backend_tx.send(delta(500)).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Speaking);

    h.backend_tx.send(SessionEvent::Interrupted).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Listening);

    // The next turn schedules from "now" and speaks again.
    h.backend_tx.send(delta(100)).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Speaking);
    h.backend_tx.send(SessionEvent::TurnComplete).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Listening);

    handle.stop().await;
    assert_eq!(next_state(&mut status).await, SessionState::Closed);
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn thinking_only_honored_from_listening() {
    let (handle, mut status, h) = start_pipeline(options(None, false), 0);

    assert_eq!(next_state(&mut status).await, SessionState::Connecting);
    // Before the session opens the request is dropped.
    handle.request_thinking().await;
    h.backend_tx.send(SessionEvent::Opened).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Listening);

    handle.request_thinking().await;
    assert_eq!(next_state(&mut status).await, SessionState::Thinking);

    // The first response delta takes over from Thinking.
    h.backend_tx.send(delta(100)).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Speaking);

    // Ignored while Speaking: the next state change is the turn ending,
    // never Thinking.
    handle.request_thinking().await;
    h.backend_tx.send(SessionEvent::TurnComplete).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Listening);

    handle.stop().await;
    assert_eq!(next_state(&mut status).await, SessionState::Closed);
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn stop_while_connecting_releases_devices_once() {
    let (sink_tx, sink_rx) = mpsc::channel(8);
    let source_released = Arc::new(AtomicUsize::new(0));
    let sink_released = Arc::new(AtomicUsize::new(0));
    let source = SimSource::new(16000, 4096).with_release_counter(source_released.clone());
    let sink = SimSink::new(24000, sink_tx).with_release_counter(sink_released.clone());

    let (handle, mut status) = SessionController::spawn(
        options(None, false),
        Box::new(source),
        Box::new(sink),
        sink_rx,
        Box::new(NeverConnector),
    );

    assert_eq!(next_state(&mut status).await, SessionState::Connecting);
    handle.stop().await;
    assert_eq!(next_state(&mut status).await, SessionState::Closed);
    handle.join().await;

    assert_eq!(source_released.load(Ordering::SeqCst), 1);
    assert_eq!(sink_released.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_fails_the_session() {
    let (sink_tx, sink_rx) = mpsc::channel(8);
    let source = SimSource::new(16000, 4096);
    let sink = SimSink::new(24000, sink_tx);

    let (handle, mut status) = SessionController::spawn(
        options(Some(Duration::from_millis(100)), false),
        Box::new(source),
        Box::new(sink),
        sink_rx,
        Box::new(NeverConnector),
    );

    assert_eq!(next_state(&mut status).await, SessionState::Connecting);
    assert_eq!(next_state(&mut status).await, SessionState::Failed);
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn transport_error_fails_and_releases() {
    let (handle, mut status, h) = start_pipeline(options(None, false), 0);

    assert_eq!(next_state(&mut status).await, SessionState::Connecting);
    h.backend_tx.send(SessionEvent::Opened).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Listening);

    h.backend_tx
        .send(SessionEvent::Error("backend gone".to_string()))
        .await
        .unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Failed);
    handle.join().await;

    assert_eq!(h.source_released.load(Ordering::SeqCst), 1);
    assert_eq!(h.sink_released.load(Ordering::SeqCst), 1);
    assert_eq!(h.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let (handle, mut status, h) = start_pipeline(options(None, false), 0);

    assert_eq!(next_state(&mut status).await, SessionState::Connecting);
    h.backend_tx.send(SessionEvent::Opened).await.unwrap();
    assert_eq!(next_state(&mut status).await, SessionState::Listening);

    handle.stop().await;
    handle.stop().await;
    assert_eq!(next_state(&mut status).await, SessionState::Closed);
    handle.join().await;

    assert_eq!(h.source_released.load(Ordering::SeqCst), 1);
    assert_eq!(h.sink_released.load(Ordering::SeqCst), 1);
}
