//! Session controller: the single event loop coordinating capture, the
//! duplex session, and playback scheduling.
//!
//! One logical thread of control per session: every cross-stage handoff is
//! an mpsc channel feeding the `tokio::select!` below, so session events are
//! processed strictly in arrival order and no callback re-enters the state
//! machine.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::capture::{self, CaptureEvent};
use crate::audio::codec;
use crate::audio::device::{AudioSink, AudioSource, SinkEvent};
use crate::audio::scheduler::PlaybackScheduler;
use crate::protocol::{SessionConfig, SessionEvent};
use crate::session::{Connector, DuplexSession};
use crate::state::SessionState;

/// Commands the surrounding application can issue while a session runs.
#[derive(Debug)]
pub enum ControlCommand {
    /// Idempotent teardown, callable from any state.
    Stop,
    /// UI-requested "thinking" substate; only honored from Listening.
    Thinking,
}

/// Externally visible status stream.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// The session entered a new state. Note that `Failed` only ever covers
    /// a running session: device acquisition happens in the caller before
    /// [`SessionController::spawn`], so a microphone or speaker that cannot
    /// be opened surfaces as a constructor error, not as a `Failed` status.
    State(SessionState),
    /// RMS level of the latest capture block, for metering.
    InputLevel(f32),
}

/// Knobs beyond the session parameters themselves.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub session: SessionConfig,
    /// Give up on a session stuck in `Connecting` after this long.
    /// `None` reproduces the indefinite wait.
    pub connect_timeout: Option<Duration>,
    /// On interruption, drop chunks that are scheduled but not yet
    /// rendering instead of letting them play out.
    pub cancel_on_interrupt: bool,
}

/// Handle to a running controller.
pub struct ControllerHandle {
    cmd_tx: mpsc::Sender<ControlCommand>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Request teardown. Safe to call repeatedly or after the session has
    /// already ended.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(ControlCommand::Stop).await;
    }

    pub async fn request_thinking(&self) {
        let _ = self.cmd_tx.send(ControlCommand::Thinking).await;
    }

    /// Wait for the controller loop to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

enum Step {
    Continue,
    Done,
}

pub struct SessionController {
    options: PipelineOptions,
    state: SessionState,
    /// True between the first delta of a turn and its TurnComplete (or an
    /// interruption); more audio may still arrive for this turn.
    turn_open: bool,
    status_tx: mpsc::Sender<StatusEvent>,
    cmd_rx: mpsc::Receiver<ControlCommand>,
    /// Held until `Opened` starts the pump, which then owns the device.
    source: Option<Box<dyn AudioSource>>,
    scheduler: PlaybackScheduler,
    sink_events: mpsc::Receiver<SinkEvent>,
    session: Option<Box<dyn DuplexSession>>,
    capture_tx: mpsc::Sender<CaptureEvent>,
    capture_rx: mpsc::Receiver<CaptureEvent>,
    pump_shutdown: watch::Sender<bool>,
    pump: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Spawn a controller over already-acquired devices. Returns the control
    /// handle and the status stream.
    ///
    /// Device acquisition itself happens in the caller (backend `open`), so
    /// a microphone/speaker failure surfaces before `Connecting` is ever
    /// entered.
    pub fn spawn(
        options: PipelineOptions,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
        sink_events: mpsc::Receiver<SinkEvent>,
        connector: Box<dyn Connector>,
    ) -> (ControllerHandle, mpsc::Receiver<StatusEvent>) {
        let (status_tx, status_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (capture_tx, capture_rx) = mpsc::channel(16);
        let (pump_shutdown, _) = watch::channel(false);
        if sink.sample_rate() != options.session.receive_sample_rate {
            tracing::warn!(
                sink_rate = sink.sample_rate(),
                wire_rate = options.session.receive_sample_rate,
                "playback device rate differs from the inbound wire rate"
            );
        }
        let scheduler = PlaybackScheduler::new(sink, options.cancel_on_interrupt);

        let controller = Self {
            options,
            state: SessionState::Idle,
            turn_open: false,
            status_tx,
            cmd_rx,
            source: Some(source),
            scheduler,
            sink_events,
            session: None,
            capture_tx,
            capture_rx,
            pump_shutdown,
            pump: None,
        };

        let task = tokio::spawn(controller.run(connector));
        (ControllerHandle { cmd_tx, task }, status_rx)
    }

    async fn run(mut self, connector: Box<dyn Connector>) {
        self.set_state(SessionState::Connecting).await;

        let deadline = self
            .options
            .connect_timeout
            .map(|t| tokio::time::Instant::now() + t);

        // Open the duplex session, still answering stop() while we wait.
        let session_config = self.options.session.clone();
        let connect = async move { connector.connect(&session_config).await };
        tokio::pin!(connect);
        let mut events = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok((session, events)) => {
                        self.session = Some(session);
                        break events;
                    }
                    Err(e) => {
                        tracing::error!("session connect failed: {e}");
                        self.fail().await;
                        return;
                    }
                },
                Some(cmd) = self.cmd_rx.recv() => {
                    if matches!(cmd, ControlCommand::Stop) {
                        self.teardown().await;
                        self.set_state(SessionState::Closed).await;
                        return;
                    }
                    // Thinking is meaningless before the session opens.
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    tracing::error!("session connect timed out");
                    self.fail().await;
                    return;
                }
            }
        };

        loop {
            let step = tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd).await,
                event = events.recv() => match event {
                    Some(event) => self.handle_session_event(event).await,
                    // Event stream gone without a terminal event: treat as
                    // an unexpected close.
                    None => {
                        self.fail().await;
                        Step::Done
                    }
                },
                Some(capture) = self.capture_rx.recv() => self.handle_capture_event(capture).await,
                Some(sink_event) = self.sink_events.recv() => {
                    self.handle_sink_event(sink_event).await
                }
                _ = sleep_until_opt(deadline),
                    if deadline.is_some() && self.state == SessionState::Connecting =>
                {
                    tracing::error!("session never opened within the connect timeout");
                    self.fail().await;
                    Step::Done
                }
            };
            if matches!(step, Step::Done) {
                return;
            }
        }
    }

    async fn handle_command(&mut self, cmd: ControlCommand) -> Step {
        match cmd {
            ControlCommand::Stop => {
                self.teardown().await;
                self.set_state(SessionState::Closed).await;
                Step::Done
            }
            ControlCommand::Thinking => {
                // Never override the idle-between-utterances state machine
                // from other states.
                if self.state == SessionState::Listening {
                    self.set_state(SessionState::Thinking).await;
                }
                Step::Continue
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) -> Step {
        match event {
            SessionEvent::Opened => {
                if self.state == SessionState::Connecting {
                    self.start_pump();
                    self.set_state(SessionState::Listening).await;
                }
                Step::Continue
            }
            SessionEvent::AudioDelta(payload) => {
                let chunk = match codec::decode_pcm16(
                    &payload,
                    self.options.session.receive_sample_rate,
                ) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        // Local, recoverable: drop the chunk, keep going.
                        tracing::warn!("skipping malformed audio delta: {e}");
                        return Step::Continue;
                    }
                };
                if let Err(e) = self.scheduler.schedule_next(chunk) {
                    tracing::error!("playback device failed: {e}");
                    self.fail().await;
                    return Step::Done;
                }
                self.turn_open = true;
                if matches!(self.state, SessionState::Listening | SessionState::Thinking) {
                    self.set_state(SessionState::Speaking).await;
                }
                Step::Continue
            }
            SessionEvent::Interrupted => {
                self.scheduler.reset_to_now();
                self.turn_open = false;
                if !self.state.is_terminal() && self.state != SessionState::Connecting {
                    self.set_state(SessionState::Listening).await;
                }
                Step::Continue
            }
            SessionEvent::TurnComplete => {
                self.turn_open = false;
                if self.scheduler.is_idle() && self.state == SessionState::Speaking {
                    self.set_state(SessionState::Listening).await;
                }
                Step::Continue
            }
            SessionEvent::Closed => {
                self.teardown().await;
                self.set_state(SessionState::Closed).await;
                Step::Done
            }
            SessionEvent::Error(reason) => {
                tracing::error!("session error: {reason}");
                self.fail().await;
                Step::Done
            }
        }
    }

    async fn handle_capture_event(&mut self, event: CaptureEvent) -> Step {
        match event {
            CaptureEvent::Block { envelope, level } => {
                let _ = self.status_tx.send(StatusEvent::InputLevel(level)).await;
                if let Some(session) = &self.session {
                    if let Err(e) = session.send(envelope).await {
                        tracing::error!("outbound send failed: {e}");
                        self.fail().await;
                        return Step::Done;
                    }
                }
                Step::Continue
            }
            CaptureEvent::Failed(e) => {
                tracing::error!("capture device failed: {e}");
                self.fail().await;
                Step::Done
            }
        }
    }

    async fn handle_sink_event(&mut self, event: SinkEvent) -> Step {
        match event {
            SinkEvent::ChunkEnded => {
                let drained = self.scheduler.on_chunk_ended();
                if drained && !self.turn_open && self.state == SessionState::Speaking {
                    self.set_state(SessionState::Listening).await;
                }
                Step::Continue
            }
        }
    }

    fn start_pump(&mut self) {
        if let Some(source) = self.source.take() {
            let tx = self.capture_tx.clone();
            let shutdown = self.pump_shutdown.subscribe();
            let wire_rate = self.options.session.send_sample_rate;
            self.pump = Some(tokio::spawn(capture::run_pump(
                source, wire_rate, tx, shutdown,
            )));
        }
    }

    async fn fail(&mut self) {
        self.teardown().await;
        self.set_state(SessionState::Failed).await;
    }

    /// Release everything exactly once: stop the pump (which drops the
    /// capture device), close the session, and let the scheduler's sink drop
    /// with `self`. Safe to call when parts never started.
    async fn teardown(&mut self) {
        let _ = self.pump_shutdown.send(true);
        // Unblock a pump stuck on a full capture queue.
        self.capture_rx.close();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        // Pump never started: the source is still ours to release.
        drop(self.source.take());
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    async fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition(next) {
            tracing::warn!("ignoring illegal transition {:?} -> {:?}", self.state, next);
            return;
        }
        tracing::info!("session state {:?} -> {:?}", self.state, next);
        self.state = next;
        let _ = self.status_tx.send(StatusEvent::State(next)).await;
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
