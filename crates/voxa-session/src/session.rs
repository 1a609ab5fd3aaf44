//! Session lifecycle and the single-writer engine loop
//!
//! [`SessionController`] is the public entry point: `start(agent_id)` looks
//! the agent up, picks the transport, acquires capture and playback
//! resources, and spawns the engine task; `stop()` shuts it down. All
//! mutable session state (detector, scheduler, clocks) is owned by that one
//! engine task, which multiplexes capture frames, transport events, decode
//! completions, and output-engine notifications through a single select
//! loop. Nothing else mutates it, so there are no ordering races between
//! event sources.

use crate::capture::{CaptureConfig, CaptureFrame, CaptureHandle, CaptureSource};
use crate::cleanup::SessionResources;
use crate::config::SessionTunables;
use crate::directory::{AgentDirectory, AgentKind};
use crate::error::{SessionError, SessionResult};
use crate::playback::{ChunkDecoder, DecodeJob, DecodeOutcome, Pcm16Decoder, PlaybackScheduler};
use crate::sink::{OutputSinkFactory, SinkEvent};
use crate::speech::{SpeechDetector, SpeechEdge};
use crate::transport::{
    ManagedRoomTransport, RoomProvisioner, RoomSessionRequest, StreamingTransport,
    TransportAdapter, TransportEvent, TransportKind,
};
use crate::wire::{self, AudioChunk};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Observable lifecycle state of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    /// The last start attempt failed. A new start is permitted.
    Error(String),
}

/// Events broadcast to observers while a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Sustained user speech confirmed.
    SpeechStarted,
    /// Sustained silence confirmed.
    SpeechStopped,
    /// Agent playback was cut off (barge-in or remote marker).
    Interrupted,
    /// The remote side ended the transport.
    RemoteClosed { reason: String },
}

/// Metadata for a running session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub kind: TransportKind,
    pub started_at: DateTime<Utc>,
}

/// Static configuration for the controller.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tunables: SessionTunables,
    pub capture: CaptureConfig,
    /// Endpoint for SPEECH-typed agents (the streaming transport).
    pub streaming_endpoint: String,
}

struct Runtime {
    info: SessionInfo,
    shutdown: mpsc::UnboundedSender<()>,
    engine: tokio::task::JoinHandle<()>,
}

struct Inner {
    /// Bumped by every `stop`; a start attempt that observes a bump between
    /// beginning and committing tears its resources back down.
    epoch: u64,
    starting: bool,
    runtime: Option<Runtime>,
}

/// Entry point for running live voice sessions. Methods take `&self`; the
/// controller serializes lifecycle changes internally.
pub struct SessionController {
    config: SessionConfig,
    directory: Arc<dyn AgentDirectory>,
    provisioner: Arc<dyn RoomProvisioner>,
    sink_factory: Arc<dyn OutputSinkFactory>,
    capture: std::sync::Mutex<Box<dyn CaptureSource>>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    /// Shared with the engine task so an engine that ends on its own (remote
    /// close) can deregister its runtime.
    inner: Arc<Mutex<Inner>>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        directory: Arc<dyn AgentDirectory>,
        provisioner: Arc<dyn RoomProvisioner>,
        capture: Box<dyn CaptureSource>,
        sink_factory: Arc<dyn OutputSinkFactory>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            directory,
            provisioner,
            sink_factory,
            capture: std::sync::Mutex::new(capture),
            state,
            events,
            inner: Arc::new(Mutex::new(Inner {
                epoch: 0,
                starting: false,
                runtime: None,
            })),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Subscribe to session events (speech edges, interruptions, remote
    /// close).
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Metadata for the running session, if any.
    pub async fn info(&self) -> Option<SessionInfo> {
        self.inner.lock().await.runtime.as_ref().map(|r| r.info.clone())
    }

    /// Start a session against `agent_id`: directory lookup selects the
    /// transport, then capture, transport, and (for streaming) the playback
    /// pipeline come up in order. Any failure tears down what was already
    /// acquired and surfaces the error.
    pub async fn start(&self, agent_id: &str) -> SessionResult<SessionInfo> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if inner.starting || inner.runtime.is_some() {
                return Err(SessionError::InvalidState(
                    "a session is already starting or active".to_string(),
                ));
            }
            inner.starting = true;
            self.state.send_replace(SessionState::Connecting);
            inner.epoch
        };

        let result = self.bring_up(agent_id, epoch).await;
        match result {
            Ok(info) => Ok(info),
            Err(e) => {
                let stopped = {
                    let mut inner = self.inner.lock().await;
                    inner.starting = false;
                    inner.epoch != epoch
                };
                // A start aborted by a concurrent stop ends in an orderly
                // Idle, whatever the failure was; only a genuine bring-up
                // failure reports Error.
                if stopped || matches!(e, SessionError::InvalidState(_)) {
                    self.state.send_replace(SessionState::Idle);
                } else {
                    error!("session start failed: {}", e);
                    self.state.send_replace(SessionState::Error(e.to_string()));
                }
                Err(e)
            }
        }
    }

    async fn bring_up(&self, agent_id: &str, epoch: u64) -> SessionResult<SessionInfo> {
        let profile = self.directory.lookup(agent_id).await?;
        let kind = match profile.kind {
            AgentKind::Speech => TransportKind::Streaming,
            AgentKind::Conversational => TransportKind::ManagedRoom,
        };
        let session_id = Uuid::new_v4();
        info!(agent_id, ?kind, %session_id, "starting session");

        let mut resources = SessionResources::empty();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<CaptureFrame>();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel::<SinkEvent>();

        // Capture first: a permission failure should never leave a
        // half-provisioned transport behind.
        match self.start_capture(frames_tx) {
            Ok(handle) => resources.capture = Some(handle),
            Err(e) => return Err(e),
        }

        let mut frame_tx = None;
        let connected = match kind {
            TransportKind::Streaming => {
                StreamingTransport::connect(&self.config.streaming_endpoint, transport_tx)
                    .await
                    .map(|(transport, tx)| {
                        frame_tx = Some(tx);
                        TransportAdapter::Streaming(transport)
                    })
            }
            TransportKind::ManagedRoom => {
                let request = RoomSessionRequest {
                    agent_id: agent_id.to_string(),
                    participant_identity: format!("user-{}", session_id),
                };
                ManagedRoomTransport::connect(Arc::clone(&self.provisioner), request, transport_tx)
                    .await
                    .map(TransportAdapter::ManagedRoom)
            }
        };
        match connected {
            Ok(transport) => resources.transport = Some(transport),
            Err(e) => {
                resources.teardown().await;
                return Err(e);
            }
        }

        // The playback pipeline only exists on the streaming path; a managed
        // room paces its own output.
        if kind == TransportKind::Streaming {
            match self.sink_factory.create(sink_tx) {
                Ok(sink) => {
                    resources.scheduler = Some(PlaybackScheduler::new(
                        self.config.tunables.clone(),
                        sink,
                    ));
                }
                Err(e) => {
                    resources.teardown().await;
                    return Err(e);
                }
            }
        }

        let info = SessionInfo {
            id: session_id,
            kind,
            started_at: Utc::now(),
        };
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel::<()>();
        let (decode_tx, decode_rx) = mpsc::unbounded_channel::<DecodeOutcome>();
        let mut engine = SessionEngine {
            session_id,
            inner: Arc::clone(&self.inner),
            tunables: self.config.tunables.clone(),
            detector: SpeechDetector::new(&self.config.tunables),
            decoder: Arc::new(Pcm16Decoder::new(self.config.capture.sample_rate)),
            resources,
            frame_tx,
            frames_rx,
            transport_rx,
            decode_tx,
            decode_rx,
            sink_rx,
            shutdown: shutdown_rx,
            events: self.events.clone(),
            state: self.state.clone(),
        };

        // Commit point: a stop that arrived while we were connecting bumped
        // the epoch, and this attempt must yield to it.
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            drop(inner);
            debug!("session stopped during start; releasing resources");
            engine.resources.teardown().await;
            return Err(SessionError::InvalidState(
                "session stopped during start".to_string(),
            ));
        }
        let handle = tokio::spawn(engine.run());
        inner.runtime = Some(Runtime {
            info: info.clone(),
            shutdown: shutdown_tx,
            engine: handle,
        });
        inner.starting = false;
        self.state.send_replace(SessionState::Active);
        info!(%info.id, "session active");
        Ok(info)
    }

    fn start_capture(
        &self,
        frames: mpsc::UnboundedSender<CaptureFrame>,
    ) -> SessionResult<CaptureHandle> {
        let mut capture = self
            .capture
            .lock()
            .map_err(|_| SessionError::Setup("capture source poisoned".to_string()))?;
        capture.start(frames)
    }

    /// Stop the running session, releasing every acquired resource. Safe to
    /// call in any state and safe to call twice; a stop during a start in
    /// progress aborts that start.
    pub async fn stop(&self) {
        let runtime = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1;
            let runtime = inner.runtime.take();
            if runtime.is_none() && !inner.starting {
                // Nothing running, but a failed start may have left Error
                // behind; stop always lands on Idle.
                self.state.send_replace(SessionState::Idle);
            }
            runtime
        };
        let Some(runtime) = runtime else {
            // An in-flight start observes the epoch bump and unwinds itself
            // to Idle.
            return;
        };

        info!(%runtime.info.id, "stopping session");
        let _ = runtime.shutdown.send(());
        if let Err(e) = runtime.engine.await {
            warn!("engine task join failed: {}", e);
        }
        let inner = self.inner.lock().await;
        if inner.runtime.is_none() && !inner.starting {
            self.state.send_replace(SessionState::Idle);
        }
    }
}

/// The engine task: sole owner of all mutable session state.
struct SessionEngine {
    session_id: Uuid,
    /// Controller bookkeeping, shared so an engine that ends on its own can
    /// deregister and let a fresh start proceed.
    inner: Arc<Mutex<Inner>>,
    tunables: SessionTunables,
    detector: SpeechDetector,
    decoder: Arc<dyn ChunkDecoder>,
    resources: SessionResources,
    /// Outbound frame sender; `None` on the managed-room path, where the
    /// provider publishes the microphone itself.
    frame_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    frames_rx: mpsc::UnboundedReceiver<CaptureFrame>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    decode_tx: mpsc::UnboundedSender<DecodeOutcome>,
    decode_rx: mpsc::UnboundedReceiver<DecodeOutcome>,
    sink_rx: mpsc::UnboundedReceiver<SinkEvent>,
    shutdown: mpsc::UnboundedReceiver<()>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<SessionState>,
}

impl SessionEngine {
    async fn run(mut self) {
        let mut frames_open = true;
        let mut transport_open = true;
        let mut sink_open = true;
        // When set, suppression clears at this instant unless speech resumes
        // first.
        let mut clear_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    debug!("engine shutdown requested");
                    break;
                }
                frame = self.frames_rx.recv(), if frames_open => match frame {
                    Some(frame) => self.on_frame(frame, &mut clear_at),
                    None => frames_open = false,
                },
                event = self.transport_rx.recv(), if transport_open => match event {
                    Some(TransportEvent::Audio(chunk)) => self.on_audio(chunk),
                    Some(TransportEvent::Interrupt) => {
                        debug!("remote interruption marker");
                        self.interrupt_playback();
                    }
                    Some(TransportEvent::Closed { reason }) => {
                        info!(%reason, "transport closed by remote");
                        let _ = self.events.send(SessionEvent::RemoteClosed { reason });
                        break;
                    }
                    None => transport_open = false,
                },
                outcome = self.decode_rx.recv() => {
                    // Never yields None: the engine keeps a sender clone.
                    if let Some(outcome) = outcome {
                        if let Some(scheduler) = self.resources.scheduler.as_mut() {
                            let next = scheduler.on_decoded(outcome);
                            self.dispatch_decode(next);
                        }
                    }
                }
                event = self.sink_rx.recv(), if sink_open => match event {
                    Some(SinkEvent::BufferEnded) => {
                        if let Some(scheduler) = self.resources.scheduler.as_mut() {
                            let next = scheduler.on_buffer_ended();
                            self.dispatch_decode(next);
                        }
                    }
                    None => sink_open = false,
                },
                _ = tokio::time::sleep_until(clear_at.unwrap_or_else(Instant::now)),
                        if clear_at.is_some() => {
                    clear_at = None;
                    if let Some(scheduler) = self.resources.scheduler.as_mut() {
                        scheduler.clear_suppression();
                    }
                }
            }
        }

        self.resources.teardown().await;
        // Deregister if still the registered runtime (a controller stop has
        // already taken it and publishes Idle itself). Runtime removal and
        // the Idle transition happen under one lock so a concurrent start
        // cannot observe the runtime gone but the state not yet Idle.
        let mut inner = self.inner.lock().await;
        let still_registered = inner
            .runtime
            .as_ref()
            .is_some_and(|r| r.info.id == self.session_id);
        if still_registered {
            inner.runtime = None;
            self.state.send_replace(SessionState::Idle);
        }
        drop(inner);
        debug!("engine task finished");
    }

    fn on_frame(&mut self, frame: CaptureFrame, clear_at: &mut Option<Instant>) {
        if let Some(tx) = &self.frame_tx {
            // Fire-and-forget: a frame raced against disconnect is dropped.
            let _ = tx.send(wire::encode_frame_pcm16(&frame.samples));
        }
        match self.detector.observe_frame(&frame.samples) {
            Some(SpeechEdge::SpeakingStarted) => {
                *clear_at = None;
                let _ = self.events.send(SessionEvent::SpeechStarted);
                self.interrupt_playback();
            }
            Some(SpeechEdge::SpeakingStopped) => {
                let _ = self.events.send(SessionEvent::SpeechStopped);
                let suppressed = self
                    .resources
                    .scheduler
                    .as_ref()
                    .is_some_and(|s| s.is_suppressed());
                if suppressed {
                    *clear_at = Some(Instant::now() + self.tunables.suppression_cooldown);
                }
            }
            None => {}
        }
    }

    fn on_audio(&mut self, chunk: AudioChunk) {
        let Some(scheduler) = self.resources.scheduler.as_mut() else {
            // Managed rooms deliver no audio over this channel; ignore.
            return;
        };
        let job = scheduler.admit(chunk);
        self.dispatch_decode(job);
    }

    /// Hard-stop playback and enter suppression. On the managed-room path
    /// there is nothing to stop; speech edges remain informational.
    fn interrupt_playback(&mut self) {
        if let Some(scheduler) = self.resources.scheduler.as_mut() {
            scheduler.execute_immediate_interruption();
            let _ = self.events.send(SessionEvent::Interrupted);
        }
    }

    /// Run a decode job off the engine thread; the outcome re-enters the
    /// select loop through `decode_rx`.
    fn dispatch_decode(&self, job: Option<DecodeJob>) {
        let Some(job) = job else { return };
        let decoder = Arc::clone(&self.decoder);
        let tx = self.decode_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = decoder.decode(&job.chunk);
            let _ = tx.send(DecodeOutcome {
                generation: job.generation,
                result,
            });
        });
    }
}
