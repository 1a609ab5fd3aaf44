//! End-to-end session lifecycle tests against a local websocket server.
//!
//! No audio hardware or network involved: capture is scripted, the output
//! sink is a recording stand-in, and both transports talk to loopback
//! sockets.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use voxa_session::{
    AgentDirectory, AgentKind, AgentProfile, CaptureConfig, ManualSinkFactory,
    PlaceholderProvisioner, ScriptedCapture, SessionConfig, SessionController, SessionError,
    SessionEvent, SessionResult, SessionState, SessionTunables, StaticAgentDirectory,
    TransportKind,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Bind a loopback websocket server that runs `behavior` on the first
/// connection. Returns the ws endpoint.
async fn serve_once<F, Fut>(behavior: F) -> String
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                behavior(ws).await;
            }
        }
    });
    format!("ws://{}", addr)
}

/// A JSON audio message carrying `duration_secs` of silent PCM16 at 16kHz.
fn audio_message(duration_secs: f64) -> Message {
    let samples = (duration_secs * 16000.0) as usize;
    let payload = general_purpose::STANDARD.encode(vec![0u8; samples * 2]);
    Message::Text(format!(
        r#"{{"audio": "{}", "audio_format": "pcm16"}}"#,
        payload
    ))
}

fn quiet_capture() -> ScriptedCapture {
    ScriptedCapture::new(vec![vec![0.0f32; 160]], Duration::from_millis(5))
}

struct Harness {
    controller: Arc<SessionController>,
    sinks: Arc<ManualSinkFactory>,
    provisioner: Arc<PlaceholderProvisioner>,
}

fn harness(
    streaming_endpoint: &str,
    room_url: &str,
    directory: Arc<dyn AgentDirectory>,
    capture: ScriptedCapture,
    auto_complete: bool,
) -> Harness {
    let sinks = Arc::new(ManualSinkFactory::new(auto_complete));
    let provisioner = Arc::new(PlaceholderProvisioner::new(room_url));
    let controller = Arc::new(SessionController::new(
        SessionConfig {
            tunables: SessionTunables::default(),
            capture: CaptureConfig::default(),
            streaming_endpoint: streaming_endpoint.to_string(),
        },
        directory,
        Arc::clone(&provisioner) as Arc<_>,
        Box::new(capture),
        Arc::clone(&sinks) as Arc<_>,
    ));
    Harness {
        controller,
        sinks,
        provisioner,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn streaming_session_schedules_inbound_audio_and_forwards_frames() {
    init_logging();

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let endpoint = serve_once(move |ws| async move {
        let (mut write, mut read) = ws.split();
        write.send(audio_message(0.5)).await.unwrap();
        write.send(audio_message(0.5)).await.unwrap();
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Binary(frame) = msg {
                let _ = frames_tx.send(frame);
            }
        }
    })
    .await;

    let directory = Arc::new(StaticAgentDirectory::new().with_agent("a1", AgentKind::Speech));
    let h = harness(&endpoint, "ws://127.0.0.1:1", directory, quiet_capture(), true);

    let info = h.controller.start("a1").await.unwrap();
    assert_eq!(info.kind, TransportKind::Streaming);
    assert_eq!(h.controller.state(), SessionState::Active);

    // Starting again while active is rejected.
    assert!(matches!(
        h.controller.start("a1").await,
        Err(SessionError::InvalidState(_))
    ));

    let probe = h.sinks.last_probe().expect("sink created");
    wait_until(|| probe.scheduled().len() == 2).await;
    for buffer in probe.scheduled() {
        assert!((buffer.duration - 0.5).abs() < 1e-6);
    }

    // Capture frames reached the server as binary PCM16 (1600 samples).
    let frame = timeout(Duration::from_secs(2), frames_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.len(), 160 * 2);

    h.controller.stop().await;
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert!(probe.released());
    // Streaming sessions never touch the provisioner.
    assert!(h.provisioner.created_sessions().is_empty());
}

#[tokio::test]
async fn remote_interrupt_marker_stops_playback_but_not_the_session() {
    init_logging();

    let endpoint = serve_once(|ws| async move {
        let (mut write, mut read) = ws.split();
        write.send(audio_message(0.5)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        write
            .send(Message::Text(r#"{"interrupt": true}"#.to_string()))
            .await
            .unwrap();
        while read.next().await.is_some() {}
    })
    .await;

    let directory = Arc::new(StaticAgentDirectory::new().with_agent("a1", AgentKind::Speech));
    // No auto-complete: the scheduled buffer stays "playing" until stopped.
    let h = harness(&endpoint, "ws://127.0.0.1:1", directory, quiet_capture(), false);
    let mut events = h.controller.subscribe_events();

    h.controller.start("a1").await.unwrap();
    let probe = h.sinks.last_probe().unwrap();
    wait_until(|| probe.scheduled().len() == 1).await;

    let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert_eq!(event, Ok(SessionEvent::Interrupted));
    wait_until(|| probe.hard_stops() == 1).await;

    // The session survives the interruption.
    assert_eq!(h.controller.state(), SessionState::Active);
    h.controller.stop().await;
    assert_eq!(h.controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn remote_close_ends_the_session_cleanly() {
    init_logging();

    let endpoint = serve_once(|mut ws| async move {
        ws.send(audio_message(0.25)).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        ws.send(Message::Close(None)).await.unwrap();
    })
    .await;

    let directory = Arc::new(StaticAgentDirectory::new().with_agent("a1", AgentKind::Speech));
    let h = harness(&endpoint, "ws://127.0.0.1:1", directory, quiet_capture(), true);
    let mut events = h.controller.subscribe_events();
    let mut state = h.controller.watch_state();

    h.controller.start("a1").await.unwrap();

    timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(SessionEvent::RemoteClosed { .. }) = events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("no remote-close event");

    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == SessionState::Idle),
    )
    .await
    .expect("session did not return to idle")
    .unwrap();

    let probe = h.sinks.last_probe().unwrap();
    assert!(probe.released());

    // Stopping after the remote already closed is benign.
    h.controller.stop().await;
    assert_eq!(h.controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn conversational_agent_joins_a_managed_room() {
    init_logging();

    // The provider signalling socket: hold the join open until close.
    let room_url = serve_once(|mut ws| async move { while ws.next().await.is_some() {} }).await;

    let directory =
        Arc::new(StaticAgentDirectory::new().with_agent("helper", AgentKind::Conversational));
    let h = harness("ws://127.0.0.1:1", &room_url, directory, quiet_capture(), true);

    let info = h.controller.start("helper").await.unwrap();
    assert_eq!(info.kind, TransportKind::ManagedRoom);
    assert_eq!(h.provisioner.created_sessions().len(), 1);
    // The playback pipeline never comes up; the provider paces audio.
    assert!(h.sinks.last_probe().is_none());

    h.controller.stop().await;
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(
        h.provisioner.deleted_sessions(),
        h.provisioner.created_sessions()
    );
}

#[tokio::test]
async fn stop_after_failed_start_returns_to_idle() {
    init_logging();

    let directory = Arc::new(StaticAgentDirectory::new());
    let h = harness("ws://127.0.0.1:1", "ws://127.0.0.1:1", directory, quiet_capture(), true);

    assert!(h.controller.start("ghost").await.is_err());
    assert!(matches!(h.controller.state(), SessionState::Error(_)));

    // Stop clears the Error state even though nothing was running.
    h.controller.stop().await;
    assert_eq!(h.controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn session_restarts_after_remote_close() {
    init_logging();

    // First connection is closed by the server immediately; the second one
    // stays open.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Close(None)).await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let directory = Arc::new(StaticAgentDirectory::new().with_agent("a1", AgentKind::Speech));
    let h = harness(&endpoint, "ws://127.0.0.1:1", directory, quiet_capture(), true);
    let mut state = h.controller.watch_state();

    h.controller.start("a1").await.unwrap();
    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == SessionState::Idle),
    )
    .await
    .expect("remote close did not return the controller to idle")
    .unwrap();

    // The controller is fully reusable after the remote hangup.
    let info = h.controller.start("a1").await.unwrap();
    assert_eq!(info.kind, TransportKind::Streaming);
    assert_eq!(h.controller.state(), SessionState::Active);

    h.controller.stop().await;
    assert_eq!(h.controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn unknown_agent_fails_the_start_and_reports_error_state() {
    init_logging();

    let directory = Arc::new(StaticAgentDirectory::new());
    let h = harness("ws://127.0.0.1:1", "ws://127.0.0.1:1", directory, quiet_capture(), true);

    assert!(matches!(
        h.controller.start("ghost").await,
        Err(SessionError::Directory(_))
    ));
    assert!(matches!(h.controller.state(), SessionState::Error(_)));
    // No resources were acquired.
    assert!(h.sinks.last_probe().is_none());
    assert!(h.provisioner.created_sessions().is_empty());
}

/// Directory that answers slowly, so a stop can land mid-start.
struct SlowDirectory(Duration);

#[async_trait]
impl AgentDirectory for SlowDirectory {
    async fn lookup(&self, agent_id: &str) -> SessionResult<AgentProfile> {
        sleep(self.0).await;
        Ok(AgentProfile {
            id: agent_id.to_string(),
            name: None,
            kind: AgentKind::Speech,
        })
    }
}

#[tokio::test]
async fn stop_during_start_unwinds_to_idle() {
    init_logging();

    let endpoint = serve_once(|mut ws| async move { while ws.next().await.is_some() {} }).await;
    let directory = Arc::new(SlowDirectory(Duration::from_millis(200)));
    let h = harness(&endpoint, "ws://127.0.0.1:1", directory, quiet_capture(), true);

    let controller = Arc::clone(&h.controller);
    let starting = tokio::spawn(async move { controller.start("a1").await });

    sleep(Duration::from_millis(50)).await;
    assert_eq!(h.controller.state(), SessionState::Connecting);
    h.controller.stop().await;

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(SessionError::InvalidState(_))));
    assert_eq!(h.controller.state(), SessionState::Idle);

    // Resources acquired before the abort were released.
    if let Some(probe) = h.sinks.last_probe() {
        assert!(probe.released());
    }

    // Double stop stays benign.
    h.controller.stop().await;
    assert_eq!(h.controller.state(), SessionState::Idle);
}
