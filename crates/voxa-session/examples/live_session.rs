//! Live session demo — microphone to agent and back.
//!
//! Requires a working input/output device plus the HTTP collaborators:
//! set `VOXA_DIRECTORY_URL`, `VOXA_PROVISIONER_URL` (and optionally
//! `VOXA_API_KEY`) in `.env`, and pass the agent id as the first argument.
//!
//! The streaming endpoint defaults to `wss://localhost:8443/stream`; set
//! `VOXA_STREAM_URL` to override.

use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use voxa_session::{
    CaptureConfig, HttpAgentDirectory, HttpRoomProvisioner, MicCapture, RodioSinkFactory,
    SessionConfig, SessionController, SessionEvent, SessionTunables,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let agent_id = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demo-agent".to_string());
    let streaming_endpoint = std::env::var("VOXA_STREAM_URL")
        .unwrap_or_else(|_| "wss://localhost:8443/stream".to_string());

    let controller = SessionController::new(
        SessionConfig {
            tunables: SessionTunables::default(),
            capture: CaptureConfig::default(),
            streaming_endpoint,
        },
        Arc::new(HttpAgentDirectory::from_env()?),
        Arc::new(HttpRoomProvisioner::from_env()?),
        Box::new(MicCapture::new(CaptureConfig::default())),
        Arc::new(RodioSinkFactory),
    );

    let mut events = controller.subscribe_events();
    let info = controller.start(&agent_id).await?;
    info!("session {} running on {:?} — speak to barge in, Ctrl+C to stop", info.id, info.kind);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::SpeechStarted) => info!("you started speaking"),
                Ok(SessionEvent::SpeechStopped) => info!("you stopped speaking"),
                Ok(SessionEvent::Interrupted) => info!("agent playback interrupted"),
                Ok(SessionEvent::RemoteClosed { reason }) => {
                    info!("remote closed the session: {}", reason);
                    break;
                }
                Err(_) => break,
            },
        }
    }

    controller.stop().await;
    info!("session stopped");
    Ok(())
}
