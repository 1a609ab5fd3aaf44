//! # voxa-session
//!
//! Real-time duplex voice session engine: microphone capture, speech
//! activity detection with barge-in interruption, and gapless scheduled
//! playback of agent audio over one of two transports.
//!
//! ```text
//! ┌─────────────┐   frames    ┌──────────────────────────────┐
//! │ MicCapture  │────────────▶│        SessionEngine         │
//! └─────────────┘             │  (single-writer select loop) │
//!                             │                              │
//! ┌─────────────┐   events    │  SpeechDetector ──▶ barge-in │
//! │  Transport  │────────────▶│  PlaybackScheduler           │
//! │ (streaming/ │◀────────────│    jitter queue + clock      │
//! │  room)      │   frames    └───────────┬──────────────────┘
//! └─────────────┘                         │ schedule @ t
//!                                         ▼
//!                                  ┌────────────┐
//!                                  │ OutputSink │
//!                                  └────────────┘
//! ```
//!
//! The transport is chosen per agent: SPEECH-typed agents use a duplex
//! streaming socket with client-side playback scheduling; every other agent
//! joins a provider-managed room where the provider paces audio itself.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voxa_session::{
//!     CaptureConfig, HttpAgentDirectory, HttpRoomProvisioner, MicCapture,
//!     RodioSinkFactory, SessionConfig, SessionController, SessionTunables,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig {
//!     tunables: SessionTunables::default(),
//!     capture: CaptureConfig::default(),
//!     streaming_endpoint: "wss://voice.example.com/stream".to_string(),
//! };
//! let controller = SessionController::new(
//!     config,
//!     Arc::new(HttpAgentDirectory::from_env()?),
//!     Arc::new(HttpRoomProvisioner::from_env()?),
//!     Box::new(MicCapture::new(CaptureConfig::default())),
//!     Arc::new(RodioSinkFactory),
//! );
//!
//! let info = controller.start("agent-123").await?;
//! println!("session {} running on {:?}", info.id, info.kind);
//! // ... later
//! controller.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod cleanup;
pub mod config;
pub mod directory;
pub mod error;
pub mod playback;
pub mod session;
pub mod sink;
pub mod speech;
pub mod transport;
pub mod wire;

pub use capture::{CaptureConfig, CaptureFrame, CaptureHandle, CaptureSource, MicCapture, ScriptedCapture};
pub use cleanup::SessionResources;
pub use config::SessionTunables;
pub use directory::{AgentDirectory, AgentKind, AgentProfile, HttpAgentDirectory, StaticAgentDirectory};
pub use error::{SessionError, SessionResult};
pub use playback::{ChunkDecoder, InterruptState, Pcm16Decoder, PlaybackScheduler};
pub use session::{SessionConfig, SessionController, SessionEvent, SessionInfo, SessionState};
pub use sink::{
    ManualSink, ManualSinkFactory, ManualSinkProbe, OutputSink, OutputSinkFactory, PcmBuffer,
    RodioSink, RodioSinkFactory, SinkEvent,
};
pub use speech::{SpeechDetector, SpeechEdge, SpeechState};
pub use transport::{
    HttpRoomProvisioner, ManagedRoomTransport, PlaceholderProvisioner, RoomDescriptor,
    RoomProvisioner, RoomSessionRequest, StreamingTransport, TransportAdapter, TransportEvent,
    TransportKind,
};
pub use wire::{AudioChunk, ServerMessage};
