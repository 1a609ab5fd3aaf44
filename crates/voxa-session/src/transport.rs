//! Live-media transports
//!
//! Two mutually exclusive variants selected once at session start:
//!
//! - **Streaming**: a duplex socket to a fixed endpoint. Capture frames go
//!   out as binary sends; inbound messages are raw binary audio, JSON audio,
//!   or an interrupt marker. An unexpected remote close is an orderly
//!   end-of-session, not a fault.
//! - **Managed room**: a provisioning collaborator issues a session
//!   descriptor (url, token, ids); the client joins the provider's
//!   signalling socket and the provider handles mic publishing and remote
//!   playback pacing itself. Teardown deletes the provisioned session.
//!
//! Expressed as a tagged enum, not trait objects: the variant is picked once
//! and both implement the same small capability set.

use crate::error::{SessionError, SessionResult};
use crate::wire::{self, AudioChunk, ServerMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

/// Which transport variant a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Streaming,
    ManagedRoom,
}

/// Events delivered from the transport into the session loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Inbound agent audio.
    Audio(AudioChunk),
    /// Explicit interruption marker from the server.
    Interrupt,
    /// The transport ended. Always an orderly stop, never an error state.
    Closed { reason: String },
}

/// How one socket message should be handled.
#[derive(Debug, PartialEq)]
pub(crate) enum SocketDispatch {
    Event(TransportEvent),
    Ignore,
    Closed,
}

impl PartialEq for TransportEvent {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TransportEvent::Interrupt, TransportEvent::Interrupt) => true,
            (TransportEvent::Closed { reason: a }, TransportEvent::Closed { reason: b }) => a == b,
            (TransportEvent::Audio(a), TransportEvent::Audio(b)) => {
                a.payload == b.payload && a.format == b.format
            }
            _ => false,
        }
    }
}

/// Map one inbound socket message to a dispatch decision. Pure so the
/// protocol handling is testable without a socket.
pub(crate) fn dispatch_message(msg: Message) -> SocketDispatch {
    match msg {
        Message::Binary(payload) => SocketDispatch::Event(TransportEvent::Audio(AudioChunk {
            payload,
            format: None,
        })),
        Message::Text(text) => match wire::parse_server_text(&text) {
            Ok(Some(ServerMessage::Audio { payload, format })) => {
                SocketDispatch::Event(TransportEvent::Audio(AudioChunk { payload, format }))
            }
            Ok(Some(ServerMessage::Interrupt)) => SocketDispatch::Event(TransportEvent::Interrupt),
            Ok(None) => SocketDispatch::Ignore,
            Err(e) => {
                warn!("unparseable server message ignored: {}", e);
                SocketDispatch::Ignore
            }
        },
        Message::Close(_) => SocketDispatch::Closed,
        // Ping/pong handled by the library; raw frames never surface here.
        _ => SocketDispatch::Ignore,
    }
}

/// Streaming transport: duplex socket carrying binary/JSON audio messages.
pub struct StreamingTransport {
    writer_shutdown: Option<oneshot::Sender<()>>,
    reader: Option<tokio::task::JoinHandle<()>>,
    writer: Option<tokio::task::JoinHandle<()>>,
}

impl StreamingTransport {
    /// Connect to the fixed endpoint. Returns the transport plus the
    /// fire-and-forget frame sender: a frame sent after the socket closes
    /// is silently dropped, never an error.
    pub async fn connect(
        endpoint: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> SessionResult<(Self, mpsc::UnboundedSender<Vec<u8>>)> {
        let (socket, _) = connect_async(endpoint)
            .await
            .map_err(|e| SessionError::Connect(format!("{}: {}", endpoint, e)))?;
        info!(endpoint, "streaming transport connected");

        let (mut write, mut read) = socket.split();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frame_rx.recv() => match frame {
                        Some(frame) => {
                            if write.send(Message::Binary(frame)).await.is_err() {
                                debug!("streaming send failed; socket gone");
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(msg) => match dispatch_message(msg) {
                        SocketDispatch::Event(event) => {
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                        SocketDispatch::Ignore => {}
                        SocketDispatch::Closed => {
                            let _ = events.send(TransportEvent::Closed {
                                reason: "remote close".to_string(),
                            });
                            return;
                        }
                    },
                    Err(e) => {
                        let _ = events.send(TransportEvent::Closed {
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed {
                reason: "stream ended".to_string(),
            });
        });

        Ok((
            Self {
                writer_shutdown: Some(shutdown_tx),
                reader: Some(reader),
                writer: Some(writer),
            },
            frame_tx,
        ))
    }

    pub async fn disconnect(&mut self) {
        if let Some(shutdown) = self.writer_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        debug!("streaming transport disconnected");
    }
}

/// Descriptor issued by the provisioning collaborator for a managed room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomDescriptor {
    pub url: String,
    pub token: String,
    pub session_id: String,
    pub room_name: String,
    pub participant_identity: String,
}

/// Request sent to the provisioning collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSessionRequest {
    pub agent_id: String,
    pub participant_identity: String,
}

/// Session-provisioning collaborator for the managed-room path.
#[async_trait]
pub trait RoomProvisioner: Send + Sync {
    async fn create_session(&self, request: &RoomSessionRequest) -> SessionResult<RoomDescriptor>;
    /// Ends the session server-side. Called during teardown.
    async fn delete_session(&self, session_id: &str) -> SessionResult<()>;
}

/// Production provisioner over HTTP.
pub struct HttpRoomProvisioner {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpRoomProvisioner {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> SessionResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| SessionError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key,
            client,
        })
    }

    /// Build from environment: `VOXA_PROVISIONER_URL`, optional `VOXA_API_KEY`.
    pub fn from_env() -> SessionResult<Self> {
        let _ = dotenvy::dotenv();
        let base_url = std::env::var("VOXA_PROVISIONER_URL")
            .map_err(|_| SessionError::Config("VOXA_PROVISIONER_URL is not set".to_string()))?;
        let api_key = std::env::var("VOXA_API_KEY").ok();
        Self::new(base_url, api_key)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl RoomProvisioner for HttpRoomProvisioner {
    async fn create_session(&self, request: &RoomSessionRequest) -> SessionResult<RoomDescriptor> {
        let url = format!("{}/sessions", self.base_url.trim_end_matches('/'));
        let response = self
            .request(self.client.post(&url).json(request))
            .send()
            .await
            .map_err(|e| SessionError::Provision(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SessionError::Provision(format!(
                "provisioner returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SessionError::Provision(e.to_string()))
    }

    async fn delete_session(&self, session_id: &str) -> SessionResult<()> {
        let url = format!(
            "{}/sessions/{}",
            self.base_url.trim_end_matches('/'),
            session_id
        );
        let response = self
            .request(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| SessionError::Provision(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SessionError::Provision(format!(
                "provisioner returned {} deleting {}",
                response.status(),
                session_id
            )));
        }
        Ok(())
    }
}

/// Canned provisioner for tests and offline wiring: hands out a fixed room
/// url and records every create/delete.
#[derive(Debug)]
pub struct PlaceholderProvisioner {
    room_url: String,
    created: std::sync::Mutex<Vec<String>>,
    deleted: std::sync::Mutex<Vec<String>>,
}

impl PlaceholderProvisioner {
    pub fn new(room_url: impl Into<String>) -> Self {
        Self {
            room_url: room_url.into(),
            created: std::sync::Mutex::new(Vec::new()),
            deleted: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn created_sessions(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted_sessions(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl RoomProvisioner for PlaceholderProvisioner {
    async fn create_session(&self, request: &RoomSessionRequest) -> SessionResult<RoomDescriptor> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.created.lock().unwrap().push(session_id.clone());
        Ok(RoomDescriptor {
            url: self.room_url.clone(),
            token: "placeholder-token".to_string(),
            session_id,
            room_name: format!("room-{}", request.agent_id),
            participant_identity: request.participant_identity.clone(),
        })
    }

    async fn delete_session(&self, session_id: &str) -> SessionResult<()> {
        self.deleted.lock().unwrap().push(session_id.to_string());
        Ok(())
    }
}

/// Join URL for the provider signalling socket.
fn join_url(descriptor: &RoomDescriptor) -> String {
    format!(
        "{}/rtc?access_token={}",
        descriptor.url.trim_end_matches('/'),
        descriptor.token
    )
}

/// Managed-room transport: the provider owns mic publishing and playback
/// pacing; this side only holds the join alive and tears the session down.
pub struct ManagedRoomTransport {
    descriptor: RoomDescriptor,
    provisioner: Arc<dyn RoomProvisioner>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl ManagedRoomTransport {
    pub async fn connect(
        provisioner: Arc<dyn RoomProvisioner>,
        request: RoomSessionRequest,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> SessionResult<Self> {
        let descriptor = provisioner.create_session(&request).await?;
        info!(
            room = %descriptor.room_name,
            session_id = %descriptor.session_id,
            "managed room provisioned"
        );

        let url = join_url(&descriptor);
        let connected = connect_async(&url).await;
        let (socket, _) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                // Join failed after provisioning: best-effort server-side delete.
                if let Err(del) = provisioner.delete_session(&descriptor.session_id).await {
                    warn!("failed to delete unjoined room session: {}", del);
                }
                return Err(SessionError::Connect(format!("room join: {}", e)));
            }
        };
        info!(room = %descriptor.room_name, "managed room joined");

        let (_write, mut read) = socket.split();
        let reader = tokio::spawn(async move {
            // The provider delivers media itself; we only watch for the end
            // of the signalling stream.
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = events.send(TransportEvent::Closed {
                reason: "room closed".to_string(),
            });
        });

        Ok(Self {
            descriptor,
            provisioner,
            reader: Some(reader),
        })
    }

    pub fn descriptor(&self) -> &RoomDescriptor {
        &self.descriptor
    }

    pub async fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Err(e) = self
            .provisioner
            .delete_session(&self.descriptor.session_id)
            .await
        {
            warn!(
                session_id = %self.descriptor.session_id,
                "room session delete failed: {}", e
            );
        }
        debug!(room = %self.descriptor.room_name, "managed room left");
    }
}

/// The transport a live session runs on.
pub enum TransportAdapter {
    Streaming(StreamingTransport),
    ManagedRoom(ManagedRoomTransport),
}

impl TransportAdapter {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportAdapter::Streaming(_) => TransportKind::Streaming,
            TransportAdapter::ManagedRoom(_) => TransportKind::ManagedRoom,
        }
    }

    pub async fn disconnect(&mut self) {
        match self {
            TransportAdapter::Streaming(t) => t.disconnect().await,
            TransportAdapter::ManagedRoom(t) => t.disconnect().await,
        }
    }
}
