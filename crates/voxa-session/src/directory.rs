//! Agent directory collaborator
//!
//! The controller asks the directory for an agent's type before connecting:
//! SPEECH-typed agents use the streaming transport, everything else joins a
//! managed room.

use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// Agent type discriminator. Only the SPEECH type selects the streaming
/// transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Speech,
    Conversational,
}

impl AgentKind {
    /// Map a wire discriminator to a kind. Unrecognized types fall through
    /// to the managed-room path.
    pub fn from_discriminator(value: &str) -> Self {
        if value.eq_ignore_ascii_case("speech") {
            AgentKind::Speech
        } else {
            AgentKind::Conversational
        }
    }
}

/// Agent metadata returned by the directory.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub id: String,
    pub name: Option<String>,
    pub kind: AgentKind,
}

/// Directory lookup seam.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn lookup(&self, agent_id: &str) -> SessionResult<AgentProfile>;
}

#[derive(Debug, Deserialize)]
struct AgentRecord {
    id: String,
    name: Option<String>,
    agent_type: String,
}

/// Production directory client over HTTP.
pub struct HttpAgentDirectory {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpAgentDirectory {
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

    /// Build from environment: `VOXA_DIRECTORY_URL`, optional `VOXA_API_KEY`.
    pub fn from_env() -> SessionResult<Self> {
        let _ = dotenvy::dotenv();
        let base_url = std::env::var("VOXA_DIRECTORY_URL")
            .map_err(|_| SessionError::Config("VOXA_DIRECTORY_URL is not set".to_string()))?;
        let api_key = std::env::var("VOXA_API_KEY").ok();
        Self::new(base_url, api_key)
    }
}

#[async_trait]
impl AgentDirectory for HttpAgentDirectory {
    async fn lookup(&self, agent_id: &str) -> SessionResult<AgentProfile> {
        let url = format!("{}/agents/{}", self.base_url.trim_end_matches('/'), agent_id);
        let mut request = self.client.get(&url);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SessionError::Directory(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SessionError::Directory(format!(
                "directory returned {} for agent {}",
                response.status(),
                agent_id
            )));
        }
        let record: AgentRecord = response
            .json()
            .await
            .map_err(|e| SessionError::Directory(e.to_string()))?;
        debug!(agent_id, agent_type = %record.agent_type, "agent looked up");
        Ok(AgentProfile {
            kind: AgentKind::from_discriminator(&record.agent_type),
            id: record.id,
            name: record.name,
        })
    }
}

/// In-memory directory for tests and offline wiring.
#[derive(Debug, Default)]
pub struct StaticAgentDirectory {
    agents: HashMap<String, AgentKind>,
}

impl StaticAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, id: impl Into<String>, kind: AgentKind) -> Self {
        self.agents.insert(id.into(), kind);
        self
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn lookup(&self, agent_id: &str) -> SessionResult<AgentProfile> {
        let kind = self
            .agents
            .get(agent_id)
            .copied()
            .ok_or_else(|| SessionError::Directory(format!("unknown agent: {}", agent_id)))?;
        Ok(AgentProfile {
            id: agent_id.to_string(),
            name: None,
            kind,
        })
    }
}
