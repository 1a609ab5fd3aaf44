//! Error types for the voice session engine

use thiserror::Error;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while running a live voice session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Capture permission/device unavailable. Fatal to the start attempt.
    #[error("Capture setup error: {0}")]
    Setup(String),

    /// Transport handshake failure. Fatal to the start attempt.
    #[error("Transport connect error: {0}")]
    Connect(String),

    /// A single inbound chunk failed to decode. Recovered locally.
    #[error("Chunk decode error: {0}")]
    Decode(String),

    /// Session-provisioning collaborator failure (managed room path).
    #[error("Room provisioning error: {0}")]
    Provision(String),

    /// Agent directory collaborator failure.
    #[error("Agent directory error: {0}")]
    Directory(String),

    /// Operation is not valid in the current session state.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<cpal::DevicesError> for SessionError {
    fn from(err: cpal::DevicesError) -> Self {
        SessionError::Setup(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for SessionError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        SessionError::Setup(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for SessionError {
    fn from(err: cpal::BuildStreamError) -> Self {
        SessionError::Setup(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for SessionError {
    fn from(err: cpal::PlayStreamError) -> Self {
        SessionError::Setup(err.to_string())
    }
}
