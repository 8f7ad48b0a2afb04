use thiserror::Error;

use crate::events::Direction;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("capability unsupported: {0}")]
    CapabilityUnsupported(String),
    #[error("permission denied (camera allowed: {camera}, microphone allowed: {microphone})")]
    PermissionDenied { camera: bool, microphone: bool },
    #[error("login failed: {0}")]
    LoginFailed(String),
    #[error("{direction} media creation failed: {reason}")]
    MediaCreationFailed { direction: Direction, reason: String },
    #[error("no {0} sink attached")]
    SinkUnavailable(Direction),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("{0} attempt superseded by teardown")]
    AttemptSuperseded(Direction),
    #[error("not connected")]
    NotConnected,
    #[error("peer is not online")]
    PeerOffline,
    #[error("unknown device: {0}")]
    UnknownDevice(String),
}

/// Failure reported by the external engine for a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation}: {message}")]
pub struct EngineError {
    pub operation: &'static str,
    pub message: String,
}

impl EngineError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
