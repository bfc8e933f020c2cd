//! Call-related error types.

use thiserror::Error;

use super::engine::EngineError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A `call/*` envelope that is not valid for the current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("connectivity failed: {0}")]
    Connectivity(String),

    /// Local start-call intent while a call is already running.
    #[error("call already running")]
    AlreadyInCall,

    #[error("peer is not present")]
    PeerAbsent,

    #[error("peer went away")]
    PresenceLost,

    #[error("call rejected by peer")]
    Rejected,

    #[error("call cancelled locally")]
    Cancelled,

    #[error("timed out waiting for connectivity")]
    Timeout,

    #[error("audio capture unavailable: {0}")]
    Audio(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("call controller is not running")]
    ControllerClosed,
}

impl From<EngineError> for CallError {
    fn from(e: EngineError) -> Self {
        Self::Negotiation(e.to_string())
    }
}

impl From<callcore::ProtocolError> for CallError {
    fn from(e: callcore::ProtocolError) -> Self {
        Self::Codec(e.to_string())
    }
}
