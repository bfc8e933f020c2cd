//! The narrow interface the controller drives the negotiation engine through.
//!
//! The engine does the real media work (description generation, candidate
//! gathering, connectivity checks). The controller only decides when an
//! engine exists and what is asked of it. Engines must buffer candidates
//! registered before the remote description is applied.

use async_trait::async_trait;
use callcore::{IceCandidate, SessionDescription};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use super::audio::AudioCapture;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("description rejected: {0}")]
    Description(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("engine is closed")]
    Closed,

    #[error("engine failure: {0}")]
    Other(String),
}

/// Connectivity as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connectivity {
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl Connectivity {
    /// `failed` and `closed` both abort the call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something the engine noticed on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Connectivity(Connectivity),
    /// A local candidate to trickle to the peer.
    LocalCandidate(IceCandidate),
}

/// One negotiation handle. Lives for exactly one session.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    /// Generates an answer for `remote_offer`, which has already been applied
    /// with [`set_remote_description`](Self::set_remote_description).
    async fn create_answer(
        &self,
        remote_offer: &SessionDescription,
    ) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Tears the engine down. Called exactly once per handle.
    async fn close(&self);
}

/// Creates one engine per session.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Creates an engine that sends `audio`, along with its event stream.
    async fn create_engine(
        &self,
        audio: Arc<dyn AudioCapture>,
    ) -> Result<(Arc<dyn NegotiationEngine>, mpsc::Receiver<EngineEvent>), EngineError>;
}
