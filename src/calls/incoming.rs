//! Deciding whether to pick up an incoming call.

use async_trait::async_trait;
use callcore::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Decline,
}

/// Asked once per incoming offer. Taking longer than the ring timeout counts
/// as [`Decision::Decline`].
#[async_trait]
pub trait IncomingCallDecider: Send + Sync {
    async fn decide(&self, from: &UserId) -> Decision;
}

/// Answers every call the same way, immediately.
#[derive(Debug, Clone, Copy)]
pub struct AutoDecision(pub Decision);

impl AutoDecision {
    pub fn accept() -> Self {
        Self(Decision::Accept)
    }

    pub fn decline() -> Self {
        Self(Decision::Decline)
    }
}

impl Default for AutoDecision {
    fn default() -> Self {
        Self::accept()
    }
}

#[async_trait]
impl IncomingCallDecider for AutoDecision {
    async fn decide(&self, _from: &UserId) -> Decision {
        self.0
    }
}
