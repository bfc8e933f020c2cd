//! Envelope-level view of the signaling transport.

use callcore::{CallEvent, SignalingEnvelope, UserId};
use log::{debug, warn};
use std::sync::Arc;

use super::error::CallError;
use crate::transport::Transport;

/// Encodes outbound envelopes onto the transport as JSON text frames.
#[derive(Clone)]
pub struct SignalingChannel {
    transport: Arc<dyn Transport>,
    local_id: UserId,
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn Transport>, local_id: UserId) -> Self {
        Self {
            transport,
            local_id,
        }
    }

    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    pub async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), CallError> {
        let frame = envelope.encode()?;
        debug!("-> {envelope}");
        self.transport
            .send_frame(frame.as_bytes())
            .await
            .map_err(|e| CallError::Transport(e.to_string()))
    }

    pub async fn send_call(&self, event: CallEvent) -> Result<(), CallError> {
        self.send(&SignalingEnvelope::call(self.local_id.clone(), event))
            .await
    }

    pub async fn send_chat(&self, content: impl Into<String>) -> Result<(), CallError> {
        self.send(&SignalingEnvelope::message(self.local_id.clone(), content))
            .await
    }

    /// Sends a call event, logging instead of failing. Signaling is
    /// fire-and-forget from the state machine's point of view.
    pub async fn emit(&self, event: CallEvent) {
        let name = event.name();
        if let Err(e) = self.send_call(event).await {
            warn!("Failed to send call/{name}: {e}");
        }
    }

    pub fn decode(frame: &[u8]) -> Result<SignalingEnvelope, CallError> {
        Ok(SignalingEnvelope::decode(frame)?)
    }

    pub async fn close(&self) {
        self.transport.disconnect().await;
    }
}
