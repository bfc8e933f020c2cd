//! Signaling envelopes exchanged over the relay.
//!
//! One envelope travels per transport frame as a JSON object tagged by
//! `"type"`:
//!
//! ```text
//! { "type": "call", "user_id": <string>, "event": <CallEvent> }
//! CallEvent ::= {"type":"offer","offer":<description>}
//!             | {"type":"answer","answer":<description>}
//!             | {"type":"candidate","candidate":<candidateData>}
//!             | {"type":"reject"}
//! {"type":"connected"} | {"type":"disconnected"}
//! {"type":"message","user_id":..,"content":<string>}
//! ```
//!
//! `connected` and `disconnected` are presence notices injected by the relay;
//! `message` and `call` are produced by the participants.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::call::{IceCandidate, SessionDescription, UserId};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
}

/// A call-control event nested inside a `call` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CallEvent {
    Offer { offer: SessionDescription },
    Answer { answer: SessionDescription },
    Candidate { candidate: IceCandidate },
    Reject,
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The discriminant of a [`SignalingEnvelope`], for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Connected,
    Disconnected,
    Message,
    Call,
}

/// Everything that travels over the signaling transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingEnvelope {
    /// Relay notice: the paired participant is reachable.
    Connected,
    /// Relay notice: the paired participant went away.
    Disconnected,
    /// Free-form chat line.
    Message { user_id: UserId, content: String },
    /// Call-control event.
    Call { user_id: UserId, event: CallEvent },
}

impl SignalingEnvelope {
    pub fn call(user_id: UserId, event: CallEvent) -> Self {
        Self::Call { user_id, event }
    }

    pub fn message(user_id: UserId, content: impl Into<String>) -> Self {
        Self::Message {
            user_id,
            content: content.into(),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Connected => EnvelopeKind::Connected,
            Self::Disconnected => EnvelopeKind::Disconnected,
            Self::Message { .. } => EnvelopeKind::Message,
            Self::Call { .. } => EnvelopeKind::Call,
        }
    }

    /// The sender identity, when the envelope carries one.
    pub fn sender(&self) -> Option<&UserId> {
        match self {
            Self::Message { user_id, .. } | Self::Call { user_id, .. } => Some(user_id),
            Self::Connected | Self::Disconnected => None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(frame)?;
        Ok(serde_json::from_str(text)?)
    }
}

impl fmt::Display for SignalingEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Message { user_id, .. } => write!(f, "message from {user_id}"),
            Self::Call { user_id, event } => write!(f, "call/{event} from {user_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn to_value(envelope: &SignalingEnvelope) -> Value {
        serde_json::from_str(&envelope.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_offer_wire_shape() {
        let envelope = SignalingEnvelope::call(
            UserId::from("alice"),
            CallEvent::Offer {
                offer: SessionDescription::offer("v=0\r\n"),
            },
        );

        assert_eq!(
            to_value(&envelope),
            json!({
                "type": "call",
                "user_id": "alice",
                "event": {"type": "offer", "offer": {"type": "offer", "sdp": "v=0\r\n"}}
            })
        );
    }

    #[test]
    fn test_reject_and_presence_wire_shape() {
        let reject = SignalingEnvelope::call(UserId::from("bob"), CallEvent::Reject);
        assert_eq!(
            to_value(&reject),
            json!({"type": "call", "user_id": "bob", "event": {"type": "reject"}})
        );
        assert_eq!(
            to_value(&SignalingEnvelope::Connected),
            json!({"type": "connected"})
        );
        assert_eq!(
            to_value(&SignalingEnvelope::Disconnected),
            json!({"type": "disconnected"})
        );
    }

    #[test]
    fn test_decode_browser_candidate() {
        let frame = br#"{"type":"call","user_id":1234,"event":{"type":"candidate","candidate":{"candidate":"candidate:842163049 1 udp 1677729535 1.2.3.4 5000 typ srflx","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"Zx1q"}}}"#;
        let envelope = SignalingEnvelope::decode(frame).unwrap();

        let SignalingEnvelope::Call { user_id, event } = envelope else {
            panic!("expected call envelope");
        };
        assert_eq!(user_id.as_str(), "1234");
        let CallEvent::Candidate { candidate } = event else {
            panic!("expected candidate");
        };
        assert!(candidate.candidate.contains("typ srflx"));
        assert_eq!(candidate.username_fragment.as_deref(), Some("Zx1q"));
    }

    #[test]
    fn test_decode_chat_message() {
        let envelope =
            SignalingEnvelope::decode(br#"{"type":"message","user_id":"7","content":"hi"}"#)
                .unwrap();
        assert_eq!(envelope.kind(), EnvelopeKind::Message);
        assert_eq!(envelope.sender(), Some(&UserId::from("7")));
        assert_eq!(envelope.to_string(), "message from 7");
    }

    #[test]
    fn test_decode_rejects_unknown_and_garbage() {
        assert!(SignalingEnvelope::decode(br#"{"type":"correct","tries":3}"#).is_err());
        assert!(SignalingEnvelope::decode(br#"{"type":"call","user_id":"a"}"#).is_err());
        assert!(matches!(
            SignalingEnvelope::decode(&[0xff, 0xfe]),
            Err(ProtocolError::Utf8(_))
        ));
    }

    #[test]
    fn test_presence_envelopes_have_no_sender() {
        assert_eq!(SignalingEnvelope::Connected.sender(), None);
        assert_eq!(SignalingEnvelope::Disconnected.kind(), EnvelopeKind::Disconnected);
    }
}
