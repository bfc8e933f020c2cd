use crate::calls::TeardownCause;
use callcore::{CallLabel, CallState, Generation, GlareOutcome, UserId};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event type.
        ///
        /// The presentation layer subscribes here; nothing in the controller
        /// waits on a subscriber.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Call lifecycle
    (call_state, Arc<CallStateChanged>),
    (call_log, Arc<CallLogEntry>),
    (incoming_call, Arc<IncomingCall>),

    // Peer events
    (presence, Arc<PresenceChanged>),
    (chat, Arc<ChatMessage>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct CallStateChanged {
    pub generation: Option<Generation>,
    pub from: CallState,
    pub to: CallState,
    pub label: CallLabel,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub from: UserId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PresenceChanged {
    pub present: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub from: UserId,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// One line of the human-readable call log.
#[derive(Debug, Clone)]
pub struct CallLogEntry {
    pub generation: Option<Generation>,
    pub kind: CallLogKind,
    pub at: DateTime<Utc>,
}

impl CallLogEntry {
    pub fn new(generation: Option<Generation>, kind: CallLogKind) -> Self {
        Self {
            generation,
            kind,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallLogKind {
    OfferSent,
    AnswerSent,
    IncomingOffer { from: UserId },
    Declined { from: UserId },
    RingingCancelled { from: UserId },
    Connected,
    Ended { cause: TeardownCause },
    Glare { outcome: GlareOutcome },
    /// A local intent refused without touching the session.
    GuardViolation { reason: String },
    /// A `call/*` envelope that makes no sense in the current state.
    ProtocolViolation { detail: String },
}

impl fmt::Display for CallLogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OfferSent => f.write_str("calling"),
            Self::AnswerSent => f.write_str("answered"),
            Self::IncomingOffer { from } => write!(f, "incoming call from {from}"),
            Self::Declined { from } => write!(f, "declined call from {from}"),
            Self::RingingCancelled { from } => write!(f, "{from} gave up before answer"),
            Self::Connected => f.write_str("call connected"),
            Self::Ended { cause } => write!(f, "call ended: {cause}"),
            Self::Glare { outcome } => write!(f, "simultaneous call attempts: {outcome:?}"),
            Self::GuardViolation { reason } => write!(f, "refused: {reason}"),
            Self::ProtocolViolation { detail } => write!(f, "ignored: {detail}"),
        }
    }
}
