//! Call state machine implementation.
//!
//! The table here is pure: it only decides whether a transition is legal and
//! what the next state is. Side effects (driving the engine, sending
//! envelopes) belong to the controller that owns the session.

use std::fmt;

use serde::Serialize;

/// Current state of the one call a pair may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum CallState {
    /// No session. Initial state and terminal state of every call.
    #[default]
    Idle,
    /// Outgoing call: local offer generated or being generated.
    Offering,
    /// Incoming call accepted: answer being generated.
    Answering,
    /// Descriptions exchanged, waiting for connectivity.
    Connecting,
    /// Media path established.
    Active,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether a negotiation handle must exist in this state.
    pub fn holds_session(&self) -> bool {
        !self.is_idle()
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// States that accept remote candidates. Late trickle candidates are
    /// still registered once the call is up.
    pub fn accepts_candidates(&self) -> bool {
        matches!(
            self,
            Self::Offering | Self::Answering | Self::Connecting | Self::Active
        )
    }

    pub fn label(&self) -> CallLabel {
        match self {
            Self::Idle => CallLabel::Call,
            Self::Offering => CallLabel::Calling,
            Self::Answering | Self::Connecting => CallLabel::Connecting,
            Self::Active => CallLabel::HangUp,
        }
    }

    /// Apply a transition, returning the next state.
    pub fn apply(self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        let next = match (self, transition) {
            (Self::Idle, CallTransition::OfferCreated) => Self::Offering,
            (Self::Idle, CallTransition::OfferAccepted) => Self::Answering,
            (Self::Offering, CallTransition::AnswerReceived) => Self::Connecting,
            (Self::Answering, CallTransition::AnswerSent) => Self::Connecting,
            (Self::Connecting, CallTransition::ConnectivityEstablished) => Self::Active,
            (
                Self::Offering | Self::Answering | Self::Connecting | Self::Active,
                CallTransition::Released,
            ) => Self::Idle,
            (current, attempted) => {
                return Err(InvalidTransition { current, attempted });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Offering => "Offering",
            Self::Answering => "Answering",
            Self::Connecting => "Connecting",
            Self::Active => "Active",
        };
        f.write_str(name)
    }
}

/// State transitions for calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTransition {
    /// Local start-call intent created a session.
    OfferCreated,
    /// An incoming offer was accepted and a session created for it.
    OfferAccepted,
    /// The remote answer arrived while offering.
    AnswerReceived,
    /// Our answer went out.
    AnswerSent,
    /// The engine reported connectivity.
    ConnectivityEstablished,
    /// Any teardown path.
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current: CallState,
    pub attempted: CallTransition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {}",
            self.attempted, self.current
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Label shown on the call affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallLabel {
    Call,
    Calling,
    Connecting,
    HangUp,
}

impl CallLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "Call",
            Self::Calling => "Calling…",
            Self::Connecting => "Connecting…",
            Self::HangUp => "Hang Up",
        }
    }
}

impl fmt::Display for CallLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the presentation layer renders for the call affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallView {
    pub state: CallState,
    pub label: CallLabel,
    /// The affordance is disabled only when idle with nobody to call; an
    /// in-progress call can always be hung up.
    pub enabled: bool,
}

impl CallView {
    pub fn new(state: CallState, peer_present: bool) -> Self {
        Self {
            state,
            label: state.label(),
            enabled: peer_present || !state.is_idle(),
        }
    }
}

impl Default for CallView {
    fn default() -> Self {
        Self::new(CallState::Idle, false)
    }
}
