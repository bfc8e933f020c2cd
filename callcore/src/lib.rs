//! Runtime-agnostic core of the peer call stack.
//!
//! Holds everything that does not need an async runtime: the signaling
//! envelope protocol and its JSON wire form, the call state table, the
//! affordance labels derived from it, and the glare tie-break.

pub mod glare;
pub mod protocol;
pub mod state;
pub mod types;

pub use glare::{GlareOutcome, resolve_glare};
pub use protocol::{CallEvent, EnvelopeKind, ProtocolError, SignalingEnvelope};
pub use state::{CallLabel, CallState, CallTransition, CallView, InvalidTransition};
pub use types::call::{Generation, IceCandidate, SdpType, SessionDescription, UserId};
