//! One-to-one voice calls between two paired participants.
//!
//! Negotiation travels over the signaling transport as `call` envelopes;
//! audio flows peer to peer once the negotiation engine connects.
//!
//! # Architecture
//!
//! - [`CallController`]: actor owning the single call session, driven through
//!   a cloneable [`CallControllerHandle`]
//! - [`NegotiationEngine`] / [`EngineFactory`]: the media engine seam, with a
//!   [`LoopbackEngineFactory`] for tests and demos
//! - [`PresenceTracker`]: whether the peer is there to call
//! - [`AudioSource`]: the microphone, opened once and shared across calls
//! - [`IncomingCallDecider`]: picks up or declines incoming calls
//!
//! # Teardown
//!
//! Every way a call can end goes through one teardown path that closes the
//! engine, optionally sends `call/reject`, resolves whoever is waiting for
//! the call to connect, and returns the controller to idle.

mod audio;
mod controller;
mod engine;
mod error;
mod handler;
mod incoming;
mod loopback;
mod presence;
mod session;
mod signaling;
#[cfg(feature = "webrtc-engine")]
mod webrtc;

pub use audio::{AudioCapture, AudioSource, SilentAudioSource};
pub use controller::{CallAttempt, CallController, CallControllerBuilder, CallControllerHandle};
pub use engine::{Connectivity, EngineError, EngineEvent, EngineFactory, NegotiationEngine};
pub use error::CallError;
pub use incoming::{AutoDecision, Decision, IncomingCallDecider};
pub use loopback::{FailPoint, LoopbackEngine, LoopbackEngineFactory, LoopbackMode};
pub use presence::{PresenceEdge, PresenceTracker};
pub use session::TeardownCause;
pub use signaling::SignalingChannel;
#[cfg(feature = "webrtc-engine")]
pub use webrtc::{WebRtcEngine, WebRtcEngineFactory};
