//! Inbound signaling: what the controller does with each envelope.

use callcore::{
    CallEvent, CallState, CallTransition, GlareOutcome, IceCandidate, SessionDescription,
    SignalingEnvelope, UserId, resolve_glare,
};
use chrono::Utc;
use log::{debug, info, trace, warn};
use std::sync::Arc;

use super::controller::CallController;
use super::presence::PresenceEdge;
use super::session::{EngineOp, TeardownCause};
use super::signaling::SignalingChannel;
use crate::transport::TransportEvent;
use crate::types::events::{CallLogKind, ChatMessage, PresenceChanged};

impl CallController {
    pub(super) async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => debug!("Signaling transport connected"),
            TransportEvent::FrameReceived(frame) => match SignalingChannel::decode(&frame) {
                Ok(envelope) => self.handle_envelope(envelope).await,
                Err(e) => warn!("Dropping undecodable frame ({} bytes): {e}", frame.len()),
            },
            TransportEvent::Disconnected => {
                warn!("Signaling transport disconnected");
                self.on_presence(false).await;
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        debug!("<- {envelope}");
        match envelope {
            SignalingEnvelope::Connected => self.on_presence(true).await,
            SignalingEnvelope::Disconnected => self.on_presence(false).await,
            SignalingEnvelope::Message { user_id, content } => {
                let _ = self.bus.chat.send(Arc::new(ChatMessage {
                    from: user_id,
                    content,
                    at: Utc::now(),
                }));
            }
            SignalingEnvelope::Call { user_id, event } => match event {
                CallEvent::Offer { offer } => self.on_remote_offer(user_id, offer).await,
                CallEvent::Answer { answer } => self.on_remote_answer(user_id, answer),
                CallEvent::Candidate { candidate } => {
                    self.on_remote_candidate(user_id, candidate)
                }
                CallEvent::Reject => self.on_remote_reject(user_id).await,
            },
        }
    }

    pub(super) async fn on_presence(&mut self, present: bool) {
        let Some(edge) = self.presence.observe(present) else {
            return;
        };
        let _ = self.bus.presence.send(Arc::new(PresenceChanged {
            present,
            at: Utc::now(),
        }));
        match edge {
            PresenceEdge::BecamePresent => info!("Peer is present"),
            PresenceEdge::BecameAbsent => {
                info!("Peer is gone");
                self.stop_ringing();
                self.teardown(TeardownCause::PresenceLost).await;
            }
        }
    }

    async fn on_remote_offer(&mut self, from: UserId, offer: SessionDescription) {
        match self.state() {
            CallState::Idle => self.ring(from, offer),
            CallState::Offering => {
                let outcome = resolve_glare(&self.config.local_id, &from);
                self.log(
                    self.session.as_ref().map(|session| session.generation),
                    CallLogKind::Glare { outcome },
                );
                match outcome {
                    GlareOutcome::KeepLocal => {
                        info!("Simultaneous call with {from}; keeping ours");
                        if let Some(session) = self.session.as_mut() {
                            session.glare_won = true;
                        }
                    }
                    GlareOutcome::YieldToRemote => {
                        info!("Simultaneous call with {from}; taking theirs");
                        let waiter = self.teardown(TeardownCause::GlareYield).await;
                        self.accept_offer(from, offer, Vec::new(), waiter);
                    }
                }
            }
            state => self.violation(format!("offer from {from} while {state}")),
        }
    }

    fn on_remote_answer(&mut self, from: UserId, answer: SessionDescription) {
        let state = self.state();
        if state != CallState::Offering {
            self.violation(format!("answer from {from} while {state}"));
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.peer.get_or_insert(from);
        session.submit(EngineOp::ApplyAnswer { answer });
        if let Err(e) = session.advance(CallTransition::AnswerReceived) {
            warn!("{e}");
            return;
        }
        if session.connected_early {
            self.establish();
        }
    }

    fn on_remote_candidate(&mut self, from: UserId, candidate: IceCandidate) {
        match self.session.as_ref() {
            Some(session) if session.glare_won && session.state == CallState::Offering => {
                debug!("Dropping candidate from {from} for its abandoned offer");
            }
            Some(session) if session.state.accepts_candidates() => {
                trace!("Candidate from {from} for {}", session.generation);
                session.submit(EngineOp::AddCandidate { candidate });
            }
            Some(_) => self.violation(format!("candidate from {from} with no call")),
            None => {
                if !self.hold_ringing_candidate(candidate) {
                    self.violation(format!("candidate from {from} with no call"));
                }
            }
        }
    }

    async fn on_remote_reject(&mut self, from: UserId) {
        if self.session.is_some() {
            info!("{from} rejected the call");
            self.teardown(TeardownCause::RemoteReject).await;
        } else if !self.stop_ringing() {
            debug!("Reject from {from} with no call; ignoring");
        }
    }

    fn violation(&self, detail: String) {
        debug!("Ignoring {detail}");
        self.log(
            self.session.as_ref().map(|session| session.generation),
            CallLogKind::ProtocolViolation { detail },
        );
    }
}
