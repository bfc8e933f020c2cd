//! The call controller actor.
//!
//! One [`CallController`] per participant pair. It owns at most one
//! [`Session`] and is the only place that mutates it: local intents from
//! [`CallControllerHandle`]s, inbound envelopes, engine completions and timer
//! expiries all arrive on a single mailbox and are handled one at a time.
//! Nothing slow runs on the actor itself; engine work, ring decisions and
//! timeouts run on spawned tasks that post their results back.

use callcore::{
    CallEvent, CallState, CallTransition, CallView, Generation, IceCandidate, SessionDescription,
    UserId,
};
use chrono::Utc;
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::audio::{AudioSource, SharedAudio};
use super::engine::{Connectivity, EngineEvent, EngineFactory};
use super::error::CallError;
use super::incoming::{AutoDecision, Decision, IncomingCallDecider};
use super::presence::PresenceTracker;
use super::session::{
    EngineOp, OpOutcome, Role, Session, SessionContext, TeardownCause, Waiter,
};
use super::signaling::SignalingChannel;
use crate::config::CallControllerConfig;
use crate::transport::{TransportEvent, TransportFactory};
use crate::types::events::{CallLogEntry, CallLogKind, CallStateChanged, EventBus, IncomingCall};

/// Everything the actor reacts to.
#[derive(Debug)]
pub(crate) enum ControllerEvent {
    StartCall {
        reply: oneshot::Sender<Result<CallAttempt, CallError>>,
    },
    HangUp {
        reply: oneshot::Sender<bool>,
    },
    SendMessage {
        content: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    EngineOpDone {
        generation: Generation,
        outcome: OpOutcome,
    },
    Engine {
        generation: Generation,
        event: EngineEvent,
    },
    Timeout {
        generation: Generation,
        epoch: u32,
    },
    OfferDecision {
        ticket: Generation,
        decision: Decision,
    },
}

/// Posting side of the mailbox for spawned tasks.
///
/// Holds a weak sender so background work never keeps the controller alive
/// after every handle is gone.
#[derive(Clone)]
pub(crate) struct Mailbox(mpsc::WeakSender<ControllerEvent>);

impl Mailbox {
    pub(crate) async fn post(&self, event: ControllerEvent) {
        let Some(tx) = self.0.upgrade() else {
            trace!("Controller gone, dropping completion");
            return;
        };
        if tx.send(event).await.is_err() {
            trace!("Controller mailbox closed, dropping completion");
        }
    }
}

/// A call placed with [`CallControllerHandle::start_call`].
#[derive(Debug)]
pub struct CallAttempt {
    generation: Generation,
    established: oneshot::Receiver<Result<(), CallError>>,
}

impl CallAttempt {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Waits until the call is active, or for the reason it never got there.
    pub async fn established(self) -> Result<(), CallError> {
        self.established
            .await
            .unwrap_or(Err(CallError::ControllerClosed))
    }
}

/// An incoming offer waiting for the user to pick up.
struct PendingOffer {
    ticket: Generation,
    from: UserId,
    offer: SessionDescription,
    /// Candidates the caller trickled while we were still ringing.
    candidates: Vec<IceCandidate>,
    _ring: DropGuard,
}

pub struct CallControllerBuilder {
    config: CallControllerConfig,
    engines: Option<Arc<dyn EngineFactory>>,
    audio: Option<Arc<dyn AudioSource>>,
    decider: Option<Arc<dyn IncomingCallDecider>>,
    bus: Option<Arc<EventBus>>,
}

impl CallControllerBuilder {
    pub fn new(config: CallControllerConfig) -> Self {
        Self {
            config,
            engines: None,
            audio: None,
            decider: None,
            bus: None,
        }
    }

    pub fn with_engine_factory(mut self, engines: impl EngineFactory + 'static) -> Self {
        self.engines = Some(Arc::new(engines));
        self
    }

    pub fn with_audio_source(mut self, audio: impl AudioSource + 'static) -> Self {
        self.audio = Some(Arc::new(audio));
        self
    }

    /// Who picks up incoming calls. Defaults to accepting everything.
    pub fn with_decider(mut self, decider: impl IncomingCallDecider + 'static) -> Self {
        self.decider = Some(Arc::new(decider));
        self
    }

    /// Share an existing bus instead of creating one.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Connects the transport and spawns the controller.
    pub async fn build(
        self,
        transports: &dyn TransportFactory,
    ) -> Result<CallControllerHandle, CallError> {
        let engines = self
            .engines
            .ok_or(CallError::MissingCollaborator("engine factory"))?;
        let audio = self
            .audio
            .ok_or(CallError::MissingCollaborator("audio source"))?;
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(AutoDecision::default()));
        let bus = self.bus.unwrap_or_default();

        let (transport, transport_events) = transports
            .create_transport()
            .await
            .map_err(|e| CallError::Transport(format!("{e:#}")))?;

        let (tx, mailbox_rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let presence = PresenceTracker::new();
        let (view, view_rx) = watch::channel(CallView::default());

        let handle = CallControllerHandle {
            tx: tx.clone(),
            view: view_rx,
            presence: presence.subscribe(),
            bus: bus.clone(),
            local_id: self.config.local_id.clone(),
        };

        let controller = CallController {
            ctx: SessionContext {
                engines,
                audio: SharedAudio::new(audio),
                mailbox: Mailbox(tx.downgrade()),
                connect_timeout: self.config.connect_timeout,
                ring_timeout: self.config.ring_timeout,
            },
            signaling: SignalingChannel::new(transport, self.config.local_id.clone()),
            config: self.config,
            mailbox_rx,
            transport_events,
            transport_open: true,
            decider,
            presence,
            view,
            bus,
            session: None,
            ringing: None,
            last_generation: Generation::ZERO,
            published_state: CallState::Idle,
        };
        drop(tx);

        tokio::spawn(controller.run());
        Ok(handle)
    }
}

/// Cloneable front end of a running [`CallController`].
#[derive(Clone)]
pub struct CallControllerHandle {
    tx: mpsc::Sender<ControllerEvent>,
    view: watch::Receiver<CallView>,
    presence: watch::Receiver<bool>,
    bus: Arc<EventBus>,
    local_id: UserId,
}

impl CallControllerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControllerEvent,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CallError::ControllerClosed)?;
        rx.await.map_err(|_| CallError::ControllerClosed)
    }

    /// Places a call to the peer.
    ///
    /// Fails with [`CallError::AlreadyInCall`] if a call is running or an
    /// incoming call is ringing, and with [`CallError::PeerAbsent`] if there
    /// is nobody to call. Otherwise the returned attempt resolves once the
    /// call connects or ends.
    pub async fn start_call(&self) -> Result<CallAttempt, CallError> {
        self.request(|reply| ControllerEvent::StartCall { reply })
            .await?
    }

    /// Ends the current call, or declines a ringing one. Returns whether
    /// there was anything to end.
    pub async fn hang_up(&self) -> Result<bool, CallError> {
        self.request(|reply| ControllerEvent::HangUp { reply }).await
    }

    pub async fn send_message(&self, content: impl Into<String>) -> Result<(), CallError> {
        let content = content.into();
        self.request(|reply| ControllerEvent::SendMessage { content, reply })
            .await?
    }

    /// Stops the controller: ends any call without notifying the peer,
    /// releases the audio capture and disconnects the transport.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.request(|reply| ControllerEvent::Shutdown { reply })
            .await
    }

    pub fn view(&self) -> CallView {
        *self.view.borrow()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<CallView> {
        self.view.clone()
    }

    pub fn state(&self) -> CallState {
        self.view.borrow().state
    }

    pub fn is_peer_present(&self) -> bool {
        *self.presence.borrow()
    }

    pub fn subscribe_presence(&self) -> watch::Receiver<bool> {
        self.presence.clone()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub struct CallController {
    pub(super) config: CallControllerConfig,
    ctx: SessionContext,
    mailbox_rx: mpsc::Receiver<ControllerEvent>,
    signaling: SignalingChannel,
    transport_events: mpsc::Receiver<TransportEvent>,
    transport_open: bool,
    decider: Arc<dyn IncomingCallDecider>,
    pub(super) presence: PresenceTracker,
    view: watch::Sender<CallView>,
    pub(super) bus: Arc<EventBus>,
    pub(super) session: Option<Session>,
    ringing: Option<PendingOffer>,
    last_generation: Generation,
    published_state: CallState,
}

impl CallController {
    pub fn builder(config: CallControllerConfig) -> CallControllerBuilder {
        CallControllerBuilder::new(config)
    }

    async fn run(mut self) {
        info!("Call controller for {} running", self.config.local_id);
        loop {
            tokio::select! {
                event = self.mailbox_rx.recv() => match event {
                    Some(event) => {
                        if !self.handle_event(event).await {
                            break;
                        }
                    }
                    None => {
                        debug!("All controller handles dropped");
                        self.shut_down().await;
                        break;
                    }
                },
                event = self.transport_events.recv(), if self.transport_open => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        warn!("Transport event stream ended");
                        self.transport_open = false;
                        self.on_presence(false).await;
                    }
                },
            }
            self.publish();
        }
        info!("Call controller for {} stopped", self.config.local_id);
    }

    /// Returns `false` once the controller has shut down.
    async fn handle_event(&mut self, event: ControllerEvent) -> bool {
        match event {
            ControllerEvent::StartCall { reply } => {
                let result = self.start_call();
                let _ = reply.send(result);
            }
            ControllerEvent::HangUp { reply } => {
                let ended = self.hang_up().await;
                let _ = reply.send(ended);
            }
            ControllerEvent::SendMessage { content, reply } => {
                let _ = reply.send(self.signaling.send_chat(content).await);
            }
            ControllerEvent::Shutdown { reply } => {
                self.shut_down().await;
                let _ = reply.send(());
                return false;
            }
            ControllerEvent::EngineOpDone {
                generation,
                outcome,
            } => {
                if self.is_current(generation) {
                    self.on_op_done(outcome).await;
                } else {
                    debug!("Discarding stale engine completion for {generation}: {outcome:?}");
                }
            }
            ControllerEvent::Engine { generation, event } => {
                if self.is_current(generation) {
                    self.on_engine_event(event).await;
                } else {
                    debug!("Discarding stale engine event for {generation}: {event:?}");
                }
            }
            ControllerEvent::Timeout { generation, epoch } => {
                let armed = self.session.as_ref().is_some_and(|session| {
                    session.generation == generation && session.timer_epoch == epoch
                });
                if armed {
                    self.teardown(TeardownCause::ConnectTimeout).await;
                } else {
                    debug!("Discarding stale timeout for {generation}");
                }
            }
            ControllerEvent::OfferDecision { ticket, decision } => {
                self.on_decision(ticket, decision).await;
            }
        }
        true
    }

    pub(super) fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map_or(CallState::Idle, |session| session.state)
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.generation == generation)
    }

    fn next_generation(&mut self) -> Generation {
        self.last_generation = self.last_generation.next();
        self.last_generation
    }

    pub(super) fn log(&self, generation: Option<Generation>, kind: CallLogKind) {
        let _ = self
            .bus
            .call_log
            .send(Arc::new(CallLogEntry::new(generation, kind)));
    }

    /// Pushes the current state to the view and, on change, to the bus.
    pub(super) fn publish(&mut self) {
        let generation = self.session.as_ref().map(|session| session.generation);
        self.publish_for(generation);
    }

    fn publish_for(&mut self, generation: Option<Generation>) {
        let state = self.state();
        let view = CallView::new(state, self.presence.is_present());
        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });

        if state != self.published_state {
            let from = std::mem::replace(&mut self.published_state, state);
            debug!("Call state {from} -> {state}");
            let _ = self.bus.call_state.send(Arc::new(CallStateChanged {
                generation,
                from,
                to: state,
                label: view.label,
                at: Utc::now(),
            }));
        }
    }

    fn start_call(&mut self) -> Result<CallAttempt, CallError> {
        if self.session.is_some() || self.ringing.is_some() {
            info!("Refusing to start a call while {}", self.state());
            self.log(
                None,
                CallLogKind::GuardViolation {
                    reason: CallError::AlreadyInCall.to_string(),
                },
            );
            return Err(CallError::AlreadyInCall);
        }
        if !self.presence.is_present() {
            info!("Refusing to start a call with nobody there");
            self.log(
                None,
                CallLogKind::GuardViolation {
                    reason: CallError::PeerAbsent.to_string(),
                },
            );
            return Err(CallError::PeerAbsent);
        }

        let generation = self.next_generation();
        let (waiter, established) = oneshot::channel();
        let session = Session::start(generation, Role::Caller, None, Some(waiter), &self.ctx)
            .map_err(|e| CallError::ProtocolViolation(e.to_string()))?;
        info!("Placing call ({generation})");
        self.session = Some(session);
        self.publish();
        Ok(CallAttempt {
            generation,
            established,
        })
    }

    async fn hang_up(&mut self) -> bool {
        if self.session.is_some() {
            self.teardown(TeardownCause::LocalHangUp).await;
            true
        } else if let Some(pending) = self.ringing.take() {
            self.decline(pending).await;
            true
        } else {
            debug!("Hang-up with no call in progress");
            false
        }
    }

    /// Releases the session, if any.
    ///
    /// Closes the engine by cancelling the session's tasks, tells the peer
    /// when the cause calls for it and the peer has seen this session at
    /// all, and resolves the connect wait. On glare
    /// the wait is handed back instead so the replacement session can take
    /// it over.
    pub(super) async fn teardown(&mut self, cause: TeardownCause) -> Option<Waiter> {
        let mut session = self.session.take()?;
        let generation = session.generation;
        let from = session.state;
        let notify = session.peer_has_heard() && cause.notifies_peer(self.config.reject_policy);

        let carried = if cause == TeardownCause::GlareYield {
            session.take_waiter()
        } else {
            session.resolve(Err(cause.to_error()));
            None
        };
        if let Err(e) = session.advance(CallTransition::Released) {
            warn!("{e}");
        }
        drop(session);

        if notify {
            self.signaling.emit(CallEvent::Reject).await;
        }

        info!("Call {generation} ended in {from}: {cause}");
        self.log(Some(generation), CallLogKind::Ended { cause });
        self.publish_for(Some(generation));
        carried
    }

    async fn shut_down(&mut self) {
        info!("Shutting down call controller");
        self.ringing = None;
        self.teardown(TeardownCause::Shutdown).await;
        self.ctx.audio.release();
        self.signaling.close().await;
        self.publish();
    }

    async fn on_op_done(&mut self, outcome: OpOutcome) {
        let Some(generation) = self.session.as_ref().map(|session| session.generation) else {
            return;
        };
        match outcome {
            OpOutcome::OfferReady(offer) => {
                self.signaling.emit(CallEvent::Offer { offer }).await;
                self.flush_local_candidates().await;
                self.log(Some(generation), CallLogKind::OfferSent);
            }
            OpOutcome::AnswerReady(answer) => {
                self.signaling.emit(CallEvent::Answer { answer }).await;
                self.flush_local_candidates().await;
                self.log(Some(generation), CallLogKind::AnswerSent);

                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if let Err(e) = session.advance(CallTransition::AnswerSent) {
                    warn!("{e}");
                    return;
                }
                if session.connected_early {
                    self.establish();
                }
            }
            OpOutcome::AnswerApplied => debug!("Remote answer applied ({generation})"),
            OpOutcome::CandidateAdded => trace!("Remote candidate registered ({generation})"),
            OpOutcome::Failed(cause) => {
                warn!("Engine work failed ({generation}): {cause}");
                self.teardown(cause).await;
            }
        }
    }

    async fn flush_local_candidates(&mut self) {
        let held = match self.session.as_mut() {
            Some(session) => session.local_description_sent(),
            None => return,
        };
        for candidate in held {
            self.signaling.emit(CallEvent::Candidate { candidate }).await;
        }
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = session.queue_local_candidate(candidate) {
                    self.signaling.emit(CallEvent::Candidate { candidate }).await;
                }
            }
            EngineEvent::Connectivity(Connectivity::Connected) => match session.state {
                CallState::Connecting => self.establish(),
                CallState::Offering | CallState::Answering => {
                    debug!("Engine connected before negotiation finished");
                    session.connected_early = true;
                }
                CallState::Active | CallState::Idle => {
                    trace!("Duplicate connected report in {}", session.state)
                }
            },
            EngineEvent::Connectivity(Connectivity::Connecting) => {
                trace!("Engine connecting ({})", session.generation);
            }
            EngineEvent::Connectivity(Connectivity::Failed) => {
                self.teardown(TeardownCause::ConnectivityFailed).await;
            }
            EngineEvent::Connectivity(Connectivity::Closed) => {
                self.teardown(TeardownCause::ConnectivityClosed).await;
            }
        }
    }

    /// Connecting → Active.
    pub(super) fn establish(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.advance(CallTransition::ConnectivityEstablished) {
            Ok(_) => {
                session.resolve(Ok(()));
                let generation = session.generation;
                info!("Call {generation} connected");
                self.log(Some(generation), CallLogKind::Connected);
            }
            Err(e) => warn!("{e}"),
        }
    }

    /// Starts ringing for an incoming offer.
    pub(super) fn ring(&mut self, from: UserId, offer: SessionDescription) {
        if let Some(previous) = self.ringing.take() {
            debug!("Offer from {from} superseded ringing {}", previous.ticket);
        }
        let ticket = self.next_generation();
        let cancel = CancellationToken::new();
        tokio::spawn(await_decision(
            ticket,
            from.clone(),
            self.decider.clone(),
            self.config.ring_timeout,
            cancel.clone(),
            self.ctx.mailbox.clone(),
        ));

        info!("Incoming call from {from}");
        let _ = self
            .bus
            .incoming_call
            .send(Arc::new(IncomingCall {
                from: from.clone(),
                at: Utc::now(),
            }));
        self.log(
            Some(ticket),
            CallLogKind::IncomingOffer { from: from.clone() },
        );
        self.ringing = Some(PendingOffer {
            ticket,
            from,
            offer,
            candidates: Vec::new(),
            _ring: cancel.drop_guard(),
        });
    }

    /// Stops ringing because the caller went away or gave up.
    pub(super) fn stop_ringing(&mut self) -> bool {
        match self.ringing.take() {
            Some(pending) => {
                info!("{} gave up before we answered", pending.from);
                self.log(
                    Some(pending.ticket),
                    CallLogKind::RingingCancelled { from: pending.from },
                );
                true
            }
            None => false,
        }
    }

    /// Keeps a candidate for the ringing offer. Returns `false` if nothing
    /// is ringing.
    pub(super) fn hold_ringing_candidate(&mut self, candidate: IceCandidate) -> bool {
        match self.ringing.as_mut() {
            Some(pending) => {
                trace!("Holding candidate for ringing {}", pending.ticket);
                pending.candidates.push(candidate);
                true
            }
            None => false,
        }
    }

    async fn on_decision(&mut self, ticket: Generation, decision: Decision) {
        let Some(pending) = self.ringing.take_if(|pending| pending.ticket == ticket) else {
            debug!("Discarding decision for {ticket}, no longer ringing");
            return;
        };
        match decision {
            Decision::Accept => {
                let PendingOffer {
                    from,
                    offer,
                    candidates,
                    ..
                } = pending;
                self.accept_offer(from, offer, candidates, None);
            }
            Decision::Decline => self.decline(pending).await,
        }
    }

    async fn decline(&mut self, pending: PendingOffer) {
        info!("Declining call from {}", pending.from);
        self.signaling.emit(CallEvent::Reject).await;
        self.log(
            Some(pending.ticket),
            CallLogKind::Declined { from: pending.from },
        );
    }

    /// Idle → Answering for an offer we have agreed to take.
    pub(super) fn accept_offer(
        &mut self,
        from: UserId,
        offer: SessionDescription,
        early_candidates: Vec<IceCandidate>,
        waiter: Option<Waiter>,
    ) {
        let generation = self.next_generation();
        match Session::start(
            generation,
            Role::Callee { offer },
            Some(from.clone()),
            waiter,
            &self.ctx,
        ) {
            Ok(session) => {
                info!("Answering call from {from} ({generation})");
                // Queued behind the answer, so the remote description is set first.
                for candidate in early_candidates {
                    session.submit(EngineOp::AddCandidate { candidate });
                }
                self.session = Some(session);
                self.publish();
            }
            Err(e) => warn!("Cannot answer call from {from}: {e}"),
        }
    }
}

async fn await_decision(
    ticket: Generation,
    from: UserId,
    decider: Arc<dyn IncomingCallDecider>,
    ring_timeout: Duration,
    cancel: CancellationToken,
    mailbox: Mailbox,
) {
    let decided = tokio::select! {
        _ = cancel.cancelled() => return,
        decided = tokio::time::timeout(ring_timeout, decider.decide(&from)) => decided,
    };
    let decision = decided.unwrap_or_else(|_| {
        info!("Nobody answered {from} within {ring_timeout:?}");
        Decision::Decline
    });
    mailbox
        .post(ControllerEvent::OfferDecision { ticket, decision })
        .await;
}
