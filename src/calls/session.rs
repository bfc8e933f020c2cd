//! One call attempt: its state, its engine, and the tasks working for it.
//!
//! A [`Session`] exists exactly while the controller is not idle. All work
//! on the engine happens on a per-session driver task; completions are
//! posted back to the controller tagged with the session's [`Generation`].
//! Dropping the session cancels every task it spawned and closes the engine.

use callcore::{
    CallState, CallTransition, Generation, IceCandidate, InvalidTransition, SessionDescription,
    UserId,
};
use log::{debug, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::audio::SharedAudio;
use super::controller::{ControllerEvent, Mailbox};
use super::engine::{EngineError, EngineEvent, EngineFactory, NegotiationEngine};
use super::error::CallError;
use crate::config::RejectPolicy;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownCause {
    LocalHangUp,
    RemoteReject,
    NegotiationFailed(String),
    AudioUnavailable(String),
    ConnectivityFailed,
    ConnectivityClosed,
    ConnectTimeout,
    PresenceLost,
    /// Lost a simultaneous-offer tie-break; the session is replaced.
    GlareYield,
    Shutdown,
}

impl TeardownCause {
    /// Whether the peer should be told with `call/reject`.
    pub fn notifies_peer(&self, policy: RejectPolicy) -> bool {
        match self {
            Self::PresenceLost | Self::GlareYield | Self::Shutdown => false,
            Self::RemoteReject => policy == RejectPolicy::Always,
            Self::LocalHangUp
            | Self::NegotiationFailed(_)
            | Self::AudioUnavailable(_)
            | Self::ConnectivityFailed
            | Self::ConnectivityClosed
            | Self::ConnectTimeout => true,
        }
    }

    /// The error handed to whoever waits for the call to connect.
    pub fn to_error(&self) -> CallError {
        match self {
            Self::LocalHangUp | Self::GlareYield => CallError::Cancelled,
            Self::RemoteReject => CallError::Rejected,
            Self::NegotiationFailed(detail) => CallError::Negotiation(detail.clone()),
            Self::AudioUnavailable(detail) => CallError::Audio(detail.clone()),
            Self::ConnectivityFailed => CallError::Connectivity("failed".into()),
            Self::ConnectivityClosed => CallError::Connectivity("closed".into()),
            Self::ConnectTimeout => CallError::Timeout,
            Self::PresenceLost => CallError::PresenceLost,
            Self::Shutdown => CallError::ControllerClosed,
        }
    }
}

impl fmt::Display for TeardownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangUp => f.write_str("hung up"),
            Self::RemoteReject => f.write_str("rejected by peer"),
            Self::NegotiationFailed(detail) => write!(f, "negotiation failed ({detail})"),
            Self::AudioUnavailable(detail) => write!(f, "no audio ({detail})"),
            Self::ConnectivityFailed => f.write_str("connectivity failed"),
            Self::ConnectivityClosed => f.write_str("connectivity closed"),
            Self::ConnectTimeout => f.write_str("timed out connecting"),
            Self::PresenceLost => f.write_str("peer left"),
            Self::GlareYield => f.write_str("yielded to peer's call"),
            Self::Shutdown => f.write_str("shutting down"),
        }
    }
}

/// Which end of the exchange this session is.
#[derive(Debug, Clone)]
pub(crate) enum Role {
    Caller,
    Callee { offer: SessionDescription },
}

/// Work queued on the session's engine.
#[derive(Debug, Clone)]
pub(crate) enum EngineOp {
    CreateOffer,
    Answer { offer: SessionDescription },
    ApplyAnswer { answer: SessionDescription },
    AddCandidate { candidate: IceCandidate },
}

/// What came of an [`EngineOp`], or of bringing the engine up.
#[derive(Debug)]
pub(crate) enum OpOutcome {
    OfferReady(SessionDescription),
    AnswerReady(SessionDescription),
    AnswerApplied,
    CandidateAdded,
    Failed(TeardownCause),
}

/// Everything a session needs to start its tasks.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) engines: Arc<dyn EngineFactory>,
    pub(crate) audio: SharedAudio,
    pub(crate) mailbox: Mailbox,
    pub(crate) connect_timeout: Duration,
    pub(crate) ring_timeout: Duration,
}

pub(crate) type Waiter = oneshot::Sender<Result<(), CallError>>;

pub(crate) struct Session {
    pub(crate) generation: Generation,
    pub(crate) state: CallState,
    /// The remote participant, once an envelope from them has been seen.
    pub(crate) peer: Option<UserId>,
    /// Set when the engine reported `connected` before our answer went out.
    pub(crate) connected_early: bool,
    /// Set when our offer won a glare tie-break. Until the answer arrives,
    /// remote candidates belong to the peer's abandoned offer.
    pub(crate) glare_won: bool,
    /// Bumped on every re-arm so a deadline from an earlier phase is ignored.
    pub(crate) timer_epoch: u32,
    ops: mpsc::UnboundedSender<EngineOp>,
    cancel: CancellationToken,
    connect_timer: CancellationToken,
    mailbox: Mailbox,
    connect_timeout: Duration,
    waiter: Option<Waiter>,
    local_description_sent: bool,
    pending_local_candidates: Vec<IceCandidate>,
}

impl Session {
    /// Creates the session and starts its driver and connect timer.
    ///
    /// A caller's first deadline also covers the peer ringing, so it runs
    /// for `ring_timeout + connect_timeout`. Entering `Connecting` re-arms
    /// it with `connect_timeout`.
    pub(crate) fn start(
        generation: Generation,
        role: Role,
        peer: Option<UserId>,
        waiter: Option<Waiter>,
        ctx: &SessionContext,
    ) -> Result<Self, InvalidTransition> {
        let (state, first_op, first_deadline) = match role {
            Role::Caller => (
                CallState::Idle.apply(CallTransition::OfferCreated)?,
                EngineOp::CreateOffer,
                ctx.ring_timeout + ctx.connect_timeout,
            ),
            Role::Callee { offer } => (
                CallState::Idle.apply(CallTransition::OfferAccepted)?,
                EngineOp::Answer { offer },
                ctx.connect_timeout,
            ),
        };

        let cancel = CancellationToken::new();
        let (ops, ops_rx) = mpsc::unbounded_channel();
        // The receiver is alive, the driver has not been spawned yet.
        let _ = ops.send(first_op);

        tokio::spawn(drive_engine(
            generation,
            ctx.clone(),
            ops_rx,
            cancel.clone(),
        ));

        debug!("Session {generation} started in {state}");
        let mut session = Self {
            generation,
            state,
            peer,
            connected_early: false,
            glare_won: false,
            timer_epoch: 0,
            ops,
            connect_timer: cancel.child_token(),
            cancel,
            mailbox: ctx.mailbox.clone(),
            connect_timeout: ctx.connect_timeout,
            waiter,
            local_description_sent: false,
            pending_local_candidates: Vec::new(),
        };
        session.arm_connect_timer(first_deadline);
        Ok(session)
    }

    /// Replaces the running deadline with a fresh one.
    fn arm_connect_timer(&mut self, after: Duration) {
        self.connect_timer.cancel();
        self.timer_epoch = self.timer_epoch.wrapping_add(1);
        self.connect_timer = self.cancel.child_token();
        tokio::spawn(run_connect_timer(
            self.generation,
            self.timer_epoch,
            after,
            self.connect_timer.clone(),
            self.mailbox.clone(),
        ));
    }

    pub(crate) fn submit(&self, op: EngineOp) {
        if self.ops.send(op).is_err() {
            debug!("Session {} driver already gone", self.generation);
        }
    }

    pub(crate) fn advance(
        &mut self,
        transition: CallTransition,
    ) -> Result<CallState, InvalidTransition> {
        self.state = self.state.apply(transition)?;
        match self.state {
            CallState::Connecting => self.arm_connect_timer(self.connect_timeout),
            CallState::Active => self.connect_timer.cancel(),
            _ => {}
        }
        Ok(self.state)
    }

    /// Resolves the connect wait, if anyone is still waiting.
    pub(crate) fn resolve(&mut self, result: Result<(), CallError>) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(result);
        }
    }

    pub(crate) fn take_waiter(&mut self) -> Option<Waiter> {
        self.waiter.take()
    }

    /// Holds local candidates back until our description has been sent, so
    /// the peer never sees a candidate before the offer or answer.
    pub(crate) fn queue_local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.local_description_sent {
            Some(candidate)
        } else {
            self.pending_local_candidates.push(candidate);
            None
        }
    }

    /// Whether the peer knows this session exists: it sent us an offer or
    /// answer, or our own offer or answer went out.
    pub(crate) fn peer_has_heard(&self) -> bool {
        self.peer.is_some() || self.local_description_sent
    }

    /// Marks our description as sent and returns the candidates held back.
    pub(crate) fn local_description_sent(&mut self) -> Vec<IceCandidate> {
        self.local_description_sent = true;
        std::mem::take(&mut self.pending_local_candidates)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("connected_early", &self.connected_early)
            .field("glare_won", &self.glare_won)
            .field("waiting", &self.waiter.is_some())
            .finish_non_exhaustive()
    }
}

/// Brings the engine up, runs queued operations in order, and closes the
/// engine when the session is cancelled.
async fn drive_engine(
    generation: Generation,
    ctx: SessionContext,
    mut ops: mpsc::UnboundedReceiver<EngineOp>,
    cancel: CancellationToken,
) {
    // Setup runs to completion even if cancelled, so an engine that was
    // created is always closed.
    let engine = match bring_up(&ctx).await {
        Ok((engine, events)) => {
            tokio::spawn(forward_engine_events(
                generation,
                events,
                cancel.clone(),
                ctx.mailbox.clone(),
            ));
            engine
        }
        Err(cause) => {
            if !cancel.is_cancelled() {
                ctx.mailbox
                    .post(ControllerEvent::EngineOpDone {
                        generation,
                        outcome: OpOutcome::Failed(cause),
                    })
                    .await;
            }
            return;
        }
    };

    loop {
        let op = tokio::select! {
            _ = cancel.cancelled() => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = run_op(engine.as_ref(), op) => outcome,
        };
        ctx.mailbox
            .post(ControllerEvent::EngineOpDone {
                generation,
                outcome,
            })
            .await;
    }

    engine.close().await;
    debug!("Session {generation} engine closed");
}

async fn bring_up(
    ctx: &SessionContext,
) -> Result<(Arc<dyn NegotiationEngine>, mpsc::Receiver<EngineEvent>), TeardownCause> {
    let audio = ctx.audio.acquire().await.map_err(|e| match e {
        CallError::Audio(detail) => TeardownCause::AudioUnavailable(detail),
        other => TeardownCause::AudioUnavailable(other.to_string()),
    })?;
    ctx.engines
        .create_engine(audio)
        .await
        .map_err(|e| TeardownCause::NegotiationFailed(e.to_string()))
}

async fn run_op(engine: &dyn NegotiationEngine, op: EngineOp) -> OpOutcome {
    let failed = |e: EngineError| OpOutcome::Failed(TeardownCause::NegotiationFailed(e.to_string()));
    match op {
        EngineOp::CreateOffer => {
            let offer = match engine.create_offer().await {
                Ok(offer) => offer,
                Err(e) => return failed(e),
            };
            match engine.set_local_description(offer.clone()).await {
                Ok(()) => OpOutcome::OfferReady(offer),
                Err(e) => failed(e),
            }
        }
        EngineOp::Answer { offer } => {
            if let Err(e) = engine.set_remote_description(offer.clone()).await {
                return failed(e);
            }
            let answer = match engine.create_answer(&offer).await {
                Ok(answer) => answer,
                Err(e) => return failed(e),
            };
            match engine.set_local_description(answer.clone()).await {
                Ok(()) => OpOutcome::AnswerReady(answer),
                Err(e) => failed(e),
            }
        }
        EngineOp::ApplyAnswer { answer } => match engine.set_remote_description(answer).await {
            Ok(()) => OpOutcome::AnswerApplied,
            Err(e) => failed(e),
        },
        EngineOp::AddCandidate { candidate } => match engine.add_candidate(candidate).await {
            Ok(()) => OpOutcome::CandidateAdded,
            Err(e) => failed(e),
        },
    }
}

async fn forward_engine_events(
    generation: Generation,
    mut events: mpsc::Receiver<EngineEvent>,
    cancel: CancellationToken,
    mailbox: Mailbox,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Some(event) => {
                mailbox
                    .post(ControllerEvent::Engine { generation, event })
                    .await
            }
            None => {
                debug!("Session {generation} engine event stream ended");
                return;
            }
        }
    }
}

async fn run_connect_timer(
    generation: Generation,
    epoch: u32,
    timeout: Duration,
    stop: CancellationToken,
    mailbox: Mailbox,
) {
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = tokio::time::sleep(timeout) => {
            warn!("Session {generation} not connected after {timeout:?}");
            mailbox.post(ControllerEvent::Timeout { generation, epoch }).await;
        }
    }
}
