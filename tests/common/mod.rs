// Shared harness: one controller on side A of a memory relay, with the test
// playing the remote participant on side B by hand.

#![allow(dead_code)]

use async_trait::async_trait;
use peercall::calls::{
    CallController, CallControllerHandle, Decision, IncomingCallDecider, LoopbackEngine,
    LoopbackEngineFactory, SilentAudioSource,
};
use peercall::callcore::{
    CallEvent, CallState, IceCandidate, SessionDescription, SignalingEnvelope, UserId,
};
use peercall::transport::{MemoryRelay, Side, Transport, TransportEvent, TransportFactory};
use peercall::types::events::{CallLogEntry, CallLogKind};
use peercall::{CallControllerConfig, RejectPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(150);

pub const LOCAL_ID: &str = "200";
/// Sorts below [`LOCAL_ID`], so it wins glare.
pub const LOW_PEER_ID: &str = "100";
/// Sorts above [`LOCAL_ID`], so it loses glare.
pub const HIGH_PEER_ID: &str = "300";

/// A decider the test answers for.
#[derive(Clone)]
pub struct ScriptedDecider {
    decisions: Arc<Mutex<mpsc::UnboundedReceiver<Decision>>>,
}

#[derive(Clone)]
pub struct DecisionRemote {
    tx: mpsc::UnboundedSender<Decision>,
}

impl DecisionRemote {
    pub fn decide(&self, decision: Decision) {
        self.tx.send(decision).unwrap();
    }
}

pub fn scripted_decider() -> (ScriptedDecider, DecisionRemote) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ScriptedDecider {
            decisions: Arc::new(Mutex::new(rx)),
        },
        DecisionRemote { tx },
    )
}

#[async_trait]
impl IncomingCallDecider for ScriptedDecider {
    async fn decide(&self, _from: &UserId) -> Decision {
        match self.decisions.lock().await.recv().await {
            Some(decision) => decision,
            None => std::future::pending().await,
        }
    }
}

/// The remote participant, driven by the test.
pub struct Peer {
    pub id: UserId,
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
}

impl Peer {
    pub async fn send(&self, event: CallEvent) {
        self.send_envelope(SignalingEnvelope::call(self.id.clone(), event))
            .await;
    }

    pub async fn send_envelope(&self, envelope: SignalingEnvelope) {
        let frame = envelope.encode().unwrap();
        self.transport.send_frame(frame.as_bytes()).await.unwrap();
    }

    pub async fn send_raw(&self, frame: &[u8]) {
        self.transport.send_frame(frame).await.unwrap();
    }

    pub async fn offer(&self) {
        self.send(CallEvent::Offer {
            offer: SessionDescription::offer("v=0\r\no=- peer 1 IN IP4 127.0.0.1\r\n"),
        })
        .await;
    }

    pub async fn answer(&self) {
        self.send(CallEvent::Answer {
            answer: SessionDescription::answer("v=0\r\no=- peer 2 IN IP4 127.0.0.1\r\n"),
        })
        .await;
    }

    pub async fn candidate(&self, line: &str) {
        self.send(CallEvent::Candidate {
            candidate: IceCandidate::new(line).with_sdp_mid("0"),
        })
        .await;
    }

    pub async fn reject(&self) {
        self.send(CallEvent::Reject).await;
    }

    /// Next envelope from the controller, with a deadline.
    pub async fn recv(&mut self) -> SignalingEnvelope {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await.expect("peer transport closed") {
                    TransportEvent::FrameReceived(frame) => {
                        return SignalingEnvelope::decode(&frame).unwrap();
                    }
                    TransportEvent::Connected => continue,
                    TransportEvent::Disconnected => panic!("peer transport disconnected"),
                }
            }
        })
        .await
        .expect("timed out waiting for an envelope")
    }

    /// Next `call` event, skipping presence notices and chat.
    pub async fn expect_call(&mut self) -> CallEvent {
        loop {
            if let SignalingEnvelope::Call { event, .. } = self.recv().await {
                return event;
            }
        }
    }

    /// Next call event that is not a trickled candidate.
    pub async fn expect_signal(&mut self) -> CallEvent {
        loop {
            let event = self.expect_call().await;
            if !matches!(event, CallEvent::Candidate { .. }) {
                return event;
            }
        }
    }

    /// Asserts nothing but candidates arrives for a short while.
    pub async fn expect_silence(&mut self) {
        let quiet = tokio::time::timeout(QUIET, async {
            loop {
                match self.events.recv().await {
                    Some(TransportEvent::FrameReceived(frame)) => {
                        let envelope = SignalingEnvelope::decode(&frame).unwrap();
                        if let SignalingEnvelope::Call {
                            event: CallEvent::Candidate { .. },
                            ..
                        } = envelope
                        {
                            continue;
                        }
                        return envelope;
                    }
                    Some(_) => continue,
                    None => std::future::pending().await,
                }
            }
        })
        .await;
        if let Ok(envelope) = quiet {
            panic!("expected silence, got {envelope}");
        }
    }

    pub async fn leave(&self) {
        self.transport.disconnect().await;
    }
}

pub struct Options {
    pub local_id: &'static str,
    pub peer_id: &'static str,
    pub engines: LoopbackEngineFactory,
    pub reject_policy: RejectPolicy,
    pub connect_timeout: Duration,
    pub ring_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            local_id: LOCAL_ID,
            peer_id: HIGH_PEER_ID,
            engines: LoopbackEngineFactory::manual(),
            reject_policy: RejectPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            ring_timeout: Duration::from_secs(45),
        }
    }
}

pub struct Harness {
    pub relay: MemoryRelay,
    pub handle: CallControllerHandle,
    pub engines: LoopbackEngineFactory,
    pub audio: SilentAudioSource,
    pub peer: Peer,
    pub decisions: DecisionRemote,
    log: broadcast::Receiver<Arc<CallLogEntry>>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(Options::default()).await
    }

    pub async fn with(options: Options) -> Self {
        let relay = MemoryRelay::new();
        let audio = SilentAudioSource::new();
        let (decider, decisions) = scripted_decider();

        let config = CallControllerConfig {
            reject_policy: options.reject_policy,
            connect_timeout: options.connect_timeout,
            ring_timeout: options.ring_timeout,
            ..CallControllerConfig::new(options.local_id)
        };
        let handle = CallController::builder(config)
            .with_engine_factory(options.engines.clone())
            .with_audio_source(audio.clone())
            .with_decider(decider)
            .build(&relay.factory(Side::A))
            .await
            .unwrap();
        let log = handle.event_bus().call_log.subscribe();

        let (transport, events) = relay.factory(Side::B).create_transport().await.unwrap();
        let mut peer = Peer {
            id: UserId::from(options.peer_id),
            transport,
            events,
        };
        assert_eq!(peer.recv().await, SignalingEnvelope::Connected);
        wait_presence(&handle, true).await;

        Self {
            relay,
            handle,
            engines: options.engines,
            audio,
            peer,
            decisions,
            log,
        }
    }

    pub async fn wait_state(&self, state: CallState) {
        wait_state(&self.handle, state).await;
    }

    /// The engine of the most recent session, once it exists.
    pub async fn engine(&self) -> Arc<LoopbackEngine> {
        let engines = self.engines.clone();
        eventually(|| engines.latest().is_some()).await;
        self.engines.latest().unwrap()
    }

    /// Places a call and consumes the offer on the peer side.
    pub async fn call_out(&mut self) -> peercall::calls::CallAttempt {
        let attempt = self.handle.start_call().await.unwrap();
        assert!(matches!(
            self.peer.expect_signal().await,
            CallEvent::Offer { .. }
        ));
        attempt
    }

    /// Drives an outgoing call to `Active`.
    pub async fn connect_out(&mut self) -> peercall::calls::CallAttempt {
        let attempt = self.call_out().await;
        self.peer.answer().await;
        self.wait_state(CallState::Connecting).await;
        let engine = self.engine().await;
        eventually(|| engine.remote_description().is_some()).await;
        engine
            .report(peercall::calls::Connectivity::Connected)
            .await;
        self.wait_state(CallState::Active).await;
        attempt
    }

    /// Takes an incoming call and waits until our answer went out.
    pub async fn answer_in(&mut self) {
        self.peer.offer().await;
        self.wait_log(|kind| matches!(kind, CallLogKind::IncomingOffer { .. }))
            .await;
        self.decisions.decide(Decision::Accept);
        assert!(matches!(
            self.peer.expect_signal().await,
            CallEvent::Answer { .. }
        ));
        self.wait_state(CallState::Connecting).await;
    }

    /// Waits for a call log entry matching `pred`, skipping others.
    pub async fn wait_log(&mut self, pred: impl Fn(&CallLogKind) -> bool) -> CallLogKind {
        tokio::time::timeout(WAIT, async {
            loop {
                let entry = self.log.recv().await.unwrap();
                if pred(&entry.kind) {
                    return entry.kind.clone();
                }
            }
        })
        .await
        .expect("timed out waiting for call log entry")
    }

    pub async fn wait_closed(&self, count: usize) {
        let engines = self.engines.clone();
        eventually(move || engines.close_count() == count).await;
    }
}

pub async fn wait_state(handle: &CallControllerHandle, state: CallState) {
    let mut view = handle.subscribe_view();
    tokio::time::timeout(WAIT, view.wait_for(|view| view.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}, still {}", handle.state()))
        .unwrap();
}

pub async fn wait_presence(handle: &CallControllerHandle, present: bool) {
    let mut presence = handle.subscribe_presence();
    tokio::time::timeout(WAIT, presence.wait_for(|value| *value == present))
        .await
        .expect("timed out waiting for presence")
        .unwrap();
}

/// Polls `cond` until it holds.
pub async fn eventually(cond: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
