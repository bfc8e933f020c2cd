// End-to-end: two controllers on one memory relay, each with its own
// auto-connecting loopback engine, calling each other for real.

mod common;

use common::{eventually, wait_presence, wait_state};
use async_trait::async_trait;
use peercall::calls::{
    AutoDecision, CallController, CallControllerHandle, CallError, Decision,
    IncomingCallDecider, LoopbackEngineFactory, SilentAudioSource,
};
use peercall::callcore::{CallState, UserId};
use peercall::transport::{MemoryRelay, Side};
use peercall::CallControllerConfig;
use std::time::Duration;

struct Participant {
    handle: CallControllerHandle,
    engines: LoopbackEngineFactory,
    audio: SilentAudioSource,
}

async fn participant(
    relay: &MemoryRelay,
    side: Side,
    id: &str,
    decision: AutoDecision,
) -> Participant {
    let engines = LoopbackEngineFactory::default();
    let audio = SilentAudioSource::new();
    let handle = CallController::builder(CallControllerConfig::new(id))
        .with_engine_factory(engines.clone())
        .with_audio_source(audio.clone())
        .with_decider(decision)
        .build(&relay.factory(side))
        .await
        .unwrap();
    Participant {
        handle,
        engines,
        audio,
    }
}

async fn pair(decision: AutoDecision) -> (Participant, Participant) {
    let relay = MemoryRelay::new();
    let alice = participant(&relay, Side::A, "1001", AutoDecision::accept()).await;
    let bob = participant(&relay, Side::B, "2002", decision).await;
    wait_presence(&alice.handle, true).await;
    wait_presence(&bob.handle, true).await;
    (alice, bob)
}

#[tokio::test]
async fn test_full_call_between_two_controllers() {
    let (alice, bob) = pair(AutoDecision::accept()).await;

    let attempt = alice.handle.start_call().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), attempt.established())
        .await
        .expect("call never connected")
        .unwrap();

    assert_eq!(alice.handle.state(), CallState::Active);
    wait_state(&bob.handle, CallState::Active).await;

    // Both engines saw each other's descriptions and candidates.
    let caller_engine = alice.engines.latest().unwrap();
    let callee_engine = bob.engines.latest().unwrap();
    assert_eq!(
        caller_engine.remote_description(),
        callee_engine.local_description()
    );
    assert_eq!(
        callee_engine.remote_description(),
        caller_engine.local_description()
    );
    eventually(|| !caller_engine.applied_candidates().is_empty()).await;
    eventually(|| !callee_engine.applied_candidates().is_empty()).await;

    assert!(bob.handle.hang_up().await.unwrap());
    wait_state(&alice.handle, CallState::Idle).await;
    wait_state(&bob.handle, CallState::Idle).await;
    eventually(|| alice.engines.close_count() == 1 && bob.engines.close_count() == 1).await;
}

#[tokio::test]
async fn test_declined_call_resolves_as_rejected() {
    let (alice, bob) = pair(AutoDecision::decline()).await;

    let attempt = alice.handle.start_call().await.unwrap();
    assert_eq!(attempt.established().await, Err(CallError::Rejected));
    wait_state(&alice.handle, CallState::Idle).await;
    assert_eq!(bob.engines.created_count(), 0);
    assert_eq!(bob.audio.acquired_count(), 0);
}

#[tokio::test]
async fn test_simultaneous_calls_settle_on_one() {
    let (alice, bob) = pair(AutoDecision::accept()).await;

    let (ours, theirs) = tokio::join!(alice.handle.start_call(), bob.handle.start_call());

    // If one offer landed before the other side dialed, that side is ringing
    // and refuses; otherwise the offers crossed and glare picks a winner.
    let mut attempts = Vec::new();
    for result in [ours, theirs] {
        match result {
            Ok(attempt) => attempts.push(attempt),
            Err(e) => assert_eq!(e, CallError::AlreadyInCall),
        }
    }
    assert!(!attempts.is_empty());
    for attempt in attempts {
        assert_eq!(attempt.established().await, Ok(()));
    }
    wait_state(&alice.handle, CallState::Active).await;
    wait_state(&bob.handle, CallState::Active).await;
}

#[tokio::test]
async fn test_repeat_calls_reuse_the_microphone() {
    let (alice, bob) = pair(AutoDecision::accept()).await;

    for _ in 0..3 {
        let attempt = alice.handle.start_call().await.unwrap();
        attempt.established().await.unwrap();
        wait_state(&bob.handle, CallState::Active).await;
        alice.handle.hang_up().await.unwrap();
        wait_state(&bob.handle, CallState::Idle).await;
    }

    assert_eq!(alice.audio.acquired_count(), 1);
    assert_eq!(bob.audio.acquired_count(), 1);
    assert_eq!(alice.engines.created_count(), 3);

    alice.handle.shutdown().await.unwrap();
    bob.handle.shutdown().await.unwrap();
    assert_eq!(alice.audio.released_count(), 1);
    assert_eq!(bob.audio.released_count(), 1);
}

#[tokio::test]
async fn test_shutdown_of_one_side_ends_the_other_call() {
    let (alice, bob) = pair(AutoDecision::accept()).await;
    alice
        .handle
        .start_call()
        .await
        .unwrap()
        .established()
        .await
        .unwrap();

    bob.handle.shutdown().await.unwrap();

    wait_state(&alice.handle, CallState::Idle).await;
    wait_presence(&alice.handle, false).await;
    assert_eq!(
        alice.handle.start_call().await.unwrap_err(),
        CallError::PeerAbsent
    );
}

#[tokio::test]
async fn test_chat_between_controllers() {
    let (alice, bob) = pair(AutoDecision::accept()).await;
    let mut inbox = bob.handle.event_bus().chat.subscribe();

    alice.handle.send_message("ready?").await.unwrap();
    let message = inbox.recv().await.unwrap();
    assert_eq!(message.content, "ready?");
    assert_eq!(message.from.as_str(), "1001");
}

/// Picks up after a fixed pause.
struct SlowPickup(Duration);

#[async_trait]
impl IncomingCallDecider for SlowPickup {
    async fn decide(&self, _from: &UserId) -> Decision {
        tokio::time::sleep(self.0).await;
        Decision::Accept
    }
}

#[tokio::test]
async fn test_callee_may_ring_longer_than_the_connect_timeout() {
    let relay = MemoryRelay::new();
    let config = |id: &str| CallControllerConfig {
        connect_timeout: Duration::from_millis(300),
        ring_timeout: Duration::from_millis(1000),
        ..CallControllerConfig::new(id)
    };
    let alice = CallController::builder(config("1001"))
        .with_engine_factory(LoopbackEngineFactory::default())
        .with_audio_source(SilentAudioSource::new())
        .build(&relay.factory(Side::A))
        .await
        .unwrap();
    let bob = CallController::builder(config("2002"))
        .with_engine_factory(LoopbackEngineFactory::default())
        .with_audio_source(SilentAudioSource::new())
        .with_decider(SlowPickup(Duration::from_millis(600)))
        .build(&relay.factory(Side::B))
        .await
        .unwrap();
    wait_presence(&alice, true).await;
    wait_presence(&bob, true).await;

    let attempt = alice.start_call().await.unwrap();
    assert_eq!(attempt.established().await, Ok(()));
    wait_state(&bob, CallState::Active).await;
}
