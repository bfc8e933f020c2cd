//! A negotiation engine that never touches the network.
//!
//! It produces well-formed but synthetic session descriptions, emits one host
//! candidate per local description and, in [`LoopbackMode::AutoConnect`],
//! reports `connected` as soon as both descriptions are in place. Tests use
//! [`LoopbackMode::Manual`] to drive connectivity themselves, and can stall
//! or fail individual operations through the factory.

use async_trait::async_trait;
use callcore::{IceCandidate, SdpType, SessionDescription};
use log::{debug, trace};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use super::audio::AudioCapture;
use super::engine::{Connectivity, EngineError, EngineEvent, EngineFactory, NegotiationEngine};

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopbackMode {
    /// Report `connected` once both descriptions are applied.
    #[default]
    AutoConnect,
    /// Only report what the test asks for via [`LoopbackEngine::report`].
    Manual,
}

/// An operation that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Create,
    CreateOffer,
    CreateAnswer,
    SetRemote,
    AddCandidate,
}

struct FactoryShared {
    mode: LoopbackMode,
    engines: Mutex<Vec<Arc<LoopbackEngine>>>,
    closed: AtomicUsize,
    versions: AtomicU64,
    fail_next: Mutex<Option<FailPoint>>,
    stall: watch::Sender<bool>,
}

impl FactoryShared {
    fn take_failure(&self, point: FailPoint) -> bool {
        let Ok(mut slot) = self.fail_next.lock() else {
            return false;
        };
        if *slot == Some(point) {
            *slot = None;
            true
        } else {
            false
        }
    }

    async fn wait_unstalled(&self) {
        let mut rx = self.stall.subscribe();
        let _ = rx.wait_for(|stalled| !*stalled).await;
    }
}

/// Hands out [`LoopbackEngine`]s and keeps them around for inspection.
#[derive(Clone)]
pub struct LoopbackEngineFactory {
    shared: Arc<FactoryShared>,
}

impl Default for LoopbackEngineFactory {
    fn default() -> Self {
        Self::new(LoopbackMode::default())
    }
}

impl LoopbackEngineFactory {
    pub fn new(mode: LoopbackMode) -> Self {
        let (stall, _) = watch::channel(false);
        Self {
            shared: Arc::new(FactoryShared {
                mode,
                engines: Mutex::new(Vec::new()),
                closed: AtomicUsize::new(0),
                versions: AtomicU64::new(0),
                fail_next: Mutex::new(None),
                stall,
            }),
        }
    }

    pub fn manual() -> Self {
        Self::new(LoopbackMode::Manual)
    }

    /// Every engine created so far, oldest first.
    pub fn engines(&self) -> Vec<Arc<LoopbackEngine>> {
        self.shared
            .engines
            .lock()
            .map(|engines| engines.clone())
            .unwrap_or_default()
    }

    pub fn latest(&self) -> Option<Arc<LoopbackEngine>> {
        self.engines().pop()
    }

    pub fn created_count(&self) -> usize {
        self.engines().len()
    }

    pub fn close_count(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Makes the next operation of the given kind fail.
    pub fn fail_next(&self, point: FailPoint) {
        if let Ok(mut slot) = self.shared.fail_next.lock() {
            *slot = Some(point);
        }
    }

    /// While stalled, answer generation blocks.
    pub fn set_stalled(&self, stalled: bool) {
        self.shared.stall.send_replace(stalled);
    }
}

#[async_trait]
impl EngineFactory for LoopbackEngineFactory {
    async fn create_engine(
        &self,
        audio: Arc<dyn AudioCapture>,
    ) -> Result<(Arc<dyn NegotiationEngine>, mpsc::Receiver<EngineEvent>), EngineError> {
        if self.shared.take_failure(FailPoint::Create) {
            return Err(EngineError::Other("injected create failure".into()));
        }
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let engine = {
            let mut engines = self
                .shared
                .engines
                .lock()
                .map_err(|_| EngineError::Other("engine registry poisoned".into()))?;
            let engine = Arc::new(LoopbackEngine {
                id: engines.len() as u64 + 1,
                audio_label: audio.label().to_string(),
                shared: self.shared.clone(),
                events,
                state: Mutex::new(EngineState::default()),
            });
            engines.push(engine.clone());
            engine
        };
        debug!("Loopback engine #{} created", engine.id);
        Ok((engine, rx))
    }
}

#[derive(Default)]
struct EngineState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    buffered: Vec<IceCandidate>,
    applied: Vec<IceCandidate>,
    connected: bool,
    closed: bool,
}

pub struct LoopbackEngine {
    id: u64,
    audio_label: String,
    shared: Arc<FactoryShared>,
    events: mpsc::Sender<EngineEvent>,
    state: Mutex<EngineState>,
}

impl LoopbackEngine {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed).unwrap_or(true)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.with_state(|s| s.local.clone()).flatten()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.with_state(|s| s.remote.clone()).flatten()
    }

    /// Candidates handed to the media layer, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.with_state(|s| s.applied.clone()).unwrap_or_default()
    }

    /// Candidates still waiting for a remote description.
    pub fn buffered_candidates(&self) -> Vec<IceCandidate> {
        self.with_state(|s| s.buffered.clone()).unwrap_or_default()
    }

    /// Emits a connectivity report as if the media layer produced it.
    pub async fn report(&self, connectivity: Connectivity) {
        let _ = self
            .events
            .send(EngineEvent::Connectivity(connectivity))
            .await;
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut EngineState) -> T) -> Option<T> {
        self.state.lock().ok().map(|mut state| f(&mut state))
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        match self.with_state(|s| s.closed) {
            Some(false) => Ok(()),
            _ => Err(EngineError::Closed),
        }
    }

    fn render_sdp(&self, kind: SdpType) -> String {
        let version = self.shared.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let setup = match kind {
            SdpType::Offer => "actpass",
            SdpType::Answer => "active",
        };
        format!(
            "v=0\r\n\
             o=- {id} {version} IN IP4 127.0.0.1\r\n\
             s=-\r\n\
             t=0 0\r\n\
             a=group:BUNDLE 0\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=mid:0\r\n\
             a=ice-ufrag:{ufrag}\r\n\
             a=setup:{setup}\r\n\
             a=sendrecv\r\n\
             a=rtpmap:111 opus/48000/2\r\n\
             a=msid:{label} audio\r\n",
            id = self.id,
            ufrag = self.ufrag(),
            label = self.audio_label,
        )
    }

    fn ufrag(&self) -> String {
        format!("loop{}", self.id)
    }

    fn host_candidate(&self) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{id} 1 udp 2130706431 127.0.0.1 {port} typ host",
            id = self.id,
            port = 50_000 + self.id,
        ))
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0)
        .with_username_fragment(self.ufrag())
    }

    async fn maybe_connect(&self) {
        if self.shared.mode != LoopbackMode::AutoConnect {
            return;
        }
        let ready = self
            .with_state(|s| {
                let ready = !s.closed && !s.connected && s.local.is_some() && s.remote.is_some();
                if ready {
                    s.connected = true;
                }
                ready
            })
            .unwrap_or(false);
        if ready {
            debug!("Loopback engine #{} connected", self.id);
            self.report(Connectivity::Connected).await;
        }
    }
}

#[async_trait]
impl NegotiationEngine for LoopbackEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        if self.shared.take_failure(FailPoint::CreateOffer) {
            return Err(EngineError::Description("injected offer failure".into()));
        }
        Ok(SessionDescription::offer(self.render_sdp(SdpType::Offer)))
    }

    async fn create_answer(
        &self,
        remote_offer: &SessionDescription,
    ) -> Result<SessionDescription, EngineError> {
        self.shared.wait_unstalled().await;
        self.ensure_open()?;
        if remote_offer.kind != SdpType::Offer {
            return Err(EngineError::Description(
                "cannot answer a non-offer description".into(),
            ));
        }
        if self.shared.take_failure(FailPoint::CreateAnswer) {
            return Err(EngineError::Description("injected answer failure".into()));
        }
        Ok(SessionDescription::answer(self.render_sdp(SdpType::Answer)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.with_state(|s| s.local = Some(description));
        let _ = self
            .events
            .send(EngineEvent::Connectivity(Connectivity::Connecting))
            .await;
        let _ = self
            .events
            .send(EngineEvent::LocalCandidate(self.host_candidate()))
            .await;
        self.maybe_connect().await;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.shared.take_failure(FailPoint::SetRemote) {
            return Err(EngineError::Description("injected remote failure".into()));
        }
        self.with_state(|s| {
            s.remote = Some(description);
            let buffered = std::mem::take(&mut s.buffered);
            s.applied.extend(buffered);
        });
        self.maybe_connect().await;
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.shared.take_failure(FailPoint::AddCandidate) {
            return Err(EngineError::Candidate("injected candidate failure".into()));
        }
        // An empty candidate marks end-of-candidates.
        if !candidate.candidate.is_empty() && !candidate.candidate.starts_with("candidate:") {
            return Err(EngineError::Candidate(format!(
                "malformed candidate line '{}'",
                candidate.candidate
            )));
        }
        self.with_state(|s| {
            if s.remote.is_some() {
                s.applied.push(candidate);
            } else {
                trace!("Buffering candidate until remote description arrives");
                s.buffered.push(candidate);
            }
        });
        Ok(())
    }

    async fn close(&self) {
        let first = self
            .with_state(|s| !std::mem::replace(&mut s.closed, true))
            .unwrap_or(false);
        if first {
            self.shared.closed.fetch_add(1, Ordering::SeqCst);
            debug!("Loopback engine #{} closed", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::audio::{AudioSource, SilentAudioSource};

    async fn engine(
        factory: &LoopbackEngineFactory,
    ) -> (Arc<dyn NegotiationEngine>, mpsc::Receiver<EngineEvent>) {
        let audio = SilentAudioSource::new().acquire().await.unwrap();
        factory.create_engine(audio).await.unwrap()
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_engines() {
        let factory = LoopbackEngineFactory::default();
        let (caller, mut caller_events) = engine(&factory).await;
        let (callee, mut callee_events) = engine(&factory).await;

        let offer = caller.create_offer().await.unwrap();
        caller.set_local_description(offer.clone()).await.unwrap();
        callee.set_remote_description(offer.clone()).await.unwrap();
        let answer = callee.create_answer(&offer).await.unwrap();
        callee.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        for events in [&mut caller_events, &mut callee_events] {
            let mut connected = false;
            while let Ok(event) = events.try_recv() {
                if event == EngineEvent::Connectivity(Connectivity::Connected) {
                    connected = true;
                }
            }
            assert!(connected);
        }
    }

    #[tokio::test]
    async fn test_descriptions_are_freshly_versioned() {
        let factory = LoopbackEngineFactory::default();
        let (engine, _events) = engine(&factory).await;
        let first = engine.create_offer().await.unwrap();
        let second = engine.create_offer().await.unwrap();
        assert_ne!(first.sdp, second.sdp);
        assert!(first.sdp.starts_with("v=0\r\n"));
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_remote_description() {
        let factory = LoopbackEngineFactory::manual();
        let (engine, _events) = engine(&factory).await;
        let inspect = factory.latest().unwrap();

        let candidate = IceCandidate::new("candidate:9 1 udp 1 10.0.0.1 9 typ host");
        engine.add_candidate(candidate.clone()).await.unwrap();
        assert_eq!(inspect.buffered_candidates(), vec![candidate.clone()]);
        assert!(inspect.applied_candidates().is_empty());

        engine
            .set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        assert_eq!(inspect.applied_candidates(), vec![candidate]);
        assert!(inspect.buffered_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_manual_mode_never_connects_on_its_own() {
        let factory = LoopbackEngineFactory::manual();
        let (engine, mut events) = engine(&factory).await;
        let offer = engine.create_offer().await.unwrap();
        engine.set_local_description(offer).await.unwrap();
        engine
            .set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();

        while let Ok(event) = events.try_recv() {
            assert_ne!(event, EngineEvent::Connectivity(Connectivity::Connected));
        }
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let factory = LoopbackEngineFactory::default();
        let (engine, _events) = engine(&factory).await;

        factory.fail_next(FailPoint::CreateOffer);
        assert!(matches!(
            engine.create_offer().await,
            Err(EngineError::Description(_))
        ));
        assert!(engine.create_offer().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_counts_once_and_rejects_later_work() {
        let factory = LoopbackEngineFactory::default();
        let (engine, _events) = engine(&factory).await;

        engine.close().await;
        engine.close().await;

        assert_eq!(factory.close_count(), 1);
        assert_eq!(engine.create_offer().await, Err(EngineError::Closed));
    }
}
