//! Negotiation engine backed by the `webrtc` crate.
//!
//! Only negotiation and connectivity are wired up. The local audio track is
//! attached so the descriptions advertise audio, but feeding it samples is
//! left to whoever owns the capture device.

use async_trait::async_trait;
use callcore::{IceCandidate, SdpType, SessionDescription};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::audio::AudioCapture;
use super::engine::{Connectivity, EngineError, EngineEvent, EngineFactory, NegotiationEngine};

const EVENT_CAPACITY: usize = 64;

fn other(e: webrtc::Error) -> EngineError {
    EngineError::Other(e.to_string())
}

fn description_error(e: webrtc::Error) -> EngineError {
    EngineError::Description(e.to_string())
}

/// Creates one `RTCPeerConnection` per call.
#[derive(Debug, Clone)]
pub struct WebRtcEngineFactory {
    ice_servers: Vec<String>,
}

impl Default for WebRtcEngineFactory {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
        }
    }
}

impl WebRtcEngineFactory {
    pub fn with_ice_servers(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    async fn peer_connection(&self) -> Result<RTCPeerConnection, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(other)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(other)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        api.new_peer_connection(config).await.map_err(other)
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create_engine(
        &self,
        audio: Arc<dyn AudioCapture>,
    ) -> Result<(Arc<dyn NegotiationEngine>, mpsc::Receiver<EngineEvent>), EngineError> {
        let pc = Arc::new(self.peer_connection().await?);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            audio.label().to_owned(),
        ));
        pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(other)?;

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);

        let candidates = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("Candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        let _ = tx.send(EngineEvent::LocalCandidate(candidate)).await;
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {e}"),
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Peer connection state: {state}");
                let connectivity = match state {
                    RTCPeerConnectionState::Connecting => Connectivity::Connecting,
                    RTCPeerConnectionState::Connected => Connectivity::Connected,
                    RTCPeerConnectionState::Failed => Connectivity::Failed,
                    RTCPeerConnectionState::Closed => Connectivity::Closed,
                    _ => return,
                };
                let _ = tx.send(EngineEvent::Connectivity(connectivity)).await;
            })
        }));

        Ok((Arc::new(WebRtcEngine { pc }), rx))
    }
}

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(description_error)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(EngineError::Description(format!(
            "unsupported description type {other}"
        ))),
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(description_error)?;
        from_rtc(offer)
    }

    async fn create_answer(
        &self,
        _remote_offer: &SessionDescription,
    ) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(description_error)?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(description_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(description_error)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::Candidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {e}");
        }
    }
}
