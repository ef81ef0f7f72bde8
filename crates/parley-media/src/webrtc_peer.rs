//! Production media backend: cpal capture plus a webrtc-rs peer connection
//! carrying one audio transceiver.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use parley_shared::constants::DEFAULT_STUN_SERVER;
use parley_shared::protocol::IceCandidate;

use crate::audio::{AudioCapture, AudioConfig};
use crate::error::MediaError;
use crate::media::{LocalMedia, MediaBackend, PeerEvent, PeerEvents, PeerLink, RemoteMedia, SdpKind};

pub struct WebRtcBackend {
    ice_servers: Vec<String>,
    audio: AudioConfig,
}

impl WebRtcBackend {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            audio: AudioConfig::default(),
        }
    }

    pub fn with_audio(mut self, audio: AudioConfig) -> Self {
        self.audio = audio;
        self
    }
}

impl Default for WebRtcBackend {
    fn default() -> Self {
        Self::new(vec![DEFAULT_STUN_SERVER.to_string()])
    }
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn acquire_local_audio(&self) -> Result<Box<dyn LocalMedia>, MediaError> {
        let config = self.audio.clone();
        let capture = tokio::task::spawn_blocking(move || AudioCapture::start(&config))
            .await
            .map_err(|e| MediaError::Device(e.to_string()))??;
        Ok(Box::new(capture))
    }

    async fn create_peer(&self, events: PeerEvents) -> Result<Box<dyn PeerLink>, MediaError> {
        let peer = WebRtcPeer::connect(&self.ice_servers, events).await?;
        Ok(Box::new(peer))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    pub async fn connect(ice_servers: &[String], events: PeerEvents) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await?;

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(e) => warn!(error = %e, "Unencodable local candidate"),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(state = %state, "Peer connection state changed");
            let event = match state {
                RTCPeerConnectionState::Connected => Some(PeerEvent::Connected),
                RTCPeerConnectionState::Disconnected => Some(PeerEvent::Disconnected),
                RTCPeerConnectionState::Failed => Some(PeerEvent::Failed),
                _ => None,
            };
            if let Some(event) = event {
                state_events.emit(event);
            }
            Box::pin(async {})
        }));

        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                events.emit(PeerEvent::RemoteTrack(RemoteMedia {
                    track_id: track.id(),
                }));
                Box::pin(async {})
            },
        ));

        Ok(Self { pc })
    }
}

#[async_trait]
impl PeerLink for WebRtcPeer {
    async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), MediaError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
        };
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Peer connection did not close cleanly");
        }
    }
}
