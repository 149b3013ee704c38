//! webrtc-rs backed transport.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectionState, IceConfiguration, IceTransportPolicy, PeerEvent, PeerEventSender, PeerHandle,
    PeerTransport, RemoteTrackInfo, SdpKind, SessionDescription, TransportConfig, TransportError,
    TransportFactory,
};
use crate::media::{LocalMedia, TrackKind};
use crate::path::{PathController, StatsPathController};
use crate::protocol::{CandidateInit, IceCandidate};

#[derive(Debug, Clone, Default)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

pub fn rtc_configuration(ice: &IceConfiguration) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ice_transport_policy: match ice.ice_transport_policy {
            Some(IceTransportPolicy::Relay) => RTCIceTransportPolicy::Relay,
            Some(IceTransportPolicy::All) | None => RTCIceTransportPolicy::All,
        },
        ice_candidate_pool_size: ice.ice_candidate_pool_size.unwrap_or(0),
        ..Default::default()
    }
}

fn connection_state(state: RTCIceConnectionState) -> ConnectionState {
    match state {
        RTCIceConnectionState::Checking => ConnectionState::Checking,
        RTCIceConnectionState::Connected => ConnectionState::Connected,
        RTCIceConnectionState::Completed => ConnectionState::Completed,
        RTCIceConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCIceConnectionState::Failed => ConnectionState::Failed,
        RTCIceConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn local_candidate(candidate: Option<RTCIceCandidate>) -> Option<IceCandidate> {
    let Some(candidate) = candidate else {
        return Some(IceCandidate::EndOfCandidates);
    };
    match candidate.to_json() {
        Ok(init) => Some(IceCandidate::Candidate(CandidateInit {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        })),
        Err(err) => {
            warn!(error = %err, "could not serialize local candidate");
            None
        }
    }
}

fn track_codec(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        label: &str,
        config: &TransportConfig,
        media: Option<&LocalMedia>,
        events: PeerEventSender,
    ) -> Result<PeerHandle, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer = Arc::new(
            api.new_peer_connection(rtc_configuration(&config.ice))
                .await
                .map_err(|err| TransportError::Setup(err.to_string()))?,
        );
        info!(endpoint = label, servers = config.ice.ice_servers.len(), "created peer connection");

        if let Some(media) = media {
            for track in media.tracks() {
                let local: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
                    track_codec(track.kind),
                    track.id.clone(),
                    media.stream_id().to_string(),
                ));
                let sender = peer
                    .add_track(local)
                    .await
                    .map_err(|err| TransportError::Setup(err.to_string()))?;
                // RTCP has to be drained for the interceptors to run.
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while sender.read(&mut buf).await.is_ok() {}
                });
            }
            debug!(endpoint = label, tracks = media.tracks().len(), "added local stream to peer connection");
        }

        let candidate_events = events.clone();
        let endpoint = label.to_string();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            let endpoint = endpoint.clone();
            Box::pin(async move {
                if let Some(candidate) = local_candidate(candidate) {
                    debug!(endpoint = %endpoint, candidate = candidate.describe(), "local ICE candidate");
                    events.emit(PeerEvent::LocalCandidate(candidate));
                }
            })
        }));

        let state_events = events.clone();
        let endpoint = label.to_string();
        peer.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = state_events.clone();
            let endpoint = endpoint.clone();
            Box::pin(async move {
                let state = connection_state(state);
                info!(endpoint = %endpoint, state = %state, "ICE state change");
                events.emit(PeerEvent::ConnectionState(state));
            })
        }));

        let track_events = events;
        let endpoint = label.to_string();
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = if track.kind() == RTPCodecType::Video {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
            let info = RemoteTrackInfo {
                kind,
                track_id: track.id(),
                stream_id: track.stream_id(),
            };
            info!(endpoint = %endpoint, kind = %info.kind, "received remote stream");
            track_events.emit(PeerEvent::RemoteTrack(info));
            Box::pin(async {})
        }));

        let path_controller: Option<Arc<dyn PathController>> = config.path_controller.then(|| {
            Arc::new(StatsPathController::new(
                format!("{label}-stats"),
                Arc::clone(&peer),
                config.stats_interval,
            )) as Arc<dyn PathController>
        });

        Ok(PeerHandle {
            transport: Arc::new(WebRtcPeer {
                label: label.to_string(),
                peer,
            }),
            path_controller,
        })
    }
}

pub struct WebRtcPeer {
    label: String,
    peer: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        let result = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        };
        result.map_err(|err| TransportError::operation("parse description", err))
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer
            .create_offer(None)
            .await
            .map_err(|err| TransportError::operation("createOffer", err))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer
            .create_answer(None)
            .await
            .map_err(|err| TransportError::operation("createAnswer", err))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let description = Self::to_rtc(description)?;
        self.peer
            .set_local_description(description)
            .await
            .map_err(|err| TransportError::operation("setLocalDescription", err))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let description = Self::to_rtc(description)?;
        self.peer
            .set_remote_description(description)
            .await
            .map_err(|err| TransportError::operation("setRemoteDescription", err))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        // An empty candidate string is how webrtc-rs takes end-of-candidates.
        let init = match candidate {
            IceCandidate::Candidate(init) => RTCIceCandidateInit {
                candidate: init.candidate,
                sdp_mid: init.sdp_mid,
                sdp_mline_index: init.sdp_mline_index,
                username_fragment: None,
            },
            IceCandidate::EndOfCandidates => RTCIceCandidateInit::default(),
        };
        self.peer
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::operation("addIceCandidate", err))
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!(endpoint = %self.label, "closing peer connection");
        self.peer
            .close()
            .await
            .map_err(|err| TransportError::operation("close", err))
    }
}
