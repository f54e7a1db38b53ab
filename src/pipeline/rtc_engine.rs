//! Media engine backed by webrtc-rs

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::signaling::IceCandidateRecord;

use super::error::PipelineError;
use super::events::PipelineEvents;
use super::router::{IncomingStream, StreamDescriptor};
use super::{ConnectivityState, MediaEngine, MediaKind, MediaSession, PipelineSpec, TrackSpec};

/// Payload queue depth per remote track
const REMOTE_TRACK_CAPACITY: usize = 256;

/// Receives each local track once it is attached, so a capture source can feed it
pub type TrackPublisher = Arc<dyn Fn(&TrackSpec, Arc<TrackLocalStaticSample>) + Send + Sync>;

fn engine_err(e: webrtc::Error) -> PipelineError {
    PipelineError::Engine(e.to_string())
}

/// [`MediaEngine`] that runs one `RTCPeerConnection` per session
#[derive(Default, Clone)]
pub struct WebRtcEngine {
    publisher: Option<TrackPublisher>,
}

impl WebRtcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand every local track to `publisher` after it is added
    pub fn with_publisher(mut self, publisher: TrackPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn start(
        &self,
        spec: &PipelineSpec,
        events: Arc<dyn PipelineEvents>,
    ) -> Result<Box<dyn MediaSession>, PipelineError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PipelineError::Start(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PipelineError::Start(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: spec
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PipelineError::Start(e.to_string()))?,
        );

        // Handlers go in before any track so no notification is missed
        register_handlers(&pc, events);

        for track in &spec.tracks {
            add_local_track(&pc, track, self.publisher.as_ref()).await?;
        }

        info!(
            "Peer connection ready with {} local track(s)",
            spec.tracks.len()
        );
        Ok(Box::new(WebRtcSession { pc }))
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, events: Arc<dyn PipelineEvents>) {
    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        sink.on_negotiation_needed();
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => sink.on_ice_candidate(
                    u32::from(init.sdp_mline_index.unwrap_or(0)),
                    init.candidate,
                ),
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            }
        } else {
            debug!("Local candidate gathering complete");
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        if let Some(state) = connectivity_from(state) {
            sink.on_state_changed(state);
        }
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let descriptor = StreamDescriptor {
                kind,
                track_id: track.id(),
                codec: track.codec().capability.mime_type,
            };
            let (tx, payloads) = mpsc::channel(REMOTE_TRACK_CAPACITY);
            sink.on_incoming_stream(IncomingStream {
                descriptor,
                payloads,
            });

            tokio::spawn(async move {
                while let Ok((packet, _)) = track.read_rtp().await {
                    match tx.try_send(packet.payload) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            trace!("Consumer behind, dropping remote packet");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                debug!("Remote track {} finished", track.id());
            });
            Box::pin(async {})
        },
    ));
}

async fn add_local_track(
    pc: &Arc<RTCPeerConnection>,
    spec: &TrackSpec,
    publisher: Option<&TrackPublisher>,
) -> Result<(), PipelineError> {
    let codec = RTCRtpCodecCapability {
        mime_type: spec.mime_type.clone(),
        clock_rate: spec.clock_rate,
        channels: spec.channels,
        ..Default::default()
    };
    let track = Arc::new(TrackLocalStaticSample::new(
        codec,
        spec.id.clone(),
        spec.stream_id.clone(),
    ));

    let sender = pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| PipelineError::Start(e.to_string()))?;

    // RTCP has to be read for the interceptors to run
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });

    debug!("Added local {} track {}", spec.kind, spec.id);
    if let Some(publisher) = publisher {
        publisher(spec, track);
    }
    Ok(())
}

fn connectivity_from(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectivityState::New),
        RTCIceConnectionState::Checking => Some(ConnectivityState::Checking),
        RTCIceConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCIceConnectionState::Completed => Some(ConnectivityState::Completed),
        RTCIceConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCIceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCIceConnectionState::Closed => Some(ConnectivityState::Closed),
        _ => None,
    }
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn create_offer(&self) -> Result<String, PipelineError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_err)?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<(), PipelineError> {
        let offer = RTCSessionDescription::offer(sdp.to_string()).map_err(engine_err)?;
        self.pc.set_local_description(offer).await.map_err(engine_err)
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), PipelineError> {
        let answer = RTCSessionDescription::answer(sdp.to_string()).map_err(engine_err)?;
        self.pc.set_remote_description(answer).await.map_err(engine_err)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateRecord) -> Result<(), PipelineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mline_index: u16::try_from(candidate.sdp_mline_index).ok(),
            ..Default::default()
        };
        self.pc.add_ice_candidate(init).await.map_err(engine_err)
    }

    async fn stop(&self) -> Result<(), PipelineError> {
        self.pc.close().await.map_err(engine_err)
    }
}
