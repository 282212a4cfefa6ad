use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_remote::TrackRemote;

use crate::config::Config;
use crate::error::TransportError;
use crate::media::{LocalTrack, TrackKind};
use crate::transport::{
    IceCandidate, InboundVideoStats, PeerConnector, PeerTransport, RemoteTrack, SdpType,
    SessionDescription, TransportEvent, TransportEvents, TransportState,
};

/// Opens `webrtc-rs` peer connections configured with the call's ICE servers.
pub struct RtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcConnector {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // NACKs, RTCP reports and the stats the quality sampler reads
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers(),
        })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        remote_user_id: &str,
        tracks: &[Arc<LocalTrack>],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);

        let mut video_sender = None;
        let mut outbound = Vec::with_capacity(tracks.len());
        let mut rtcp_readers = Vec::with_capacity(tracks.len());
        for track in tracks {
            let sender = peer_connection.add_track(track.rtc_track()).await?;

            // RTCP has to be drained for the interceptors (NACK, reports) to run
            let reader = Arc::clone(&sender);
            rtcp_readers.push(tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while reader.read(&mut rtcp_buf).await.is_ok() {}
            }));

            if track.kind() == TrackKind::Video && video_sender.is_none() {
                video_sender = Some(sender);
            }
            outbound.push((track.kind(), track.id().to_owned()));
        }

        let tx = events.clone();
        let remote = remote_user_id.to_owned();
        peer_connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            if let Some(candidate) = c {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::IceCandidate(init.into()));
                    }
                    Err(e) => warn!(user_id = %remote, "failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let _ = tx.send(TransportEvent::Track(RemoteTrack {
                        id: track.id().to_string(),
                        stream_id: track.stream_id().to_string(),
                        kind,
                        track: Some(track),
                    }));
                }
                Box::pin(async {})
            },
        ));

        let tx = events.clone();
        let remote = remote_user_id.to_owned();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                info!(user_id = %remote, "peer connection state has changed: {s}");
                let state = match s {
                    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                        TransportState::New
                    }
                    RTCPeerConnectionState::Connecting => TransportState::Connecting,
                    RTCPeerConnectionState::Connected => TransportState::Connected,
                    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                    RTCPeerConnectionState::Failed => TransportState::Failed,
                    RTCPeerConnectionState::Closed => TransportState::Closed,
                };
                let _ = tx.send(TransportEvent::StateChanged(state));
                Box::pin(async {})
            },
        ));

        let tx = events;
        let remote = remote_user_id.to_owned();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |s: RTCIceConnectionState| {
                debug!(user_id = %remote, "ICE connection state has changed: {s}");
                if s == RTCIceConnectionState::Failed {
                    let _ = tx.send(TransportEvent::StateChanged(TransportState::Failed));
                }
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(RtcTransport {
            peer_connection,
            video_sender,
            outbound: Mutex::new(outbound),
            rtcp_readers: Mutex::new(rtcp_readers),
        }))
    }
}

struct RtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    video_sender: Option<Arc<RTCRtpSender>>,
    outbound: Mutex<Vec<(TrackKind, String)>>,
    rtcp_readers: Mutex<Vec<JoinHandle<()>>>,
}

impl RtcTransport {
    fn stop_rtcp_readers(&self) {
        for handle in self.rtcp_readers.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for RtcTransport {
    fn drop(&mut self) {
        self.stop_rtcp_readers();
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.peer_connection.create_offer(None).await?;
        // Note: this starts ICE candidate gathering
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let parsed = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.peer_connection.set_remote_description(parsed).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await?;
        Ok(())
    }

    async fn has_local_description(&self) -> bool {
        self.peer_connection.local_description().await.is_some()
    }

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        let sender = self
            .video_sender
            .as_ref()
            .ok_or(TransportError::NoVideoSender)?;
        sender.replace_track(Some(track.rtc_track())).await?;

        let mut outbound = self.outbound.lock();
        outbound.retain(|(kind, _)| *kind != TrackKind::Video);
        outbound.push((TrackKind::Video, track.id().to_owned()));
        Ok(())
    }

    async fn outbound_track_ids(&self) -> Vec<String> {
        self.outbound
            .lock()
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }

    async fn inbound_video_stats(&self) -> Option<InboundVideoStats> {
        let report = self.peer_connection.get_stats().await;
        let mut stats: Option<InboundVideoStats> = None;
        for entry in report.reports.values() {
            if let StatsReportType::InboundRTP(inbound) = entry {
                if inbound.kind == "video" {
                    let totals = stats.get_or_insert_with(InboundVideoStats::default);
                    totals.packets_received += inbound.packets_received;
                    // every NACKed sequence number is a packet that went missing
                    totals.packets_lost += inbound.nack_count;
                }
            }
        }
        stats
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.stop_rtcp_readers();
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}
