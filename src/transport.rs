//! The seam between the connection manager and a native peer connection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::error::TransportError;
use crate::media::{LocalTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP offer or answer as carried over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Native connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// The live `webrtc` track; absent for transports that carry no media.
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    IceCandidate(IceCandidate),
    Track(RemoteTrack),
    StateChanged(TransportState),
}

/// Inbound video counters, cumulative since the link connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundVideoStats {
    pub packets_received: u64,
    pub packets_lost: u64,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates an offer and sets it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Creates an answer and sets it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn has_local_description(&self) -> bool;

    /// Swaps the track on the outbound video sender without renegotiating.
    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError>;

    /// Ids of the tracks currently being sent.
    async fn outbound_track_ids(&self) -> Vec<String>;

    async fn inbound_video_stats(&self) -> Option<InboundVideoStats>;

    async fn close(&self) -> Result<(), TransportError>;
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Opens native peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Opens a connection to `remote_user_id` sending `tracks`. Low-level
    /// events are delivered on `events` until the transport is closed.
    async fn connect(
        &self,
        remote_user_id: &str,
        tracks: &[Arc<LocalTrack>],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
