use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::connection::LinkState;

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The call cannot start or continue.
    Fatal,
    /// Confined to one remote participant's link.
    Link,
    /// A local control action was refused; prior state is kept.
    Control,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("permission to capture {0} was denied")]
    PermissionDenied(&'static str),

    #[error("screen capture cancelled")]
    ScreenCaptureCancelled,

    #[error("media track error: {0}")]
    Track(String),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("malformed signaling message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("join rejected: {0}")]
    Rejected(String),

    #[error("signaling channel closed")]
    Closed,

    #[error("not joined to a meeting")]
    NotJoined,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("no outbound video sender on this link")]
    NoVideoSender,

    #[error("peer connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("local media unavailable: {0}")]
    LocalMedia(#[source] MediaError),

    #[error("could not join meeting {meeting_id}: {source}")]
    Join {
        meeting_id: String,
        #[source]
        source: SignalingError,
    },

    #[error("local stream is not initialized")]
    LocalStreamMissing,

    #[error("screen share failed: {0}")]
    ScreenShare(#[source] MediaError),

    #[error("no peer link for {0}")]
    UnknownPeer(String),

    #[error("negotiation with {user_id} failed: {source}")]
    Negotiation {
        user_id: String,
        #[source]
        source: TransportError,
    },

    #[error("could not add ICE candidate from {user_id}: {source}")]
    IceCandidate {
        user_id: String,
        #[source]
        source: TransportError,
    },

    #[error("could not switch outbound video for {user_id}: {source}")]
    TrackReplace {
        user_id: String,
        #[source]
        source: TransportError,
    },

    #[error("connection to {user_id} lost ({state})")]
    ConnectionLost { user_id: String, state: LinkState },

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("no active call")]
    NotInCall,

    #[error("already in a call")]
    AlreadyInCall,
}

impl CallError {
    pub fn severity(&self) -> Severity {
        match self {
            CallError::LocalMedia(_) | CallError::Join { .. } | CallError::AlreadyInCall => {
                Severity::Fatal
            }
            CallError::Negotiation { .. }
            | CallError::IceCandidate { .. }
            | CallError::TrackReplace { .. }
            | CallError::ConnectionLost { .. }
            | CallError::UnknownPeer(_)
            | CallError::Signaling(_) => Severity::Link,
            CallError::LocalStreamMissing | CallError::ScreenShare(_) | CallError::NotInCall => {
                Severity::Control
            }
        }
    }

    /// Link failures after which the remote is treated as having left.
    pub fn drops_peer(&self) -> bool {
        matches!(
            self,
            CallError::Negotiation { .. } | CallError::ConnectionLost { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
