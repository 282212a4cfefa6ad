//! Signaling contract: join/leave, offer/answer/ICE relay, chat and media
//! state, carried as JSON objects tagged by `type`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::transport::{IceCandidate, SessionDescription};

pub mod memory;
pub mod websocket;

pub use memory::{HubClient, SignalingHub};
pub use websocket::WsSignalingChannel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundSignal {
    #[serde(rename_all = "camelCase")]
    JoinMeeting { meeting_id: String, user_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveMeeting { meeting_id: String, user_id: String },
    #[serde(rename_all = "camelCase")]
    Offer {
        meeting_id: String,
        to: String,
        offer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        meeting_id: String,
        to: String,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        meeting_id: String,
        to: String,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    Message { meeting_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    MediaState {
        meeting_id: String,
        user_id: String,
        #[serde(flatten)]
        state: MediaState,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundSignal {
    #[serde(rename_all = "camelCase")]
    ParticipantJoined { user_id: String },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { user_id: String },
    Offer {
        from: String,
        offer: SessionDescription,
    },
    Answer {
        from: String,
        answer: SessionDescription,
    },
    IceCandidate {
        from: String,
        candidate: IceCandidate,
    },
    Message { from: String, message: String },
    ParticipantState {
        from: String,
        #[serde(flatten)]
        state: MediaState,
    },
}

/// A participant's announced capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub is_muted: bool,
    pub is_video_on: bool,
    pub is_screen_sharing: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            is_muted: false,
            is_video_on: true,
            is_screen_sharing: false,
        }
    }
}

/// Server acknowledgement of a join: who was already in the meeting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAck {
    pub participants: Vec<String>,
}

/// A duplex, call-scoped signaling conversation.
///
/// Delivery is assumed at-least-once and in order per sender.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Announces the join and waits for the server's acknowledgement.
    async fn join(&self, meeting_id: &str, user_id: &str) -> Result<JoinAck, SignalingError>;

    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError>;

    /// Installs the single inbound listener, replacing any previous one.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundSignal>;

    /// Drops the inbound listener installed by `subscribe`.
    fn detach(&self);
}
