use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::media::LocalStream;
use crate::signaling::MediaState;
use crate::transport::RemoteTrack;

/// Media received from one remote participant, grown track by track.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn new(first: RemoteTrack) -> Self {
        Self {
            id: first.stream_id.clone(),
            tracks: vec![first],
        }
    }

    /// Adds `track` unless a track with the same id is already present.
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }
}

#[derive(Debug, Clone)]
pub enum StreamHandle {
    Local(Arc<LocalStream>),
    Remote(RemoteStream),
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: String,
    pub stream: Option<StreamHandle>,
    pub is_muted: bool,
    pub is_video_on: bool,
    pub is_screen_sharing: bool,
    pub is_local: bool,
}

impl Participant {
    pub fn remote(user_id: impl Into<String>) -> Self {
        let state = MediaState::default();
        Self {
            user_id: user_id.into(),
            stream: None,
            is_muted: state.is_muted,
            is_video_on: state.is_video_on,
            is_screen_sharing: state.is_screen_sharing,
            is_local: false,
        }
    }

    pub fn local(user_id: impl Into<String>, stream: Arc<LocalStream>) -> Self {
        Self {
            stream: Some(StreamHandle::Local(stream)),
            is_local: true,
            ..Self::remote(user_id)
        }
    }

    pub fn media_state(&self) -> MediaState {
        MediaState {
            is_muted: self.is_muted,
            is_video_on: self.is_video_on,
            is_screen_sharing: self.is_screen_sharing,
        }
    }

    pub fn apply_media_state(&mut self, state: MediaState) {
        self.is_muted = state.is_muted;
        self.is_video_on = state.is_video_on;
        self.is_screen_sharing = state.is_screen_sharing;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub user_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn now(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Everyone currently considered in the call, keyed by user id.
#[derive(Debug, Default)]
pub struct Roster {
    participants: BTreeMap<String, Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `participant` unless its user id is already present.
    pub fn add(&mut self, participant: Participant) -> bool {
        if self.participants.contains_key(&participant.user_id) {
            return false;
        }
        self.participants
            .insert(participant.user_id.clone(), participant);
        true
    }

    pub fn remove(&mut self, user_id: &str) -> Option<Participant> {
        self.participants.remove(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn get_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.get_mut(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }
}
