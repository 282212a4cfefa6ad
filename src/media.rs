//! Local media capture.
//!
//! Capture devices sit behind [`MediaAcquisition`]. Whatever produces the
//! frames, the call layer only ever handles [`LocalTrack`]s: a `webrtc`
//! sample track plus the enabled/stopped flags the control surface flips.
//! Tracks are shared by `Arc` across every peer link that sends them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;

pub const DEFAULT_VIDEO_WIDTH: u32 = 1280;
pub const DEFAULT_VIDEO_HEIGHT: u32 = 720;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// What a local track captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    pub width: u32,
    pub height: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub video_device_id: Option<String>,
    pub audio_device_id: Option<String>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            width: DEFAULT_VIDEO_WIDTH,
            height: DEFAULT_VIDEO_HEIGHT,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            video_device_id: None,
            audio_device_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub kind: TrackKind,
    pub label: String,
}

pub struct LocalTrack {
    source: TrackSource,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(source: TrackSource, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            source,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Forwards a sample to every bound peer. Disabled or stopped tracks drop it.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, MediaError> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(false);
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::Track(e.to_string()))?;
        Ok(true)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn video_track(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks_of(TrackKind::Video).next()
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// A display capture plus the signal fired when the OS revokes it.
pub struct ScreenCapture {
    pub stream: LocalStream,
    pub ended: oneshot::Receiver<()>,
}

#[async_trait]
pub trait MediaAcquisition: Send + Sync {
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;

    async fn display_media(&self) -> Result<ScreenCapture, MediaError>;

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError>;
}

pub fn sample_track(source: TrackSource, stream_id: &str) -> Arc<LocalTrack> {
    let (mime_type, clock_rate, channels) = match source.kind() {
        TrackKind::Audio => (MIME_TYPE_OPUS, 48000, 2),
        TrackKind::Video => (MIME_TYPE_VP8, 90000, 0),
    };
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate,
            channels,
            ..Default::default()
        },
        format!("{}-{}", source_label(source), Uuid::new_v4()),
        stream_id.to_owned(),
    ));
    Arc::new(LocalTrack::new(source, track))
}

fn source_label(source: TrackSource) -> &'static str {
    match source {
        TrackSource::Microphone => "audio",
        TrackSource::Camera => "video",
        TrackSource::Screen => "screen",
    }
}

/// Device-free media: real `webrtc` tracks that nothing writes to unless the
/// caller does. Capture failures and screen revocation can be simulated.
#[derive(Default)]
pub struct SyntheticMedia {
    deny_user_media: AtomicBool,
    deny_display_media: AtomicBool,
    display_requests: AtomicUsize,
    revoke_on_grant: AtomicBool,
    revoke: Mutex<Option<oneshot::Sender<()>>>,
}

impl SyntheticMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_user_media(&self, deny: bool) {
        self.deny_user_media.store(deny, Ordering::SeqCst);
    }

    pub fn deny_display_media(&self, deny: bool) {
        self.deny_display_media.store(deny, Ordering::SeqCst);
    }

    /// Makes the next captures end the moment they are granted.
    pub fn revoke_on_grant(&self, revoke: bool) {
        self.revoke_on_grant.store(revoke, Ordering::SeqCst);
    }

    /// How many times a screen capture was asked for.
    pub fn display_requests(&self) -> usize {
        self.display_requests.load(Ordering::SeqCst)
    }

    /// Ends the current screen capture as if the user stopped it from the OS.
    pub fn revoke_screen(&self) -> bool {
        match self.revoke.lock().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl MediaAcquisition for SyntheticMedia {
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        if self.deny_user_media.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("camera and microphone"));
        }
        let stream_id = format!("local-{}", Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(sample_track(TrackSource::Microphone, &stream_id));
        }
        if constraints.video {
            tracks.push(sample_track(TrackSource::Camera, &stream_id));
        }
        if tracks.is_empty() {
            return Err(MediaError::DeviceUnavailable(
                "neither audio nor video requested".to_owned(),
            ));
        }
        Ok(LocalStream::new(stream_id, tracks))
    }

    async fn display_media(&self) -> Result<ScreenCapture, MediaError> {
        self.display_requests.fetch_add(1, Ordering::SeqCst);
        // the picker answers asynchronously
        tokio::task::yield_now().await;
        if self.deny_display_media.load(Ordering::SeqCst) {
            return Err(MediaError::ScreenCaptureCancelled);
        }
        let stream_id = format!("screen-{}", Uuid::new_v4());
        let (tx, ended) = oneshot::channel();
        if self.revoke_on_grant.load(Ordering::SeqCst) {
            let _ = tx.send(());
        } else {
            *self.revoke.lock() = Some(tx);
        }
        Ok(ScreenCapture {
            stream: LocalStream::new(
                stream_id.clone(),
                vec![sample_track(TrackSource::Screen, &stream_id)],
            ),
            ended,
        })
    }

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError> {
        Ok(vec![
            MediaDeviceInfo {
                device_id: "synthetic-microphone".to_owned(),
                kind: TrackKind::Audio,
                label: "Synthetic microphone".to_owned(),
            },
            MediaDeviceInfo {
                device_id: "synthetic-camera".to_owned(),
                kind: TrackKind::Video,
                label: "Synthetic camera".to_owned(),
            },
        ])
    }
}
