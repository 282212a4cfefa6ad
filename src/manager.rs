//! Per-peer connection lifecycle.
//!
//! [`ConnectionManager`] owns the local capture and one peer link per remote
//! participant. It performs the offer/answer/ICE exchange over the signaling
//! channel and reports streams, state transitions, quality samples and
//! per-link errors as [`ManagerEvent`]s.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{LinkInput, LinkMonitor, LinkState};
use crate::error::{CallError, MediaError, Result};
use crate::media::{LocalStream, LocalTrack, MediaAcquisition, MediaDeviceInfo, TrackKind, TrackSource};
use crate::metrics::{ConnectionQuality, QualityMonitor};
use crate::roster::RemoteStream;
use crate::signaling::{OutboundSignal, SignalingChannel};
use crate::transport::{
    IceCandidate, PeerConnector, PeerTransport, SessionDescription, TransportEvent,
};

#[derive(Debug)]
pub enum ManagerEvent {
    StreamReceived {
        user_id: String,
        stream: RemoteStream,
    },
    StateChanged {
        user_id: String,
        state: LinkState,
    },
    /// The link went Disconnected or Failed.
    LinkLost {
        user_id: String,
        state: LinkState,
    },
    Quality {
        user_id: String,
        quality: ConnectionQuality,
    },
    LinkError {
        user_id: String,
        error: CallError,
    },
    /// Screen capture was revoked outside the call controls.
    ScreenShareEnded,
}

struct PeerLink {
    transport: Arc<dyn PeerTransport>,
    monitor: LinkMonitor,
    negotiation: Arc<tokio::sync::Mutex<()>>,
    quality: Option<QualityMonitor>,
    pump: JoinHandle<()>,
    stream: Option<RemoteStream>,
    ice: HeldCandidates,
}

/// Candidates that arrived ahead of the description they depend on.
#[derive(Default)]
struct HeldCandidates {
    /// Set once the remote description is applied.
    remote_described: bool,
    inbound: Vec<IceCandidate>,
    /// Set once our offer or answer has been signaled.
    announced: bool,
    outbound: Vec<IceCandidate>,
}

impl HeldCandidates {
    /// Returns the candidate back when it can be added right away.
    fn hold_inbound(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_described {
            return Some(candidate);
        }
        self.inbound.push(candidate);
        None
    }

    /// Returns the candidate back when it can be signaled right away.
    fn hold_outbound(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.announced {
            return Some(candidate);
        }
        self.outbound.push(candidate);
        None
    }

    fn release_inbound(&mut self) -> Vec<IceCandidate> {
        self.remote_described = true;
        std::mem::take(&mut self.inbound)
    }

    fn release_outbound(&mut self) -> Vec<IceCandidate> {
        self.announced = true;
        std::mem::take(&mut self.outbound)
    }
}

#[derive(Clone)]
struct LinkRef {
    transport: Arc<dyn PeerTransport>,
    negotiation: Arc<tokio::sync::Mutex<()>>,
}

struct ScreenShare {
    stream: LocalStream,
    watcher: Option<JoinHandle<()>>,
}

struct Inner {
    meeting_id: String,
    config: Arc<Config>,
    media: Arc<dyn MediaAcquisition>,
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn SignalingChannel>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    links: Mutex<HashMap<String, PeerLink>>,
    creating: tokio::sync::Mutex<()>,
    local: Mutex<Option<Arc<LocalStream>>>,
    screen: Mutex<Option<ScreenShare>>,
    sharing: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        meeting_id: impl Into<String>,
        config: Arc<Config>,
        media: Arc<dyn MediaAcquisition>,
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            meeting_id: meeting_id.into(),
            config,
            media,
            connector,
            signaling,
            events,
            links: Mutex::new(HashMap::new()),
            creating: tokio::sync::Mutex::new(()),
            local: Mutex::new(None),
            screen: Mutex::new(None),
            sharing: tokio::sync::Mutex::new(()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Captures camera and/or microphone. The call cannot proceed without it.
    pub async fn initialize_local_stream(&self, video: bool, audio: bool) -> Result<Arc<LocalStream>> {
        if let Some(local) = self.local_stream() {
            return Ok(local);
        }
        let constraints = self.inner.config.media_constraints(video, audio);
        let stream = self
            .inner
            .media
            .user_media(&constraints)
            .await
            .map(Arc::new)
            .map_err(CallError::LocalMedia)?;
        info!(
            stream_id = stream.id(),
            tracks = stream.tracks().len(),
            "local stream initialized"
        );
        *self.inner.local.lock() = Some(Arc::clone(&stream));
        Ok(stream)
    }

    pub fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.inner.local.lock().clone()
    }

    pub async fn list_devices(&self) -> Result<Vec<MediaDeviceInfo>> {
        self.inner
            .media
            .enumerate_devices()
            .await
            .map_err(CallError::LocalMedia)
    }

    /// Opens a link to `user_id`, or returns the state of the existing one.
    pub async fn create_peer_connection(&self, user_id: &str) -> Result<LinkState> {
        if let Some(state) = self.link_state(user_id) {
            return Ok(state);
        }
        let _creating = self.inner.creating.lock().await;
        if let Some(state) = self.link_state(user_id) {
            return Ok(state);
        }

        let tracks = self.outbound_tracks();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self
            .inner
            .connector
            .connect(user_id, &tracks, tx)
            .await
            .map_err(|source| CallError::Negotiation {
                user_id: user_id.to_owned(),
                source,
            })?;

        {
            let mut links = self.inner.links.lock();
            let pump = tokio::spawn(pump_transport_events(
                Arc::downgrade(&self.inner),
                user_id.to_owned(),
                rx,
            ));
            links.insert(
                user_id.to_owned(),
                PeerLink {
                    transport,
                    monitor: LinkMonitor::new(),
                    negotiation: Arc::new(tokio::sync::Mutex::new(())),
                    quality: None,
                    pump,
                    stream: None,
                    ice: HeldCandidates::default(),
                },
            );
        }
        info!(user_id, tracks = tracks.len(), "peer link created");
        Ok(LinkState::Idle)
    }

    pub async fn create_offer(&self, user_id: &str) -> Result<()> {
        let link = self.link(user_id)?;
        let _negotiating = link.negotiation.lock().await;
        if link.transport.has_local_description().await {
            debug!(user_id, "offer already made on this link");
            return Ok(());
        }

        let offer = link
            .transport
            .create_offer()
            .await
            .map_err(|source| negotiation_error(user_id, source))?;
        self.transition(user_id, LinkInput::OfferSent);
        self.send(OutboundSignal::Offer {
            meeting_id: self.inner.meeting_id.clone(),
            to: user_id.to_owned(),
            offer,
        })
        .await?;
        self.release_local_candidates(user_id).await;
        Ok(())
    }

    /// Applies a remote offer and answers it. Returns `false` when the offer
    /// was dropped because this side already set a local description.
    pub async fn handle_offer(&self, user_id: &str, offer: SessionDescription) -> Result<bool> {
        self.create_peer_connection(user_id).await?;
        let link = self.link(user_id)?;
        let _negotiating = link.negotiation.lock().await;
        if link.transport.has_local_description().await {
            warn!(user_id, "ignoring remote offer, local description already set");
            return Ok(false);
        }

        link.transport
            .set_remote_description(offer)
            .await
            .map_err(|source| negotiation_error(user_id, source))?;
        self.apply_held_candidates(user_id, &link).await;
        let answer = link
            .transport
            .create_answer()
            .await
            .map_err(|source| negotiation_error(user_id, source))?;
        self.transition(user_id, LinkInput::AnswerSent);
        self.send(OutboundSignal::Answer {
            meeting_id: self.inner.meeting_id.clone(),
            to: user_id.to_owned(),
            answer,
        })
        .await?;
        self.release_local_candidates(user_id).await;
        Ok(true)
    }

    pub async fn handle_answer(&self, user_id: &str, answer: SessionDescription) -> Result<()> {
        let link = self.link(user_id)?;
        let _negotiating = link.negotiation.lock().await;
        link.transport
            .set_remote_description(answer)
            .await
            .map_err(|source| negotiation_error(user_id, source))?;
        self.apply_held_candidates(user_id, &link).await;
        Ok(())
    }

    /// Adds a remote candidate, or holds it until the remote description
    /// it belongs to has been applied.
    pub async fn handle_ice_candidate(&self, user_id: &str, candidate: IceCandidate) -> Result<()> {
        let link = self.link(user_id)?;
        let _negotiating = link.negotiation.lock().await;
        let Some(candidate) = self
            .with_link(user_id, |l| l.ice.hold_inbound(candidate))
            .ok_or_else(|| CallError::UnknownPeer(user_id.to_owned()))?
        else {
            debug!(user_id, "holding ICE candidate until the remote description is set");
            return Ok(());
        };
        add_candidate(user_id, &link.transport, candidate).await
    }

    /// Caller holds the link's negotiation lock.
    async fn apply_held_candidates(&self, user_id: &str, link: &LinkRef) {
        let held = self
            .with_link(user_id, |l| l.ice.release_inbound())
            .unwrap_or_default();
        for candidate in held {
            if let Err(error) = add_candidate(user_id, &link.transport, candidate).await {
                self.emit(ManagerEvent::LinkError {
                    user_id: user_id.to_owned(),
                    error,
                });
            }
        }
    }

    /// Local candidates gathered before the offer or answer went out.
    async fn release_local_candidates(&self, user_id: &str) {
        let held = self
            .with_link(user_id, |l| l.ice.release_outbound())
            .unwrap_or_default();
        for candidate in held {
            self.signal_candidate(user_id, candidate).await;
        }
    }

    async fn signal_candidate(&self, user_id: &str, candidate: IceCandidate) {
        let signal = OutboundSignal::IceCandidate {
            meeting_id: self.inner.meeting_id.clone(),
            to: user_id.to_owned(),
            candidate,
        };
        if let Err(error) = self.send(signal).await {
            self.emit(ManagerEvent::LinkError {
                user_id: user_id.to_owned(),
                error,
            });
        }
    }

    pub fn toggle_audio(&self, enabled: bool) -> Result<()> {
        let local = self.local_stream().ok_or(CallError::LocalStreamMissing)?;
        for track in local.tracks_of(TrackKind::Audio) {
            track.set_enabled(enabled);
        }
        Ok(())
    }

    pub fn toggle_video(&self, enabled: bool) -> Result<()> {
        let local = self.local_stream().ok_or(CallError::LocalStreamMissing)?;
        for track in local.tracks_of(TrackKind::Video) {
            track.set_enabled(enabled);
        }
        Ok(())
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.inner.screen.lock().is_some()
    }

    /// Puts a display capture in the outbound video slot of every link.
    pub async fn start_screen_share(&self) -> Result<()> {
        if self.local_stream().is_none() {
            return Err(CallError::LocalStreamMissing);
        }
        let _sharing = self.inner.sharing.lock().await;
        if self.is_screen_sharing() {
            return Ok(());
        }

        let capture = self
            .inner
            .media
            .display_media()
            .await
            .map_err(CallError::ScreenShare)?;
        let Some(screen_track) = capture.stream.video_track().cloned() else {
            capture.stream.stop();
            return Err(CallError::ScreenShare(MediaError::Track(
                "display capture has no video track".to_owned(),
            )));
        };
        let screen_id = capture.stream.id().to_owned();

        *self.inner.screen.lock() = Some(ScreenShare {
            stream: capture.stream,
            watcher: None,
        });
        self.replace_outbound_video(screen_track).await;

        let weak = Arc::downgrade(&self.inner);
        let ended = capture.ended;
        let revoked_id = screen_id.clone();
        let watcher = tokio::spawn(async move {
            if ended.await.is_err() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                info!("screen capture revoked");
                ConnectionManager { inner }
                    .end_screen_share(Some(&revoked_id))
                    .await;
            }
        });
        // cleanup may have emptied the slot while tracks were being swapped
        match self.inner.screen.lock().as_mut() {
            Some(share) if share.stream.id() == screen_id => share.watcher = Some(watcher),
            _ => watcher.abort(),
        }
        info!(stream_id = %screen_id, "screen share started");
        Ok(())
    }

    /// Restores the camera track on every link. No-op when not sharing.
    pub async fn stop_screen_share(&self) -> Result<()> {
        self.end_screen_share(None).await;
        Ok(())
    }

    /// `revoked` carries the capture id when the capture itself ended, in
    /// which case only that capture is stopped.
    async fn end_screen_share(&self, revoked: Option<&str>) -> bool {
        let _sharing = self.inner.sharing.lock().await;
        let share = {
            let mut slot = self.inner.screen.lock();
            let current = match (slot.as_ref(), revoked) {
                (None, _) => false,
                (Some(share), Some(id)) => share.stream.id() == id,
                (Some(_), None) => true,
            };
            if !current {
                return false;
            }
            slot.take()
        };
        let Some(share) = share else {
            return false;
        };

        if revoked.is_none() {
            if let Some(watcher) = share.watcher {
                watcher.abort();
            }
        }
        share.stream.stop();

        if let Some(camera) = self.local_stream().and_then(|l| l.video_track().cloned()) {
            self.replace_outbound_video(camera).await;
        }
        info!("screen share stopped");
        if revoked.is_some() {
            self.emit(ManagerEvent::ScreenShareEnded);
        }
        true
    }

    async fn replace_outbound_video(&self, track: Arc<LocalTrack>) {
        let targets: Vec<(String, Arc<dyn PeerTransport>)> = self
            .inner
            .links
            .lock()
            .iter()
            .map(|(user, link)| (user.clone(), Arc::clone(&link.transport)))
            .collect();

        let results = join_all(targets.into_iter().map(|(user_id, transport)| {
            let track = Arc::clone(&track);
            async move {
                let result = transport.replace_video_track(track).await;
                (user_id, result)
            }
        }))
        .await;

        for (user_id, result) in results {
            if let Err(source) = result {
                warn!(user_id = %user_id, "video track replacement failed: {source}");
                self.emit(ManagerEvent::LinkError {
                    user_id: user_id.clone(),
                    error: CallError::TrackReplace { user_id, source },
                });
            }
        }
    }

    /// Audio tracks plus whichever video track owns the outbound slot.
    fn outbound_tracks(&self) -> Vec<Arc<LocalTrack>> {
        let Some(local) = self.local_stream() else {
            return Vec::new();
        };
        let screen = self
            .inner
            .screen
            .lock()
            .as_ref()
            .and_then(|s| s.stream.video_track().cloned());

        let mut tracks: Vec<Arc<LocalTrack>> = local.tracks_of(TrackKind::Audio).cloned().collect();
        match screen {
            Some(screen) => tracks.push(screen),
            None => tracks.extend(
                local
                    .tracks()
                    .iter()
                    .filter(|t| t.source() == TrackSource::Camera)
                    .cloned(),
            ),
        }
        tracks
    }

    /// Closes the link to `user_id`. Returns `false` if there was none.
    pub async fn close_peer(&self, user_id: &str) -> bool {
        let link = self.inner.links.lock().remove(user_id);
        match link {
            Some(link) => {
                close_link(user_id, link).await;
                true
            }
            None => false,
        }
    }

    /// Stops every local track, closes every link. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let links: Vec<(String, PeerLink)> = self.inner.links.lock().drain().collect();

        if let Some(share) = self.inner.screen.lock().take() {
            if let Some(watcher) = share.watcher {
                watcher.abort();
            }
            share.stream.stop();
        }
        if let Some(local) = self.inner.local.lock().take() {
            local.stop();
        }

        let count = links.len();
        join_all(
            links
                .into_iter()
                .map(|(user_id, link)| async move { close_link(&user_id, link).await }),
        )
        .await;
        if count > 0 {
            info!(links = count, "connection manager cleaned up");
        }
    }

    pub fn link_count(&self) -> usize {
        self.inner.links.lock().len()
    }

    pub fn link_state(&self, user_id: &str) -> Option<LinkState> {
        self.inner
            .links
            .lock()
            .get(user_id)
            .map(|link| link.monitor.state())
    }

    pub fn watch_link(&self, user_id: &str) -> Option<watch::Receiver<LinkState>> {
        self.inner
            .links
            .lock()
            .get(user_id)
            .map(|link| link.monitor.subscribe())
    }

    pub async fn outbound_track_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let link = self.link(user_id)?;
        Ok(link.transport.outbound_track_ids().await)
    }

    fn with_link<R>(&self, user_id: &str, f: impl FnOnce(&mut PeerLink) -> R) -> Option<R> {
        self.inner.links.lock().get_mut(user_id).map(f)
    }

    fn link(&self, user_id: &str) -> Result<LinkRef> {
        self.inner
            .links
            .lock()
            .get(user_id)
            .map(|link| LinkRef {
                transport: Arc::clone(&link.transport),
                negotiation: Arc::clone(&link.negotiation),
            })
            .ok_or_else(|| CallError::UnknownPeer(user_id.to_owned()))
    }

    async fn send(&self, signal: OutboundSignal) -> Result<()> {
        self.inner.signaling.send(signal).await?;
        Ok(())
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Drives the state machine and starts or stops quality sampling.
    fn transition(&self, user_id: &str, input: LinkInput) -> Option<LinkState> {
        let next = {
            let mut links = self.inner.links.lock();
            let link = links.get_mut(user_id)?;
            let (previous, next) = link.monitor.apply(input)?;

            if next == LinkState::Connected && link.quality.is_none() {
                let events = self.inner.events.clone();
                let sampled = user_id.to_owned();
                link.quality = Some(QualityMonitor::start(
                    Arc::clone(&link.transport),
                    self.inner.config.quality_interval,
                    move |quality| {
                        events
                            .send(ManagerEvent::Quality {
                                user_id: sampled.clone(),
                                quality,
                            })
                            .is_ok()
                    },
                ));
            } else if previous == LinkState::Connected {
                if let Some(quality) = link.quality.take() {
                    quality.stop();
                }
            }
            debug!(user_id, %previous, %next, "link state changed");
            next
        };

        self.emit(ManagerEvent::StateChanged {
            user_id: user_id.to_owned(),
            state: next,
        });
        if next.is_lost() {
            self.emit(ManagerEvent::LinkLost {
                user_id: user_id.to_owned(),
                state: next,
            });
        }
        Some(next)
    }

    async fn on_transport_event(&self, user_id: &str, event: TransportEvent) {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                let ready = self
                    .with_link(user_id, |l| l.ice.hold_outbound(candidate))
                    .flatten();
                if let Some(candidate) = ready {
                    self.signal_candidate(user_id, candidate).await;
                }
            }
            TransportEvent::Track(track) => {
                let stream = {
                    let mut links = self.inner.links.lock();
                    let Some(link) = links.get_mut(user_id) else {
                        return;
                    };
                    let added = match link.stream.as_mut() {
                        Some(stream) => stream.add_track(track),
                        None => {
                            link.stream = Some(RemoteStream::new(track));
                            true
                        }
                    };
                    if added {
                        link.stream.clone()
                    } else {
                        None
                    }
                };
                if let Some(stream) = stream {
                    self.emit(ManagerEvent::StreamReceived {
                        user_id: user_id.to_owned(),
                        stream,
                    });
                }
            }
            TransportEvent::StateChanged(state) => {
                self.transition(user_id, LinkInput::Transport(state));
            }
        }
    }
}

async fn add_candidate(
    user_id: &str,
    transport: &Arc<dyn PeerTransport>,
    candidate: IceCandidate,
) -> Result<()> {
    transport
        .add_ice_candidate(candidate)
        .await
        .map_err(|source| CallError::IceCandidate {
            user_id: user_id.to_owned(),
            source,
        })
}

fn negotiation_error(user_id: &str, source: crate::error::TransportError) -> CallError {
    CallError::Negotiation {
        user_id: user_id.to_owned(),
        source,
    }
}

async fn pump_transport_events(
    manager: Weak<Inner>,
    user_id: String,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = manager.upgrade() else {
            break;
        };
        ConnectionManager { inner }
            .on_transport_event(&user_id, event)
            .await;
    }
}

async fn close_link(user_id: &str, mut link: PeerLink) {
    link.pump.abort();
    if let Some(quality) = link.quality.take() {
        quality.stop();
    }
    link.monitor.apply(LinkInput::Teardown);
    if let Err(e) = link.transport.close().await {
        warn!(user_id, "failed to close peer connection: {e}");
    }
    info!(user_id, "peer link closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticMedia;
    use crate::testing::{recv_until, LoopbackNet, RecordingSignaling};
    use crate::transport::{InboundVideoStats, TransportState};
    use std::time::Duration;

    struct Fixture {
        manager: ConnectionManager,
        events: mpsc::UnboundedReceiver<ManagerEvent>,
        media: Arc<SyntheticMedia>,
        signaling: Arc<RecordingSignaling>,
        net: LoopbackNet,
    }

    fn fixture(user_id: &str) -> Fixture {
        let net = LoopbackNet::new();
        let media = Arc::new(SyntheticMedia::new());
        let signaling = RecordingSignaling::new();
        let config = Config {
            quality_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (manager, events) = ConnectionManager::new(
            "m1",
            Arc::new(config),
            media.clone(),
            net.connector(user_id),
            signaling.clone(),
        );
        Fixture {
            manager,
            events,
            media,
            signaling,
            net,
        }
    }

    #[tokio::test]
    async fn creating_a_link_twice_keeps_one() {
        let f = fixture("A");
        f.manager.initialize_local_stream(true, true).await.unwrap();

        let (first, second) = tokio::join!(
            f.manager.create_peer_connection("B"),
            f.manager.create_peer_connection("B")
        );
        assert_eq!(first.unwrap(), LinkState::Idle);
        assert_eq!(second.unwrap(), LinkState::Idle);
        assert_eq!(f.manager.create_peer_connection("B").await.unwrap(), LinkState::Idle);
        assert_eq!(f.manager.link_count(), 1);
    }

    #[tokio::test]
    async fn devices_are_listed_through_the_manager() {
        let f = fixture("A");
        let devices = f.manager.list_devices().await.unwrap();
        assert!(devices.iter().any(|d| d.kind == TrackKind::Audio));
        assert!(devices.iter().any(|d| d.kind == TrackKind::Video));
    }

    #[tokio::test]
    async fn toggles_need_a_local_stream() {
        let f = fixture("A");
        assert!(matches!(
            f.manager.toggle_audio(false),
            Err(CallError::LocalStreamMissing)
        ));
        assert!(matches!(
            f.manager.start_screen_share().await,
            Err(CallError::LocalStreamMissing)
        ));

        let local = f.manager.initialize_local_stream(true, true).await.unwrap();
        f.manager.toggle_audio(false).unwrap();
        assert!(local.tracks_of(TrackKind::Audio).all(|t| !t.is_enabled()));
        assert!(local.tracks_of(TrackKind::Video).all(|t| t.is_enabled()));
        f.manager.toggle_audio(true).unwrap();
        assert!(local.tracks_of(TrackKind::Audio).all(|t| t.is_enabled()));
    }

    #[tokio::test]
    async fn offer_is_signaled_and_later_offers_are_guarded() {
        let f = fixture("A");
        f.manager.initialize_local_stream(true, true).await.unwrap();
        f.manager.create_peer_connection("B").await.unwrap();
        f.manager.create_offer("B").await.unwrap();
        assert_eq!(f.manager.link_state("B"), Some(LinkState::Offering));

        // a second offer on the same link is a no-op
        f.manager.create_offer("B").await.unwrap();
        let offers = f
            .signaling
            .sent()
            .into_iter()
            .filter(|s| matches!(s, OutboundSignal::Offer { to, .. } if to == "B"))
            .count();
        assert_eq!(offers, 1);

        let applied = f
            .manager
            .handle_offer("B", SessionDescription::offer("loopback B -> A"))
            .await
            .unwrap();
        assert!(!applied);
    }

    fn candidate(tag: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{tag} 1 udp 1 127.0.0.1 9 typ host"),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn candidates_ahead_of_the_offer_are_held() {
        let mut f = fixture("B");
        f.manager.initialize_local_stream(true, true).await.unwrap();
        f.manager.create_peer_connection("A").await.unwrap();

        f.manager.handle_ice_candidate("A", candidate("early")).await.unwrap();
        assert_eq!(f.net.remote_candidates("B", "A"), 0);

        let applied = f
            .manager
            .handle_offer("A", SessionDescription::offer("loopback A -> B"))
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(f.net.remote_candidates("B", "A"), 1);

        f.manager.handle_ice_candidate("A", candidate("late")).await.unwrap();
        assert_eq!(f.net.remote_candidates("B", "A"), 2);
        while let Ok(event) = f.events.try_recv() {
            assert!(!matches!(event, ManagerEvent::LinkError { .. }), "{event:?}");
        }
    }

    #[tokio::test]
    async fn local_candidates_follow_the_offer() {
        let f = fixture("A");
        f.manager.initialize_local_stream(true, true).await.unwrap();
        f.manager.create_peer_connection("B").await.unwrap();
        f.manager.create_offer("B").await.unwrap();

        let sent_candidate = || {
            f.signaling
                .sent()
                .iter()
                .any(|s| matches!(s, OutboundSignal::IceCandidate { .. }))
        };
        assert!(crate::testing::eventually(sent_candidate).await);
        let sent = f.signaling.sent();
        let offer = sent
            .iter()
            .position(|s| matches!(s, OutboundSignal::Offer { .. }))
            .unwrap();
        let first_candidate = sent
            .iter()
            .position(|s| matches!(s, OutboundSignal::IceCandidate { .. }))
            .unwrap();
        assert!(offer < first_candidate);
    }

    #[tokio::test]
    async fn unknown_peers_are_link_errors() {
        let f = fixture("A");
        let err = f
            .manager
            .handle_answer("Z", SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::UnknownPeer(ref user) if user == "Z"));
    }

    #[tokio::test]
    async fn screen_share_swaps_video_and_keeps_audio() {
        let f = fixture("A");
        let local = f.manager.initialize_local_stream(true, true).await.unwrap();
        let audio_id = local.tracks_of(TrackKind::Audio).next().unwrap().id().to_owned();
        let camera_id = local.video_track().unwrap().id().to_owned();
        f.manager.create_peer_connection("B").await.unwrap();
        f.manager.create_peer_connection("C").await.unwrap();

        f.manager.start_screen_share().await.unwrap();
        assert!(f.manager.is_screen_sharing());
        for peer in ["B", "C"] {
            let ids = f.manager.outbound_track_ids(peer).await.unwrap();
            assert_eq!(ids.len(), 2);
            assert!(ids.contains(&audio_id));
            assert!(!ids.contains(&camera_id));
        }

        // links opened while sharing send the screen too
        f.manager.create_peer_connection("D").await.unwrap();
        let ids = f.manager.outbound_track_ids("D").await.unwrap();
        assert!(ids.iter().any(|id| id.starts_with("screen-")));

        f.manager.stop_screen_share().await.unwrap();
        assert!(!f.manager.is_screen_sharing());
        for peer in ["B", "C", "D"] {
            let ids = f.manager.outbound_track_ids(peer).await.unwrap();
            assert_eq!(ids, vec![audio_id.clone(), camera_id.clone()]);
        }
    }

    #[tokio::test]
    async fn overlapping_starts_open_one_capture() {
        let f = fixture("A");
        f.manager.initialize_local_stream(true, true).await.unwrap();
        f.manager.create_peer_connection("B").await.unwrap();

        let (first, second) = tokio::join!(
            f.manager.start_screen_share(),
            f.manager.start_screen_share()
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(f.media.display_requests(), 1);

        f.manager.stop_screen_share().await.unwrap();
        assert!(!f.manager.is_screen_sharing());
        let ids = f.manager.outbound_track_ids("B").await.unwrap();
        assert!(!ids.iter().any(|id| id.starts_with("screen-")));
    }

    #[tokio::test]
    async fn revoked_capture_restores_the_camera() {
        let mut f = fixture("A");
        let local = f.manager.initialize_local_stream(true, true).await.unwrap();
        let camera_id = local.video_track().unwrap().id().to_owned();
        f.manager.create_peer_connection("B").await.unwrap();
        f.manager.start_screen_share().await.unwrap();

        assert!(f.media.revoke_screen());
        recv_until(&mut f.events, |e| matches!(e, ManagerEvent::ScreenShareEnded)).await;
        assert!(!f.manager.is_screen_sharing());
        let ids = f.manager.outbound_track_ids("B").await.unwrap();
        assert!(ids.contains(&camera_id));
    }

    #[tokio::test]
    async fn failed_track_replacement_is_reported_per_link() {
        let mut f = fixture("A");
        f.manager.initialize_local_stream(true, true).await.unwrap();
        f.manager.create_peer_connection("B").await.unwrap();
        f.manager.create_peer_connection("C").await.unwrap();
        f.net.fail_replace("A", "C");

        f.manager.start_screen_share().await.unwrap();
        let event = recv_until(&mut f.events, |e| matches!(e, ManagerEvent::LinkError { .. })).await;
        match event {
            ManagerEvent::LinkError { user_id, error } => {
                assert_eq!(user_id, "C");
                assert!(matches!(error, CallError::TrackReplace { .. }));
                assert!(!error.drops_peer());
            }
            other => panic!("unexpected event {other:?}"),
        }
        let ids = f.manager.outbound_track_ids("B").await.unwrap();
        assert!(ids.iter().any(|id| id.starts_with("screen-")));
    }

    #[tokio::test]
    async fn quality_is_sampled_only_while_connected() {
        let mut f = fixture("A");
        f.manager.initialize_local_stream(true, true).await.unwrap();
        f.manager.create_peer_connection("B").await.unwrap();
        f.net.set_stats(
            "A",
            "B",
            InboundVideoStats {
                packets_received: 80,
                packets_lost: 20,
            },
        );

        assert!(f.net.emit_state("A", "B", TransportState::Connected));
        let event = recv_until(&mut f.events, |e| matches!(e, ManagerEvent::Quality { .. })).await;
        assert!(matches!(
            event,
            ManagerEvent::Quality { quality: ConnectionQuality::Poor, .. }
        ));

        assert!(f.net.emit_state("A", "B", TransportState::Failed));
        recv_until(&mut f.events, |e| {
            matches!(e, ManagerEvent::LinkLost { state: LinkState::Failed, .. })
        })
        .await;

        f.net.set_stats("A", "B", InboundVideoStats::default());
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = f.events.try_recv() {
            assert!(!matches!(event, ManagerEvent::Quality { .. }), "{event:?}");
        }
    }

    #[tokio::test]
    async fn cleanup_closes_everything_and_allows_fresh_links() {
        let f = fixture("A");
        let local = f.manager.initialize_local_stream(true, true).await.unwrap();
        f.manager.create_peer_connection("B").await.unwrap();
        f.manager.create_peer_connection("C").await.unwrap();
        let watchers: Vec<_> = ["B", "C"]
            .iter()
            .map(|peer| f.manager.watch_link(peer).unwrap())
            .collect();

        f.manager.cleanup().await;
        f.manager.cleanup().await;

        assert_eq!(f.manager.link_count(), 0);
        assert!(local.tracks().iter().all(|t| t.is_stopped()));
        for watcher in &watchers {
            assert_eq!(*watcher.borrow(), LinkState::Closed);
        }
        assert!(f.net.is_closed("A", "B"));
        assert!(f.net.is_closed("A", "C"));

        assert_eq!(f.manager.create_peer_connection("B").await.unwrap(), LinkState::Idle);
        assert_eq!(f.manager.link_count(), 1);
    }
}
