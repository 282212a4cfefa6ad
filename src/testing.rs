//! In-memory fakes for exercising the call layer without sockets or ICE.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;

use crate::error::{SignalingError, TransportError};
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{InboundSignal, JoinAck, OutboundSignal, SignalingChannel};
use crate::transport::{
    IceCandidate, InboundVideoStats, PeerConnector, PeerTransport, RemoteTrack, SessionDescription,
    TransportEvent, TransportEvents, TransportState,
};

/// SDP the loopback refuses to apply.
pub const GARBAGE_SDP: &str = "garbage";

type Key = (String, String);

#[derive(Clone)]
struct Outbound {
    id: String,
    stream_id: String,
    kind: TrackKind,
}

impl Outbound {
    fn of(track: &LocalTrack) -> Self {
        Self {
            id: track.id().to_owned(),
            stream_id: track.rtc_track().stream_id().to_owned(),
            kind: track.kind(),
        }
    }
}

struct Endpoint {
    events: TransportEvents,
    outbound: Vec<Outbound>,
    local_description: bool,
    remote_description: bool,
    remote_candidates: usize,
    connected: bool,
}

#[derive(Default)]
struct NetState {
    /// (local, remote) -> local's view of the link
    endpoints: HashMap<Key, Endpoint>,
    stats: HashMap<Key, InboundVideoStats>,
    failing_replace: HashSet<Key>,
    closed: HashSet<Key>,
}

/// Pairs transports opened by different users in one process. A pair
/// connects once both ends hold local and remote descriptions and have
/// added at least one remote candidate, at which point each end receives
/// the other's outbound tracks.
#[derive(Clone, Default)]
pub struct LoopbackNet {
    state: Arc<Mutex<NetState>>,
}

impl LoopbackNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self, local_user_id: &str) -> Arc<LoopbackConnector> {
        Arc::new(LoopbackConnector {
            net: self.clone(),
            local: local_user_id.to_owned(),
        })
    }

    pub fn set_stats(&self, local: &str, remote: &str, stats: InboundVideoStats) {
        self.state.lock().stats.insert(key(local, remote), stats);
    }

    /// Reports `state` on `local`'s end of the link only.
    pub fn emit_state(&self, local: &str, remote: &str, state: TransportState) -> bool {
        match self.state.lock().endpoints.get(&key(local, remote)) {
            Some(endpoint) => endpoint
                .events
                .send(TransportEvent::StateChanged(state))
                .is_ok(),
            None => false,
        }
    }

    pub fn fail_replace(&self, local: &str, remote: &str) {
        self.state.lock().failing_replace.insert(key(local, remote));
    }

    pub fn is_closed(&self, local: &str, remote: &str) -> bool {
        self.state.lock().closed.contains(&key(local, remote))
    }

    pub fn remote_candidates(&self, local: &str, remote: &str) -> usize {
        self.state
            .lock()
            .endpoints
            .get(&key(local, remote))
            .map_or(0, |e| e.remote_candidates)
    }

    pub fn is_connected(&self, local: &str, remote: &str) -> bool {
        self.state
            .lock()
            .endpoints
            .get(&key(local, remote))
            .is_some_and(|e| e.connected)
    }

    fn update<R>(&self, local: &str, remote: &str, f: impl FnOnce(&mut Endpoint) -> R) -> Result<R, TransportError> {
        let result = {
            let mut state = self.state.lock();
            let endpoint = state
                .endpoints
                .get_mut(&key(local, remote))
                .ok_or(TransportError::Closed)?;
            f(endpoint)
        };
        self.maybe_connect(local, remote);
        Ok(result)
    }

    fn maybe_connect(&self, a: &str, b: &str) {
        let mut state = self.state.lock();
        let ready = |e: Option<&Endpoint>| {
            e.is_some_and(|e| {
                e.local_description && e.remote_description && e.remote_candidates > 0 && !e.connected
            })
        };
        if !ready(state.endpoints.get(&key(a, b))) || !ready(state.endpoints.get(&key(b, a))) {
            return;
        }

        for (local, remote) in [(a, b), (b, a)] {
            let tracks = state
                .endpoints
                .get(&key(remote, local))
                .map(|e| e.outbound.clone())
                .unwrap_or_default();
            if let Some(endpoint) = state.endpoints.get_mut(&key(local, remote)) {
                endpoint.connected = true;
                let _ = endpoint
                    .events
                    .send(TransportEvent::StateChanged(TransportState::Connected));
                for track in tracks {
                    let _ = endpoint.events.send(TransportEvent::Track(RemoteTrack {
                        id: track.id,
                        stream_id: track.stream_id,
                        kind: track.kind,
                        track: None,
                    }));
                }
            }
        }
    }
}

fn key(local: &str, remote: &str) -> Key {
    (local.to_owned(), remote.to_owned())
}

pub struct LoopbackConnector {
    net: LoopbackNet,
    local: String,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
        remote_user_id: &str,
        tracks: &[Arc<LocalTrack>],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut state = self.net.state.lock();
        let key = key(&self.local, remote_user_id);
        state.closed.remove(&key);
        state.endpoints.insert(
            key,
            Endpoint {
                events,
                outbound: tracks.iter().map(|t| Outbound::of(t)).collect(),
                local_description: false,
                remote_description: false,
                remote_candidates: 0,
                connected: false,
            },
        );
        Ok(Arc::new(LoopbackTransport {
            net: self.net.clone(),
            local: self.local.clone(),
            remote: remote_user_id.to_owned(),
        }))
    }
}

struct LoopbackTransport {
    net: LoopbackNet,
    local: String,
    remote: String,
}

impl LoopbackTransport {
    fn candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:loopback 1 udp 1 127.0.0.1 9 typ host ({})", self.local),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let candidate = self.candidate();
        self.net.update(&self.local, &self.remote, |e| {
            e.local_description = true;
            let _ = e.events.send(TransportEvent::IceCandidate(candidate));
        })?;
        Ok(SessionDescription::offer(format!("loopback {} -> {}", self.local, self.remote)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let candidate = self.candidate();
        self.net.update(&self.local, &self.remote, |e| {
            if !e.remote_description {
                return Err(TransportError::InvalidDescription(
                    "no remote offer to answer".to_owned(),
                ));
            }
            e.local_description = true;
            let _ = e.events.send(TransportEvent::IceCandidate(candidate));
            Ok(())
        })??;
        Ok(SessionDescription::answer(format!("loopback {} -> {}", self.local, self.remote)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        if desc.sdp == GARBAGE_SDP {
            return Err(TransportError::InvalidDescription(desc.sdp));
        }
        self.net
            .update(&self.local, &self.remote, |e| e.remote_description = true)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if candidate.candidate.is_empty() {
            return Err(TransportError::InvalidDescription("empty candidate".to_owned()));
        }
        self.net.update(&self.local, &self.remote, |e| {
            if !e.remote_description {
                return Err(TransportError::InvalidDescription(
                    "remote description is not set".to_owned(),
                ));
            }
            e.remote_candidates += 1;
            Ok(())
        })?
    }

    async fn has_local_description(&self) -> bool {
        self.net
            .update(&self.local, &self.remote, |e| e.local_description)
            .unwrap_or(false)
    }

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        let key = key(&self.local, &self.remote);
        if self.net.state.lock().failing_replace.contains(&key) {
            return Err(TransportError::NoVideoSender);
        }
        self.net.update(&self.local, &self.remote, |e| {
            let slot = e
                .outbound
                .iter_mut()
                .find(|t| t.kind == TrackKind::Video)
                .ok_or(TransportError::NoVideoSender)?;
            *slot = Outbound::of(&track);
            Ok(())
        })?
    }

    async fn outbound_track_ids(&self) -> Vec<String> {
        self.net
            .update(&self.local, &self.remote, |e| {
                e.outbound.iter().map(|t| t.id.clone()).collect()
            })
            .unwrap_or_default()
    }

    async fn inbound_video_stats(&self) -> Option<InboundVideoStats> {
        self.net
            .state
            .lock()
            .stats
            .get(&key(&self.local, &self.remote))
            .copied()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.net.state.lock();
        let key = key(&self.local, &self.remote);
        state.endpoints.remove(&key);
        state.closed.insert(key);
        Ok(())
    }
}

/// A signaling channel for a meeting nobody else has joined yet. Inbound
/// signals are pushed by hand.
#[derive(Default)]
pub struct RecordingSignaling {
    reject: Mutex<Option<String>>,
    sent: Mutex<Vec<OutboundSignal>>,
    listener: Mutex<Option<mpsc::UnboundedSender<InboundSignal>>>,
}

impl RecordingSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject_with(&self, reason: &str) {
        *self.reject.lock() = Some(reason.to_owned());
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Delivers `signal` as if the server pushed it.
    pub fn push(&self, signal: InboundSignal) -> bool {
        match self.listener.lock().as_ref() {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn join(&self, meeting_id: &str, user_id: &str) -> Result<JoinAck, SignalingError> {
        self.sent.lock().push(OutboundSignal::JoinMeeting {
            meeting_id: meeting_id.to_owned(),
            user_id: user_id.to_owned(),
        });
        if let Some(reason) = self.reject.lock().clone() {
            return Err(SignalingError::Rejected(reason));
        }
        Ok(JoinAck {
            participants: Vec::new(),
        })
    }

    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        self.sent.lock().push(signal);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.listener.lock() = Some(tx);
        rx
    }

    fn detach(&self) {
        self.listener.lock().take();
    }
}

/// Receives from `rx` until `matches` accepts an item. Panics after two
/// seconds or when the channel closes.
pub async fn recv_until<T, F>(rx: &mut mpsc::UnboundedReceiver<T>, mut matches: F) -> T
where
    F: FnMut(&T) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(item) = rx.recv().await {
            if matches(&item) {
                return Some(item);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(item)) => item,
        Ok(None) => panic!("channel closed before the expected item arrived"),
        Err(_) => panic!("timed out waiting for the expected item"),
    }
}

/// Polls `condition` every few milliseconds for up to two seconds.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
