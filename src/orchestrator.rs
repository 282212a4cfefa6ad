//! Session-level call coordination.
//!
//! [`CallOrchestrator`] joins a meeting, keeps the roster, routes inbound
//! signaling to the [`ConnectionManager`], and exposes the call controls.
//! Everything that happens during a call reaches the presentation layer
//! through the hooks registered with the `on_*` methods.
//!
//! Each remote participant gets a worker task that applies that peer's
//! negotiation commands in arrival order, so a slow exchange with one peer
//! never holds up another.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{CallError, Result, Severity, SignalingError};
use crate::hooks::CallHooks;
use crate::manager::{ConnectionManager, ManagerEvent};
use crate::media::MediaAcquisition;
use crate::metrics::ConnectionQuality;
use crate::roster::{ChatMessage, Participant, Roster, StreamHandle};
use crate::signaling::{InboundSignal, MediaState, OutboundSignal, SignalingChannel};
use crate::transport::{IceCandidate, PeerConnector, SessionDescription};

#[derive(Debug)]
enum PeerCommand {
    Connect { offer: bool },
    Offer(SessionDescription),
    Answer(SessionDescription),
    Ice(IceCandidate),
}

#[derive(Debug)]
struct PeerFailure {
    user_id: String,
    error: CallError,
}

struct PeerWorker {
    commands: mpsc::UnboundedSender<PeerCommand>,
    handle: JoinHandle<()>,
}

struct Session {
    meeting_id: String,
    user_id: String,
    manager: ConnectionManager,
    roster: Roster,
    messages: Vec<ChatMessage>,
    workers: HashMap<String, PeerWorker>,
    failures: mpsc::UnboundedSender<PeerFailure>,
    pump: Option<JoinHandle<()>>,
}

impl Session {
    fn worker(&mut self, user_id: &str) -> mpsc::UnboundedSender<PeerCommand> {
        if let Some(worker) = self.workers.get(user_id) {
            return worker.commands.clone();
        }
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_peer_worker(
            self.manager.clone(),
            user_id.to_owned(),
            rx,
            self.failures.clone(),
        ));
        self.workers.insert(
            user_id.to_owned(),
            PeerWorker {
                commands: commands.clone(),
                handle,
            },
        );
        commands
    }

    fn abort_tasks(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        for (_, worker) in self.workers.drain() {
            worker.handle.abort();
        }
    }

    fn local_participant(&mut self) -> Option<&mut Participant> {
        let user_id = self.user_id.clone();
        self.roster.get_mut(&user_id)
    }
}

struct Inner {
    config: Arc<Config>,
    media: Arc<dyn MediaAcquisition>,
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn SignalingChannel>,
    hooks: CallHooks,
    session: Mutex<Option<Session>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let Some(mut session) = self.session.get_mut().take() else {
            return;
        };
        session.abort_tasks();
        self.signaling.detach();
        let manager = session.manager.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { manager.cleanup().await });
        } else if let Some(local) = manager.local_stream() {
            local.stop();
        }
        debug!(meeting_id = %session.meeting_id, "call session dropped");
    }
}

#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<Inner>,
}

impl CallOrchestrator {
    pub fn new(
        config: Config,
        media: Arc<dyn MediaAcquisition>,
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                media,
                connector,
                signaling,
                hooks: CallHooks::default(),
                session: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn on_participant_joined<F>(&self, hook: F)
    where
        F: Fn(&Participant) + Send + Sync + 'static,
    {
        self.inner.hooks.set_participant_joined(Arc::new(hook));
    }

    pub fn on_participant_left<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.hooks.set_participant_left(Arc::new(hook));
    }

    /// Fires when a participant's announced media flags change, including
    /// the local participant's.
    pub fn on_participant_updated<F>(&self, hook: F)
    where
        F: Fn(&Participant) + Send + Sync + 'static,
    {
        self.inner.hooks.set_participant_updated(Arc::new(hook));
    }

    pub fn on_stream_received<F>(&self, hook: F)
    where
        F: Fn(&str, &StreamHandle) + Send + Sync + 'static,
    {
        self.inner.hooks.set_stream_received(Arc::new(hook));
    }

    pub fn on_connection_quality_changed<F>(&self, hook: F)
    where
        F: Fn(&str, ConnectionQuality) + Send + Sync + 'static,
    {
        self.inner.hooks.set_quality_changed(Arc::new(hook));
    }

    pub fn on_message_received<F>(&self, hook: F)
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.inner.hooks.set_message_received(Arc::new(hook));
    }

    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&CallError) + Send + Sync + 'static,
    {
        self.inner.hooks.set_error(Arc::new(hook));
    }

    /// Acquires camera and microphone, joins `meeting_id` and opens a link to
    /// everyone already present. Any failure here ends the attempt.
    pub async fn initialize(&self, meeting_id: &str, user_id: &str) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_active() {
            let err = CallError::AlreadyInCall;
            self.report(&err);
            return Err(err);
        }

        let (manager, manager_events) = ConnectionManager::new(
            meeting_id,
            Arc::clone(&self.inner.config),
            Arc::clone(&self.inner.media),
            Arc::clone(&self.inner.connector),
            Arc::clone(&self.inner.signaling),
        );
        // subscribe first so nothing sent right after the join is missed
        let signals = self.inner.signaling.subscribe();

        let local = match manager.initialize_local_stream(true, true).await {
            Ok(local) => local,
            Err(err) => {
                self.inner.signaling.detach();
                self.report(&err);
                return Err(err);
            }
        };
        let local_participant = Participant::local(user_id, local);

        let ack = match self.inner.signaling.join(meeting_id, user_id).await {
            Ok(ack) => ack,
            Err(source) => {
                manager.cleanup().await;
                self.inner.signaling.detach();
                let err = CallError::Join {
                    meeting_id: meeting_id.to_owned(),
                    source,
                };
                self.report(&err);
                return Err(err);
            }
        };
        info!(
            meeting_id,
            user_id,
            present = ack.participants.len(),
            "joined meeting"
        );

        let (failures, failures_rx) = mpsc::unbounded_channel();
        let mut roster = Roster::new();
        roster.add(local_participant.clone());
        {
            let mut slot = self.inner.session.lock();
            *slot = Some(Session {
                meeting_id: meeting_id.to_owned(),
                user_id: user_id.to_owned(),
                manager: manager.clone(),
                roster,
                messages: Vec::new(),
                workers: HashMap::new(),
                failures,
                pump: None,
            });
            let pump = tokio::spawn(run_session_pump(
                Arc::downgrade(&self.inner),
                signals,
                manager_events,
                failures_rx,
            ));
            if let Some(session) = slot.as_mut() {
                session.pump = Some(pump);
            }
        }
        self.inner.hooks.participant_joined(&local_participant);

        for peer in ack.participants.iter().filter(|p| p.as_str() != user_id) {
            let Some(worker) = self.add_remote(peer) else {
                continue;
            };
            if let Err(err) = manager.create_peer_connection(peer).await {
                self.handle_failure(peer, err).await;
                continue;
            }
            let offer = self.inner.config.offer_policy.should_offer(user_id, peer);
            let _ = worker.send(PeerCommand::Connect { offer });
        }
        Ok(())
    }

    /// `audio_enabled == false` mutes the microphone.
    pub async fn toggle_mute(&self, audio_enabled: bool) -> Result<()> {
        let manager = self.manager_or_report()?;
        if let Err(err) = manager.toggle_audio(audio_enabled) {
            self.report(&err);
            return Err(err);
        }
        self.update_local(|p| p.is_muted = !audio_enabled).await;
        Ok(())
    }

    pub async fn toggle_video(&self, enabled: bool) -> Result<()> {
        let manager = self.manager_or_report()?;
        if let Err(err) = manager.toggle_video(enabled) {
            self.report(&err);
            return Err(err);
        }
        self.update_local(|p| p.is_video_on = enabled).await;
        Ok(())
    }

    /// Starts sharing the screen, or stops if already sharing. Returns
    /// whether the screen is being shared afterwards.
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        let manager = self.manager_or_report()?;
        let result = if manager.is_screen_sharing() {
            manager.stop_screen_share().await
        } else {
            manager.start_screen_share().await
        };
        if let Err(err) = result {
            self.report(&err);
            return Err(err);
        }
        self.sync_screen_share_flag(&manager).await;
        Ok(manager.is_screen_sharing())
    }

    /// The capture can end at any moment, so the flag is read from the
    /// manager under the session lock.
    async fn sync_screen_share_flag(&self, manager: &ConnectionManager) {
        let manager = manager.clone();
        self.update_local(move |p| p.is_screen_sharing = manager.is_screen_sharing())
            .await;
    }

    pub async fn send_message(&self, text: &str) -> Result<ChatMessage> {
        let ids = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|s| (s.meeting_id.clone(), s.user_id.clone()));
        let Some((meeting_id, user_id)) = ids else {
            let err = CallError::NotInCall;
            self.report(&err);
            return Err(err);
        };

        let sent = self
            .inner
            .signaling
            .send(OutboundSignal::Message {
                meeting_id,
                message: text.to_owned(),
            })
            .await;
        if let Err(source) = sent {
            let err = CallError::Signaling(source);
            self.report(&err);
            return Err(err);
        }

        let message = ChatMessage::now(user_id, text);
        if let Some(session) = self.inner.session.lock().as_mut() {
            session.messages.push(message.clone());
        }
        Ok(message)
    }

    /// Announces the leave and tears the session down. Calling it with no
    /// active session does nothing.
    pub async fn end_call(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let Some(mut session) = self.inner.session.lock().take() else {
            return;
        };
        session.abort_tasks();

        let leave = OutboundSignal::LeaveMeeting {
            meeting_id: session.meeting_id.clone(),
            user_id: session.user_id.clone(),
        };
        if let Err(e) = self.inner.signaling.send(leave).await {
            warn!(meeting_id = %session.meeting_id, "failed to announce leave: {e}");
        }
        session.manager.cleanup().await;
        self.inner.signaling.detach();
        info!(meeting_id = %session.meeting_id, "call ended");
    }

    pub fn is_active(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    pub fn meeting_id(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.meeting_id.clone())
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.roster.participants().cloned().collect())
            .unwrap_or_default()
    }

    pub fn participant(&self, user_id: &str) -> Option<Participant> {
        self.inner
            .session
            .lock()
            .as_ref()
            .and_then(|s| s.roster.get(user_id).cloned())
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// The active session's connection manager.
    pub fn connections(&self) -> Option<ConnectionManager> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.manager.clone())
    }

    fn manager_or_report(&self) -> Result<ConnectionManager> {
        self.connections().ok_or_else(|| {
            let err = CallError::NotInCall;
            self.report(&err);
            err
        })
    }

    fn report(&self, err: &CallError) {
        match err.severity() {
            Severity::Fatal => error!("call error: {err}"),
            Severity::Link | Severity::Control => warn!("call error: {err}"),
        }
        self.inner.hooks.error(err);
    }

    /// Applies `change` to the local participant, then tells the room.
    async fn update_local(&self, change: impl FnOnce(&mut Participant)) {
        let (participant, meeting_id) = {
            let mut slot = self.inner.session.lock();
            let Some(session) = slot.as_mut() else {
                return;
            };
            let meeting_id = session.meeting_id.clone();
            let Some(local) = session.local_participant() else {
                return;
            };
            change(local);
            (local.clone(), meeting_id)
        };

        let announce = OutboundSignal::MediaState {
            meeting_id,
            user_id: participant.user_id.clone(),
            state: participant.media_state(),
        };
        if let Err(e) = self.inner.signaling.send(announce).await {
            debug!("media state announcement failed: {e}");
        }
        self.inner.hooks.participant_updated(&participant);
    }

    /// Adds a remote participant. Returns its worker only when the
    /// participant is new.
    fn add_remote(&self, user_id: &str) -> Option<mpsc::UnboundedSender<PeerCommand>> {
        let (participant, worker) = {
            let mut slot = self.inner.session.lock();
            let session = slot.as_mut()?;
            let participant = Participant::remote(user_id);
            if !session.roster.add(participant.clone()) {
                return None;
            }
            (participant, session.worker(user_id))
        };
        info!(user_id, "participant joined");
        self.inner.hooks.participant_joined(&participant);
        Some(worker)
    }

    /// Closes the link and removes the participant. The left hook fires
    /// only for a participant that was still in the roster.
    async fn remove_participant(&self, user_id: &str) {
        let (removed, manager) = {
            let mut slot = self.inner.session.lock();
            let Some(session) = slot.as_mut() else {
                return;
            };
            if user_id == session.user_id {
                return;
            }
            if let Some(worker) = session.workers.remove(user_id) {
                worker.handle.abort();
            }
            (session.roster.remove(user_id), session.manager.clone())
        };
        manager.close_peer(user_id).await;
        if removed.is_some() {
            info!(user_id, "participant left");
            self.inner.hooks.participant_left(user_id);
        }
    }

    async fn handle_failure(&self, user_id: &str, err: CallError) {
        self.report(&err);
        if err.drops_peer() {
            self.remove_participant(user_id).await;
        }
    }

    fn command(&self, user_id: &str, command: PeerCommand) {
        let worker = self
            .inner
            .session
            .lock()
            .as_ref()
            .and_then(|s| s.workers.get(user_id).map(|w| w.commands.clone()));
        match worker {
            Some(worker) => {
                let _ = worker.send(command);
            }
            None => warn!(user_id, ?command, "no link for signal, dropping"),
        }
    }

    fn local_user_id(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.user_id.clone())
    }

    async fn on_signal(&self, signal: InboundSignal) {
        let Some(me) = self.local_user_id() else {
            return;
        };
        match signal {
            InboundSignal::ParticipantJoined { user_id } if user_id != me => {
                if let Some(worker) = self.add_remote(&user_id) {
                    let offer = self.inner.config.offer_policy.should_offer(&me, &user_id);
                    let _ = worker.send(PeerCommand::Connect { offer });
                }
            }
            InboundSignal::ParticipantLeft { user_id } => {
                self.remove_participant(&user_id).await;
            }
            InboundSignal::Offer { from, offer } if from != me => {
                // an offer can arrive before the join announcement
                self.add_remote(&from);
                self.command(&from, PeerCommand::Offer(offer));
            }
            InboundSignal::Answer { from, answer } => {
                self.command(&from, PeerCommand::Answer(answer));
            }
            InboundSignal::IceCandidate { from, candidate } => {
                self.command(&from, PeerCommand::Ice(candidate));
            }
            InboundSignal::Message { from, message } => {
                let message = ChatMessage::now(from, message);
                if let Some(session) = self.inner.session.lock().as_mut() {
                    session.messages.push(message.clone());
                }
                self.inner.hooks.message_received(&message);
            }
            InboundSignal::ParticipantState { from, state } => {
                self.apply_remote_state(&from, state);
            }
            other => debug!(?other, "ignoring signal about the local user"),
        }
    }

    fn signaling_closed(&self) {
        if self.is_active() {
            self.report(&CallError::Signaling(SignalingError::Closed));
        }
    }

    fn apply_remote_state(&self, user_id: &str, state: MediaState) {
        let updated = {
            let mut slot = self.inner.session.lock();
            slot.as_mut()
                .and_then(|s| s.roster.get_mut(user_id))
                .filter(|p| !p.is_local)
                .map(|p| {
                    p.apply_media_state(state);
                    p.clone()
                })
        };
        if let Some(participant) = updated {
            self.inner.hooks.participant_updated(&participant);
        }
    }

    async fn on_manager_event(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::StreamReceived { user_id, stream } => {
                let handle = StreamHandle::Remote(stream);
                let known = {
                    let mut slot = self.inner.session.lock();
                    match slot.as_mut().and_then(|s| s.roster.get_mut(&user_id)) {
                        Some(participant) => {
                            participant.stream = Some(handle.clone());
                            true
                        }
                        None => false,
                    }
                };
                if known {
                    self.inner.hooks.stream_received(&user_id, &handle);
                }
            }
            ManagerEvent::StateChanged { user_id, state } => {
                debug!(user_id = %user_id, %state, "link state");
            }
            ManagerEvent::LinkLost { user_id, state } => {
                let err = CallError::ConnectionLost {
                    user_id: user_id.clone(),
                    state,
                };
                self.handle_failure(&user_id, err).await;
            }
            ManagerEvent::Quality { user_id, quality } => {
                let present = self
                    .inner
                    .session
                    .lock()
                    .as_ref()
                    .is_some_and(|s| s.roster.contains(&user_id));
                if present {
                    self.inner.hooks.quality_changed(&user_id, quality);
                }
            }
            ManagerEvent::LinkError { user_id, error } => {
                self.handle_failure(&user_id, error).await;
            }
            ManagerEvent::ScreenShareEnded => {
                if let Some(manager) = self.connections() {
                    self.sync_screen_share_flag(&manager).await;
                }
            }
        }
    }
}

async fn run_session_pump(
    orchestrator: Weak<Inner>,
    mut signals: mpsc::UnboundedReceiver<InboundSignal>,
    mut events: mpsc::UnboundedReceiver<ManagerEvent>,
    mut failures: mpsc::UnboundedReceiver<PeerFailure>,
) {
    let mut signals_open = true;
    loop {
        tokio::select! {
            signal = signals.recv(), if signals_open => {
                let Some(inner) = orchestrator.upgrade() else { break };
                let call = CallOrchestrator { inner };
                match signal {
                    Some(signal) => call.on_signal(signal).await,
                    None => {
                        signals_open = false;
                        call.signaling_closed();
                    }
                }
            }
            Some(event) = events.recv() => {
                let Some(inner) = orchestrator.upgrade() else { break };
                CallOrchestrator { inner }.on_manager_event(event).await;
            }
            Some(failure) = failures.recv() => {
                let Some(inner) = orchestrator.upgrade() else { break };
                CallOrchestrator { inner }
                    .handle_failure(&failure.user_id, failure.error)
                    .await;
            }
            else => break,
        }
    }
    debug!("session event pump stopped");
}

async fn run_peer_worker(
    manager: ConnectionManager,
    user_id: String,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    failures: mpsc::UnboundedSender<PeerFailure>,
) {
    while let Some(command) = commands.recv().await {
        let result = match command {
            PeerCommand::Connect { offer } => match manager.create_peer_connection(&user_id).await {
                Ok(_) if offer => manager.create_offer(&user_id).await,
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            },
            PeerCommand::Offer(offer) => manager.handle_offer(&user_id, offer).await.map(|_| ()),
            PeerCommand::Answer(answer) => manager.handle_answer(&user_id, answer).await,
            PeerCommand::Ice(candidate) => manager.handle_ice_candidate(&user_id, candidate).await,
        };
        if let Err(error) = result {
            let failure = PeerFailure {
                user_id: user_id.clone(),
                error,
            };
            if failures.send(failure).is_err() {
                break;
            }
        }
    }
}
