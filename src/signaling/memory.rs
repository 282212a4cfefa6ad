//! In-process signaling server for running several call sessions in one
//! process.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{InboundSignal, JoinAck, OutboundSignal, SignalingChannel};
use crate::error::SignalingError;

type Listener = Arc<Mutex<Option<mpsc::UnboundedSender<InboundSignal>>>>;

#[derive(Default)]
struct HubState {
    /// meeting id -> user id -> that client's listener slot
    meetings: HashMap<String, BTreeMap<String, Listener>>,
    rejected: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct SignalingHub {
    state: Arc<Mutex<HubState>>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> HubClient {
        HubClient {
            hub: self.clone(),
            listener: Arc::new(Mutex::new(None)),
            membership: Mutex::new(None),
        }
    }

    /// Joins to `meeting_id` will be refused from now on.
    pub fn reject_meeting(&self, meeting_id: &str) {
        self.state.lock().rejected.insert(meeting_id.to_owned());
    }

    pub fn members(&self, meeting_id: &str) -> Vec<String> {
        self.state
            .lock()
            .meetings
            .get(meeting_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Pushes a signal straight to one member, as a server would.
    pub fn deliver(&self, meeting_id: &str, user_id: &str, signal: InboundSignal) -> bool {
        let listener = self
            .state
            .lock()
            .meetings
            .get(meeting_id)
            .and_then(|m| m.get(user_id).cloned());
        match listener {
            Some(listener) => push(&listener, signal),
            None => false,
        }
    }

    fn broadcast(&self, meeting_id: &str, except: &str, signal: InboundSignal) {
        let listeners: Vec<Listener> = self
            .state
            .lock()
            .meetings
            .get(meeting_id)
            .map(|m| {
                m.iter()
                    .filter(|(user, _)| user.as_str() != except)
                    .map(|(_, l)| Arc::clone(l))
                    .collect()
            })
            .unwrap_or_default();
        for listener in listeners {
            push(&listener, signal.clone());
        }
    }

    fn leave(&self, meeting_id: &str, user_id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state
                .meetings
                .get_mut(meeting_id)
                .map(|m| m.remove(user_id).is_some())
                .unwrap_or(false);
            if state.meetings.get(meeting_id).is_some_and(|m| m.is_empty()) {
                state.meetings.remove(meeting_id);
            }
            removed
        };
        if removed {
            self.broadcast(
                meeting_id,
                user_id,
                InboundSignal::ParticipantLeft {
                    user_id: user_id.to_owned(),
                },
            );
        }
        removed
    }
}

fn push(listener: &Listener, signal: InboundSignal) -> bool {
    match listener.lock().as_ref() {
        Some(tx) => tx.send(signal).is_ok(),
        None => {
            debug!("dropping signal for a detached client");
            false
        }
    }
}

/// One participant's connection to a [`SignalingHub`].
pub struct HubClient {
    hub: SignalingHub,
    listener: Listener,
    membership: Mutex<Option<(String, String)>>,
}

impl HubClient {
    fn membership(&self) -> Result<(String, String), SignalingError> {
        self.membership
            .lock()
            .clone()
            .ok_or(SignalingError::NotJoined)
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        if let Some((meeting_id, user_id)) = self.membership.lock().take() {
            self.hub.leave(&meeting_id, &user_id);
        }
    }
}

#[async_trait]
impl SignalingChannel for HubClient {
    async fn join(&self, meeting_id: &str, user_id: &str) -> Result<JoinAck, SignalingError> {
        let participants = {
            let mut state = self.hub.state.lock();
            if state.rejected.contains(meeting_id) {
                return Err(SignalingError::Rejected(format!(
                    "meeting {meeting_id} is not accepting participants"
                )));
            }
            let room = state.meetings.entry(meeting_id.to_owned()).or_default();
            let present: Vec<String> = room.keys().filter(|u| *u != user_id).cloned().collect();
            room.insert(user_id.to_owned(), Arc::clone(&self.listener));
            present
        };
        *self.membership.lock() = Some((meeting_id.to_owned(), user_id.to_owned()));

        self.hub.broadcast(
            meeting_id,
            user_id,
            InboundSignal::ParticipantJoined {
                user_id: user_id.to_owned(),
            },
        );
        Ok(JoinAck { participants })
    }

    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        let (meeting_id, from) = self.membership()?;

        match signal {
            OutboundSignal::JoinMeeting { .. } => {}
            OutboundSignal::LeaveMeeting { .. } => {
                self.membership.lock().take();
                self.hub.leave(&meeting_id, &from);
            }
            OutboundSignal::Offer { to, offer, .. } => {
                self.hub
                    .deliver(&meeting_id, &to, InboundSignal::Offer { from, offer });
            }
            OutboundSignal::Answer { to, answer, .. } => {
                self.hub
                    .deliver(&meeting_id, &to, InboundSignal::Answer { from, answer });
            }
            OutboundSignal::IceCandidate { to, candidate, .. } => {
                self.hub.deliver(
                    &meeting_id,
                    &to,
                    InboundSignal::IceCandidate { from, candidate },
                );
            }
            OutboundSignal::Message { message, .. } => {
                let except = from.clone();
                self.hub
                    .broadcast(&meeting_id, &except, InboundSignal::Message { from, message });
            }
            OutboundSignal::MediaState { state, .. } => {
                let except = from.clone();
                self.hub.broadcast(
                    &meeting_id,
                    &except,
                    InboundSignal::ParticipantState { from, state },
                );
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SessionDescription;

    #[tokio::test]
    async fn join_reports_existing_members_and_announces_newcomer() {
        let hub = SignalingHub::new();
        let a = hub.client();
        let mut a_rx = a.subscribe();
        assert!(a.join("m1", "A").await.unwrap().participants.is_empty());

        let b = hub.client();
        let _b_rx = b.subscribe();
        let ack = b.join("m1", "B").await.unwrap();
        assert_eq!(ack.participants, vec!["A".to_string()]);
        assert_eq!(
            a_rx.recv().await.unwrap(),
            InboundSignal::ParticipantJoined {
                user_id: "B".into()
            }
        );
        assert_eq!(hub.members("m1"), vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn targeted_signals_reach_only_the_recipient() {
        let hub = SignalingHub::new();
        let (a, b, c) = (hub.client(), hub.client(), hub.client());
        let _a_rx = a.subscribe();
        let mut b_rx = b.subscribe();
        let mut c_rx = c.subscribe();
        a.join("m1", "A").await.unwrap();
        b.join("m1", "B").await.unwrap();
        c.join("m1", "C").await.unwrap();
        // drain join announcements
        while let Ok(signal) = b_rx.try_recv() {
            assert!(matches!(signal, InboundSignal::ParticipantJoined { .. }));
        }

        a.send(OutboundSignal::Offer {
            meeting_id: "m1".into(),
            to: "B".into(),
            offer: SessionDescription::offer("v=0"),
        })
        .await
        .unwrap();

        assert!(matches!(
            b_rx.recv().await.unwrap(),
            InboundSignal::Offer { from, .. } if from == "A"
        ));
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_and_rejection() {
        let hub = SignalingHub::new();
        hub.reject_meeting("locked");
        let a = hub.client();
        assert!(matches!(
            a.join("locked", "A").await,
            Err(SignalingError::Rejected(_))
        ));
        assert!(matches!(
            a.send(OutboundSignal::Message {
                meeting_id: "locked".into(),
                message: "hi".into(),
            })
            .await,
            Err(SignalingError::NotJoined)
        ));

        let b = hub.client();
        let mut b_rx = b.subscribe();
        b.join("m1", "B").await.unwrap();
        {
            let c = hub.client();
            c.join("m1", "C").await.unwrap();
        }
        assert_eq!(
            b_rx.recv().await.unwrap(),
            InboundSignal::ParticipantJoined {
                user_id: "C".into()
            }
        );
        assert_eq!(
            b_rx.recv().await.unwrap(),
            InboundSignal::ParticipantLeft {
                user_id: "C".into()
            }
        );
    }
}
