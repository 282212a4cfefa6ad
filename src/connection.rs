use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

use crate::transport::TransportState;

/// Lifecycle of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Idle,
    Offering,
    Answering,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Idle => write!(f, "Idle"),
            LinkState::Offering => write!(f, "Offering"),
            LinkState::Answering => write!(f, "Answering"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Failed => write!(f, "Failed"),
            LinkState::Closed => write!(f, "Closed"),
        }
    }
}

/// Inputs that drive [`LinkState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInput {
    /// Local offer created, set and sent.
    OfferSent,
    /// Remote offer applied, local answer created, set and sent.
    AnswerSent,
    /// The native connection reported a new state.
    Transport(TransportState),
    /// Explicit close (leave, call end, or removal after a failure).
    Teardown,
}

impl LinkState {
    /// Returns the next state, or `None` when the input causes no transition.
    pub fn next(self, input: LinkInput) -> Option<LinkState> {
        use LinkState::*;

        if self == Closed {
            return None;
        }

        match (self, input) {
            (_, LinkInput::Teardown) => Some(Closed),
            (Idle, LinkInput::OfferSent) => Some(Offering),
            (Idle, LinkInput::AnswerSent) => Some(Answering),
            (Idle | Offering | Answering, LinkInput::Transport(TransportState::Connected)) => {
                Some(Connected)
            }
            (
                Idle | Offering | Answering | Connected,
                LinkInput::Transport(TransportState::Disconnected),
            ) => Some(Disconnected),
            (
                Idle | Offering | Answering | Connected | Disconnected,
                LinkInput::Transport(TransportState::Failed),
            ) => Some(Failed),
            (_, LinkInput::Transport(TransportState::Closed)) => Some(Closed),
            _ => None,
        }
    }

    /// Disconnected and Failed are treated as the remote having left.
    pub fn is_lost(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed)
    }
}

/// Publishes a link's state to any number of observers.
#[derive(Clone)]
pub struct LinkMonitor {
    status: watch::Sender<LinkState>,
}

impl LinkMonitor {
    pub fn new() -> Self {
        let (status, _) = watch::channel(LinkState::Idle);
        Self { status }
    }

    pub fn state(&self) -> LinkState {
        *self.status.borrow()
    }

    /// Applies `input`, returning `(previous, next)` when a transition fired.
    pub fn apply(&self, input: LinkInput) -> Option<(LinkState, LinkState)> {
        let mut changed = None;
        self.status.send_if_modified(|state| match state.next(input) {
            Some(next) => {
                changed = Some((*state, next));
                *state = next;
                true
            }
            None => false,
        });
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.status.subscribe()
    }
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}
