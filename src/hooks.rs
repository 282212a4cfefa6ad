//! Presentation-layer callbacks.
//!
//! Each hook is a single slot: registering replaces the previous callback.
//! Callbacks run on the session's event task and must not block.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::CallError;
use crate::metrics::ConnectionQuality;
use crate::roster::{ChatMessage, Participant, StreamHandle};

pub type ParticipantHook = Arc<dyn Fn(&Participant) + Send + Sync>;
pub type LeftHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type StreamHook = Arc<dyn Fn(&str, &StreamHandle) + Send + Sync>;
pub type QualityHook = Arc<dyn Fn(&str, ConnectionQuality) + Send + Sync>;
pub type MessageHook = Arc<dyn Fn(&ChatMessage) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&CallError) + Send + Sync>;

struct Slot<F: ?Sized> {
    hook: RwLock<Option<Arc<F>>>,
}

impl<F: ?Sized> Default for Slot<F> {
    fn default() -> Self {
        Self {
            hook: RwLock::new(None),
        }
    }
}

impl<F: ?Sized> Slot<F> {
    fn set(&self, hook: Arc<F>) {
        *self.hook.write() = Some(hook);
    }

    /// Cloned out so the callback runs without the lock held.
    fn get(&self) -> Option<Arc<F>> {
        self.hook.read().clone()
    }
}

#[derive(Default)]
pub struct CallHooks {
    participant_joined: Slot<dyn Fn(&Participant) + Send + Sync>,
    participant_left: Slot<dyn Fn(&str) + Send + Sync>,
    participant_updated: Slot<dyn Fn(&Participant) + Send + Sync>,
    stream_received: Slot<dyn Fn(&str, &StreamHandle) + Send + Sync>,
    quality_changed: Slot<dyn Fn(&str, ConnectionQuality) + Send + Sync>,
    message_received: Slot<dyn Fn(&ChatMessage) + Send + Sync>,
    error: Slot<dyn Fn(&CallError) + Send + Sync>,
}

impl CallHooks {
    pub fn set_participant_joined(&self, hook: ParticipantHook) {
        self.participant_joined.set(hook);
    }

    pub fn set_participant_left(&self, hook: LeftHook) {
        self.participant_left.set(hook);
    }

    pub fn set_participant_updated(&self, hook: ParticipantHook) {
        self.participant_updated.set(hook);
    }

    pub fn set_stream_received(&self, hook: StreamHook) {
        self.stream_received.set(hook);
    }

    pub fn set_quality_changed(&self, hook: QualityHook) {
        self.quality_changed.set(hook);
    }

    pub fn set_message_received(&self, hook: MessageHook) {
        self.message_received.set(hook);
    }

    pub fn set_error(&self, hook: ErrorHook) {
        self.error.set(hook);
    }

    pub(crate) fn participant_joined(&self, participant: &Participant) {
        if let Some(hook) = self.participant_joined.get() {
            hook(participant);
        }
    }

    pub(crate) fn participant_left(&self, user_id: &str) {
        if let Some(hook) = self.participant_left.get() {
            hook(user_id);
        }
    }

    pub(crate) fn participant_updated(&self, participant: &Participant) {
        if let Some(hook) = self.participant_updated.get() {
            hook(participant);
        }
    }

    pub(crate) fn stream_received(&self, user_id: &str, stream: &StreamHandle) {
        if let Some(hook) = self.stream_received.get() {
            hook(user_id, stream);
        }
    }

    pub(crate) fn quality_changed(&self, user_id: &str, quality: ConnectionQuality) {
        if let Some(hook) = self.quality_changed.get() {
            hook(user_id, quality);
        }
    }

    pub(crate) fn message_received(&self, message: &ChatMessage) {
        if let Some(hook) = self.message_received.get() {
            hook(message);
        }
    }

    pub(crate) fn error(&self, error: &CallError) {
        if let Some(hook) = self.error.get() {
            hook(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn last_registration_wins() {
        let hooks = CallHooks::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        hooks.set_participant_left(Arc::new(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = Arc::clone(&second);
        hooks.set_participant_left(Arc::new(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        hooks.participant_left("b");
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unset_hooks_are_skipped() {
        let hooks = CallHooks::default();
        hooks.error(&CallError::NotInCall);
        hooks.message_received(&ChatMessage::now("a", "hi"));
    }
}
