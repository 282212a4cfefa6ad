use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{InboundSignal, JoinAck, OutboundSignal, SignalingChannel};
use crate::error::SignalingError;

/// Server replies to `join-meeting`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum JoinReply {
    Joined {
        #[serde(default)]
        participants: Vec<String>,
    },
    JoinRejected {
        reason: String,
    },
}

type PendingJoin = oneshot::Sender<Result<JoinAck, SignalingError>>;

/// Signaling over a WebSocket carrying one JSON object per text frame.
pub struct WsSignalingChannel {
    tx: mpsc::Sender<String>,
    subscriber: Arc<Mutex<Option<mpsc::UnboundedSender<InboundSignal>>>>,
    pending_join: Arc<Mutex<Option<PendingJoin>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsSignalingChannel {
    pub async fn connect(url: &str) -> Result<Self, SignalingError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(100);
        let subscriber: Arc<Mutex<Option<mpsc::UnboundedSender<InboundSignal>>>> =
            Arc::new(Mutex::new(None));
        let pending_join: Arc<Mutex<Option<PendingJoin>>> = Arc::new(Mutex::new(None));

        // Handle outgoing messages
        let writer = tokio::spawn(async move {
            while let Some(json) = outgoing_rx.recv().await {
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("signaling socket write failed: {e}");
                    break;
                }
            }
        });

        // Handle incoming messages
        let inbound = Arc::clone(&subscriber);
        let pending = Arc::clone(&pending_join);
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("signaling socket read failed: {e}");
                        break;
                    }
                };

                if let Ok(reply) = serde_json::from_str::<JoinReply>(&text) {
                    let result = match reply {
                        JoinReply::Joined { participants } => Ok(JoinAck { participants }),
                        JoinReply::JoinRejected { reason } => Err(SignalingError::Rejected(reason)),
                    };
                    match pending.lock().take() {
                        Some(waiter) => {
                            let _ = waiter.send(result);
                        }
                        None => debug!("join reply with no join in flight"),
                    }
                    continue;
                }

                match serde_json::from_str::<InboundSignal>(&text) {
                    Ok(signal) => {
                        let mut slot = inbound.lock();
                        if let Some(tx) = slot.as_ref() {
                            if tx.send(signal).is_err() {
                                *slot = None;
                            }
                        }
                    }
                    Err(e) => debug!("ignoring unrecognised signaling frame: {e}"),
                }
            }

            // Fail a join that can no longer be answered
            if let Some(waiter) = pending.lock().take() {
                let _ = waiter.send(Err(SignalingError::Closed));
            }
            inbound.lock().take();
        });

        Ok(Self {
            tx: outgoing_tx,
            subscriber,
            pending_join,
            tasks: vec![writer, reader],
        })
    }

    async fn send_json(&self, signal: &OutboundSignal) -> Result<(), SignalingError> {
        let json = serde_json::to_string(signal)?;
        self.tx
            .send(json)
            .await
            .map_err(|_| SignalingError::Closed)
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn join(&self, meeting_id: &str, user_id: &str) -> Result<JoinAck, SignalingError> {
        let (waiter, reply) = oneshot::channel();
        *self.pending_join.lock() = Some(waiter);

        self.send_json(&OutboundSignal::JoinMeeting {
            meeting_id: meeting_id.to_owned(),
            user_id: user_id.to_owned(),
        })
        .await?;

        reply.await.map_err(|_| SignalingError::Closed)?
    }

    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        self.send_json(&signal).await
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.subscriber.lock() = Some(tx);
        rx
    }

    fn detach(&self) {
        self.subscriber.lock().take();
    }
}
