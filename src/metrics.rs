use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::transport::{InboundVideoStats, PeerTransport};

/// Loss ratio above which a link is poor.
pub const POOR_LOSS_RATIO: f64 = 0.10;

/// Loss ratio above which a link is medium.
pub const MEDIUM_LOSS_RATIO: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Good,
    Medium,
    Poor,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionQuality::Good => write!(f, "good"),
            ConnectionQuality::Medium => write!(f, "medium"),
            ConnectionQuality::Poor => write!(f, "poor"),
        }
    }
}

impl ConnectionQuality {
    pub fn from_loss_ratio(loss: f64) -> Self {
        if loss > POOR_LOSS_RATIO {
            ConnectionQuality::Poor
        } else if loss > MEDIUM_LOSS_RATIO {
            ConnectionQuality::Medium
        } else {
            ConnectionQuality::Good
        }
    }

    pub fn from_stats(stats: &InboundVideoStats) -> Self {
        Self::from_loss_ratio(loss_ratio(stats))
    }
}

/// Lost packets over expected packets; zero before anything arrived.
pub fn loss_ratio(stats: &InboundVideoStats) -> f64 {
    let expected = stats.packets_received + stats.packets_lost;
    if expected == 0 {
        0.0
    } else {
        stats.packets_lost as f64 / expected as f64
    }
}

/// Periodically samples one link's inbound video and reports the
/// classification whenever it changes. Dropping the monitor stops it.
pub struct QualityMonitor {
    handle: JoinHandle<()>,
}

impl QualityMonitor {
    /// `report` returns `false` once nobody is listening, which ends sampling.
    pub fn start<F>(transport: Arc<dyn PeerTransport>, period: Duration, report: F) -> Self
    where
        F: Fn(ConnectionQuality) -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            let mut last = None;
            loop {
                ticker.tick().await;
                let Some(stats) = transport.inbound_video_stats().await else {
                    continue;
                };
                let quality = ConnectionQuality::from_stats(&stats);
                if last != Some(quality) {
                    last = Some(quality);
                    if !report(quality) {
                        break;
                    }
                }
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
