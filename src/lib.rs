//! Mesh video-call core: one WebRTC peer connection per remote participant,
//! coordinated over a signaling channel.

pub mod config;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod media;
pub mod metrics;
pub mod orchestrator;
pub mod roster;
pub mod rtc;
pub mod signaling;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, OfferPolicy};
pub use connection::{LinkMonitor, LinkState};
pub use error::{CallError, MediaError, Result, Severity, SignalingError, TransportError};
pub use manager::{ConnectionManager, ManagerEvent};
pub use media::{LocalStream, LocalTrack, MediaAcquisition, SyntheticMedia};
pub use metrics::ConnectionQuality;
pub use orchestrator::CallOrchestrator;
pub use roster::{ChatMessage, Participant, StreamHandle};
pub use rtc::RtcConnector;
pub use signaling::{SignalingChannel, SignalingHub, WsSignalingChannel};
