//! Call configuration.
//!
//! Loaded from environment variables with defaults suitable for a local
//! signaling server. The TURN credential is redacted in Debug output.

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::media::{MediaConstraints, DEFAULT_VIDEO_HEIGHT, DEFAULT_VIDEO_WIDTH};

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Default quality sampling period while a link is connected.
pub const DEFAULT_QUALITY_INTERVAL_MS: u64 = 2000;

/// Which side of a pair sends the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferPolicy {
    /// The lexicographically lower user id offers, the other side answers.
    LowerIdOffers,
    /// Both sides offer; the local-description guard drops the later offer.
    Always,
}

impl OfferPolicy {
    pub fn should_offer(self, local_user_id: &str, remote_user_id: &str) -> bool {
        match self {
            OfferPolicy::LowerIdOffers => local_user_id < remote_user_id,
            OfferPolicy::Always => true,
        }
    }
}

impl FromStr for OfferPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lower-id" => Ok(OfferPolicy::LowerIdOffers),
            "always" => Ok(OfferPolicy::Always),
            other => Err(ConfigError::InvalidValue(format!(
                "CALL_OFFER_POLICY must be 'lower-id' or 'always', got '{other}'"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: SecretString,
}

#[derive(Clone)]
pub struct Config {
    /// WebSocket signaling endpoint (default: "ws://127.0.0.1:8080").
    pub signaling_url: String,

    /// STUN servers handed to every peer connection.
    pub stun_urls: Vec<String>,

    /// Optional TURN relay.
    pub turn: Option<TurnServer>,

    /// Capture resolution target (default: 1280x720).
    pub video_width: u32,
    pub video_height: u32,

    /// Chosen capture devices, if the user picked any.
    pub video_device_id: Option<String>,
    pub audio_device_id: Option<String>,

    /// Quality sampling period (default: 2s).
    pub quality_interval: Duration,

    pub offer_policy: OfferPolicy,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_url", &self.signaling_url)
            .field("stun_urls", &self.stun_urls)
            .field(
                "turn",
                &self
                    .turn
                    .as_ref()
                    .map(|t| (t.url.as_str(), t.username.as_str(), "[REDACTED]")),
            )
            .field("video_width", &self.video_width)
            .field("video_height", &self.video_height)
            .field("video_device_id", &self.video_device_id)
            .field("audio_device_id", &self.audio_device_id)
            .field("quality_interval", &self.quality_interval)
            .field("offer_policy", &self.offer_policy)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_urls: vec![DEFAULT_STUN_URL.to_string()],
            turn: None,
            video_width: DEFAULT_VIDEO_WIDTH,
            video_height: DEFAULT_VIDEO_HEIGHT,
            video_device_id: None,
            audio_device_id: None,
            quality_interval: Duration::from_millis(DEFAULT_QUALITY_INTERVAL_MS),
            offer_policy: OfferPolicy::LowerIdOffers,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let signaling_url = vars
            .get("CALL_SIGNALING_URL")
            .cloned()
            .unwrap_or(defaults.signaling_url);

        let stun_urls = match vars.get("CALL_STUN_URLS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.stun_urls,
        };

        let turn = match vars.get("CALL_TURN_URL") {
            Some(url) => {
                let username = vars
                    .get("CALL_TURN_USERNAME")
                    .ok_or_else(|| ConfigError::MissingEnvVar("CALL_TURN_USERNAME".to_string()))?
                    .clone();
                let credential = SecretString::from(
                    vars.get("CALL_TURN_CREDENTIAL")
                        .ok_or_else(|| {
                            ConfigError::MissingEnvVar("CALL_TURN_CREDENTIAL".to_string())
                        })?
                        .clone(),
                );
                Some(TurnServer {
                    url: url.clone(),
                    username,
                    credential,
                })
            }
            None => None,
        };

        let video_width = parse_var(vars, "CALL_VIDEO_WIDTH")?.unwrap_or(defaults.video_width);
        let video_height = parse_var(vars, "CALL_VIDEO_HEIGHT")?.unwrap_or(defaults.video_height);
        if video_width == 0 || video_height == 0 {
            return Err(ConfigError::InvalidValue(
                "video resolution must be non-zero".to_string(),
            ));
        }

        let quality_interval = match parse_var::<u64>(vars, "CALL_QUALITY_INTERVAL_MS")? {
            Some(0) => {
                return Err(ConfigError::InvalidValue(
                    "CALL_QUALITY_INTERVAL_MS must be greater than zero".to_string(),
                ))
            }
            Some(ms) => Duration::from_millis(ms),
            None => defaults.quality_interval,
        };

        let offer_policy = match vars.get("CALL_OFFER_POLICY") {
            Some(raw) => raw.parse()?,
            None => defaults.offer_policy,
        };

        Ok(Self {
            signaling_url,
            stun_urls,
            turn,
            video_width,
            video_height,
            video_device_id: vars.get("CALL_VIDEO_DEVICE").cloned(),
            audio_device_id: vars.get("CALL_AUDIO_DEVICE").cloned(),
            quality_interval,
            offer_policy,
        })
    }

    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(RTCIceServer {
                urls: self.stun_urls.clone(),
                ..Default::default()
            });
        }
        if let Some(turn) = &self.turn {
            servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.expose_secret().to_string(),
                ..Default::default()
            });
        }
        servers
    }

    pub fn media_constraints(&self, video: bool, audio: bool) -> MediaConstraints {
        MediaConstraints {
            video,
            audio,
            width: self.video_width,
            height: self.video_height,
            video_device_id: self.video_device_id.clone(),
            audio_device_id: self.audio_device_id.clone(),
            ..Default::default()
        }
    }
}

fn parse_var<T: FromStr>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>, ConfigError> {
    vars.get(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| ConfigError::InvalidValue(format!("{key}='{raw}'")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.stun_urls, vec![DEFAULT_STUN_URL.to_string()]);
        assert_eq!(config.video_width, 1280);
        assert_eq!(config.video_height, 720);
        assert_eq!(config.quality_interval, Duration::from_secs(2));
        assert_eq!(config.offer_policy, OfferPolicy::LowerIdOffers);
        assert_eq!(config.ice_servers().len(), 1);
    }

    #[test]
    fn test_turn_server_is_added_and_redacted() {
        let config = Config::from_vars(&vars(&[
            ("CALL_STUN_URLS", "stun:a:3478, stun:b:3478"),
            ("CALL_TURN_URL", "turn:relay:3478"),
            ("CALL_TURN_USERNAME", "alice"),
            ("CALL_TURN_CREDENTIAL", "hunter2"),
        ]))
        .unwrap();

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:a:3478", "stun:b:3478"]);
        assert_eq!(servers[1].credential, "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_turn_requires_credentials() {
        let result = Config::from_vars(&vars(&[("CALL_TURN_URL", "turn:relay:3478")]));
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_vars(&vars(&[("CALL_VIDEO_WIDTH", "wide")])),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            Config::from_vars(&vars(&[("CALL_QUALITY_INTERVAL_MS", "0")])),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            Config::from_vars(&vars(&[("CALL_OFFER_POLICY", "sometimes")])),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_offer_policy() {
        assert!(OfferPolicy::LowerIdOffers.should_offer("A", "B"));
        assert!(!OfferPolicy::LowerIdOffers.should_offer("B", "A"));
        assert!(OfferPolicy::Always.should_offer("B", "A"));
    }
}
