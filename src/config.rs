use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::media::VideoConstraints;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub signaling: SignalingConfig,
    pub session: SessionConfig,
    pub ice_servers: Vec<String>,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub peer_id: String,
    pub room_id: Option<String>,
}

/// Video constraints handed to the media source per role.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub camera: VideoConstraints,
    pub screen: VideoConstraints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            session: SessionConfig::default(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            capture: CaptureConfig::default(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7003".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_id: format!("peer-{:08x}", rand::random::<u32>()),
            room_id: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera: VideoConstraints::camera(),
            screen: VideoConstraints::screen(),
        }
    }
}

impl SignalingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}
