//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use super::AgentConfig;
use crate::types::{DeviceId, SessionRetention};

/// Configuration for the `tetherd` daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Relay WebSocket URL
    pub relay_url: String,

    /// Stable device id; generated and persisted on first run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,

    /// Name shown on the paired device (defaults to hostname)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    /// Auth token issued by the relay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_token: Option<String>,

    /// Session settings
    pub session: SessionConfig,

    /// Transport settings
    pub transport: TransportConfig,

    /// Agent loop settings
    pub agent: AgentConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            relay_url: "wss://relay.tether.sh/ws".to_string(),
            device_id: None,
            device_name: None,
            relay_token: None,
            session: SessionConfig::default(),
            transport: TransportConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Get the device name, falling back to hostname
    pub fn device_name(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }
}

/// Settings for spawned shell sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to spawn (None = $SHELL or platform default)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Columns used when a create command omits them
    pub default_cols: u16,

    /// Rows used when a create command omits them
    pub default_rows: u16,

    /// Bytes of recent output kept per session
    pub output_buffer_bytes: usize,

    /// What to do with sessions when the peer is lost for good
    pub retention: SessionRetention,

    /// Extra environment variables for sessions
    pub env: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        Self {
            shell: None,
            default_cols: 80,
            default_rows: 24,
            output_buffer_bytes: 256 * 1024,
            retention: SessionRetention::Keep,
            env,
        }
    }
}

/// Settings for the direct and relayed transports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,

    /// Upper bound on waiting for local ICE gathering before sending the offer
    #[serde(with = "duration_millis")]
    pub gathering_timeout: Duration,

    /// Relay reconnect backoff
    pub backoff: BackoffConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            gathering_timeout: Duration::from_millis(3000),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
