//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`LYNCNAT_*`)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LyncnatError, Result};
use crate::transport::TransportKind;

/// Default relay hostname
pub const DEFAULT_RELAY_HOST: &str = "www.lhings.com";

/// Default relay UDP port
pub const DEFAULT_UDP_PORT: u16 = 3478;

/// Default relay TLS port
pub const DEFAULT_TLS_PORT: u16 = 3480;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device identity and credentials
    #[serde(default)]
    pub device: DeviceConfig,

    /// Relay endpoint
    #[serde(default)]
    pub relay: RelayConfig,

    /// Session timing
    #[serde(default)]
    pub session: SessionConfig,

    /// Socket-level tuning
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| LyncnatError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| LyncnatError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Device settings
        if let Ok(name) = std::env::var("LYNCNAT_DEVICE_NAME") {
            config.device.name = name;
        }
        if let Ok(username) = std::env::var("LYNCNAT_USERNAME") {
            config.device.username = username;
        }
        if let Ok(api_key) = std::env::var("LYNCNAT_API_KEY") {
            config.device.api_key = api_key;
        }
        if let Ok(uuid) = std::env::var("LYNCNAT_DEVICE_UUID") {
            if let Ok(uuid) = uuid.parse() {
                config.device.uuid = Some(uuid);
            }
        }

        // Relay settings
        if let Ok(host) = std::env::var("LYNCNAT_RELAY_HOST") {
            config.relay.host = host;
        }
        if let Ok(kind) = std::env::var("LYNCNAT_TRANSPORT") {
            if let Ok(kind) = kind.parse() {
                config.relay.transport = kind;
            }
        }
        if let Ok(port) = std::env::var("LYNCNAT_UDP_PORT") {
            if let Ok(port) = port.parse() {
                config.relay.udp_port = port;
            }
        }
        if let Ok(port) = std::env::var("LYNCNAT_TLS_PORT") {
            if let Ok(port) = port.parse() {
                config.relay.tls_port = port;
            }
        }
        if let Ok(path) = std::env::var("LYNCNAT_CA_FILE") {
            config.relay.ca_file = Some(PathBuf::from(path));
        }

        config
    }

    /// Check fields that have no usable default.
    pub fn validate(&self) -> Result<()> {
        if self.device.name.is_empty() {
            return Err(LyncnatError::Config("device.name is empty".to_string()));
        }
        if self.device.username.is_empty() {
            return Err(LyncnatError::Config("device.username is empty".to_string()));
        }
        if self.device.api_key.is_empty() {
            return Err(LyncnatError::Config("device.api_key is empty".to_string()));
        }
        if self.session.loop_frequency_hz == 0 {
            return Err(LyncnatError::Config(
                "session.loop_frequency_hz must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Device identity and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, also the identity-store key
    pub name: String,

    /// Account username
    pub username: String,

    /// Account API key; keys the message integrity HMAC
    pub api_key: String,

    /// Pinned UUID, skips the identity store when set
    #[serde(default)]
    pub uuid: Option<uuid::Uuid>,

    /// Where name → UUID bindings are persisted
    #[serde(default = "default_identity_file")]
    pub identity_file: Option<PathBuf>,
}

fn default_identity_file() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("lyncnat").join("devices.toml"))
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            username: String::new(),
            api_key: String::new(),
            uuid: None,
            identity_file: default_identity_file(),
        }
    }
}

/// Relay endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay hostname
    pub host: String,

    /// UDP port
    pub udp_port: u16,

    /// TLS port
    pub tls_port: u16,

    /// Which transport to use
    pub transport: TransportKind,

    /// PEM file with the CA that signs the relay certificate
    pub ca_file: Option<PathBuf>,

    /// Name checked against the relay certificate; defaults to `host`
    pub server_name: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RELAY_HOST.to_string(),
            udp_port: DEFAULT_UDP_PORT,
            tls_port: DEFAULT_TLS_PORT,
            transport: TransportKind::default(),
            ca_file: None,
            server_name: None,
        }
    }
}

impl RelayConfig {
    /// Port for the selected transport
    pub fn port(&self) -> u16 {
        match self.transport {
            TransportKind::Udp => self.udp_port,
            TransportKind::Tls => self.tls_port,
        }
    }

    /// `host:port` for the selected transport
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    /// TLS server name
    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }
}

/// Session timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Main loop ticks per second
    pub loop_frequency_hz: u32,

    /// Seconds between keepalives
    pub keepalive_interval_secs: u64,

    /// Seconds without an acknowledged keepalive before reconnecting
    pub keepalive_timeout_secs: u64,

    /// First session-start retry delay in milliseconds
    pub start_retry_initial_ms: u64,

    /// How long to wait for each session-start response, in milliseconds
    pub start_timeout_ms: u64,

    /// Capacity of the per-device inbound queue
    pub inbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loop_frequency_hz: 10,
            keepalive_interval_secs: 30,
            keepalive_timeout_secs: 180, // 3 minutes
            start_retry_initial_ms: 1000,
            start_timeout_ms: 5000,
            inbound_queue: 64,
        }
    }
}

impl SessionConfig {
    /// Main loop period
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.loop_frequency_hz.max(1)))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn start_retry_initial(&self) -> Duration {
        Duration::from_millis(self.start_retry_initial_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

/// Socket-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bound on one receive poll, in milliseconds
    pub receive_timeout_ms: u64,

    /// First reconnect delay in milliseconds
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap in milliseconds
    pub reconnect_max_ms: u64,

    /// Receive buffer size in bytes
    pub buffer_size: usize,

    /// Capacity of the shared outbound queue
    pub outbound_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 40,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 20_000,
            buffer_size: 2048,
            outbound_queue: 256,
        }
    }
}

impl TransportConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.host, "www.lhings.com");
        assert_eq!(config.relay.udp_port, 3478);
        assert_eq!(config.relay.tls_port, 3480);
        assert_eq!(config.session.loop_frequency_hz, 10);
        assert_eq!(config.session.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.session.keepalive_timeout(), Duration::from_secs(180));
        assert_eq!(config.transport.receive_timeout(), Duration::from_millis(40));
        assert_eq!(config.transport.buffer_size, 2048);
    }

    #[test]
    fn test_relay_addr_follows_transport() {
        let mut relay = RelayConfig::default();
        relay.transport = TransportKind::Udp;
        assert_eq!(relay.addr(), "www.lhings.com:3478");
        relay.transport = TransportKind::Tls;
        assert_eq!(relay.addr(), "www.lhings.com:3480");
        assert_eq!(relay.server_name(), "www.lhings.com");
    }

    #[test]
    fn test_tick_period() {
        let session = SessionConfig::default();
        assert_eq!(session.tick_period(), Duration::from_millis(100));
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [device]
            name = "oven"
            username = "alice"
            api_key = "secret"
            uuid = "11111111-1111-1111-1111-111111111111"

            [relay]
            host = "relay.local"
            udp_port = 4000
            transport = "udp"

            [session]
            loop_frequency_hz = 20
            keepalive_interval_secs = 15
            keepalive_timeout_secs = 90
            start_retry_initial_ms = 500
            start_timeout_ms = 2000
            inbound_queue = 16
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.device.name, "oven");
        assert_eq!(
            config.device.uuid.unwrap().to_string(),
            "11111111-1111-1111-1111-111111111111"
        );
        assert_eq!(config.relay.transport, TransportKind::Udp);
        assert_eq!(config.relay.addr(), "relay.local:4000");
        assert_eq!(config.relay.tls_port, DEFAULT_TLS_PORT);
        assert_eq!(config.session.loop_frequency_hz, 20);
        // Missing section falls back to defaults
        assert_eq!(config.transport.reconnect_max_ms, 20_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(LyncnatError::Config(_))));
    }
}
