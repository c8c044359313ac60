//! Server configuration, deserialized from JSON.
//!
//! Every field has a default so a partial (or absent) file still yields a
//! runnable configuration. The core consumes this as a value; REHASH
//! re-reads the same files and swaps the whole thing atomically.

use std::path::Path;

use serde::Deserialize;

use crate::irc::names::CaseMapping;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub features: FeaturesConfig,
    pub privacy: PrivacyConfig,
    pub channels: ChannelsConfig,
    pub opers: Vec<OperRecord>,
    pub motd: Vec<String>,
    pub oper_config: OperConfigPointer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub network: String,
    pub description: String,
    pub version: String,
    pub admin_info: String,
    pub listen: ListenConfig,
    pub ssl: SslConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    pub ssl_port: u16,
    pub enable_ssl: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_clients: usize,
    pub max_channels: usize,
    pub max_channel_users: usize,
    pub max_nick_length: usize,
    pub max_channel_length: usize,
    pub max_topic_length: usize,
    pub max_kick_length: usize,
    pub max_away_length: usize,
    /// Seconds without a PONG before the session is dropped.
    pub ping_timeout: u64,
    /// Seconds an unregistered session may linger.
    pub registration_timeout: u64,
    pub flood_lines: u32,
    pub flood_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub enable_oper: bool,
    pub enable_ctcp: bool,
    pub case_mapping: CaseMapping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// When set, plain users see masked hosts instead of real ones.
    pub hide_hosts_from_users: bool,
    /// Operators see real hosts even when masking is on.
    pub oper_bypass_host_hide: bool,
    /// Masked hosts render as `<nick>.<suffix>`.
    pub masked_host_suffix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Mode string applied to newly created channels, e.g. `+nt`.
    pub default_modes: String,
    /// Channels created at startup.
    pub auto_join: Vec<String>,
}

/// One O-line: the credentials and host mask that grant operator status.
#[derive(Debug, Clone, Deserialize)]
pub struct OperRecord {
    pub name: String,
    pub password: String,
    /// Glob matched against the requesting session's `nick!user@host`.
    #[serde(default = "default_oper_host")]
    pub host: String,
    #[serde(default)]
    pub class: Option<String>,
    /// Extra permission tokens granted to this oper on top of the class.
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Pointer to the optional secondary operator-class file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OperConfigPointer {
    pub enable: bool,
    pub file: String,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
            features: FeaturesConfig::default(),
            privacy: PrivacyConfig::default(),
            channels: ChannelsConfig::default(),
            opers: Vec::new(),
            motd: vec!["Welcome to ShoalNet.".to_owned()],
            oper_config: OperConfigPointer::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            network: "ShoalNet".to_owned(),
            description: "A single-node IRC server".to_owned(),
            version: concat!("shoal-", env!("CARGO_PKG_VERSION")).to_owned(),
            admin_info: String::new(),
            listen: ListenConfig::default(),
            ssl: SslConfig::default(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 6667,
            ssl_port: 6697,
            enable_ssl: false,
        }
    }
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            cert_file: "server.crt".to_owned(),
            key_file: "server.key".to_owned(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: 1000,
            max_channels: 100,
            max_channel_users: 500,
            max_nick_length: 30,
            max_channel_length: 50,
            max_topic_length: 307,
            max_kick_length: 307,
            max_away_length: 307,
            ping_timeout: 300,
            registration_timeout: 60,
            flood_lines: 10,
            flood_seconds: 60,
        }
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            enable_oper: true,
            enable_ctcp: true,
            case_mapping: CaseMapping::Rfc1459,
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            hide_hosts_from_users: false,
            oper_bypass_host_hide: true,
            masked_host_suffix: "users.shoal".to_owned(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            default_modes: "+nt".to_owned(),
            auto_join: Vec::new(),
        }
    }
}

impl Default for OperConfigPointer {
    fn default() -> Self {
        Self {
            enable: false,
            file: "opers.json".to_owned(),
        }
    }
}

fn default_oper_host() -> String {
    "*@localhost".to_owned()
}

/// Server name: the machine hostname when it looks like a FQDN, else a
/// local placeholder.
fn default_server_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| h.contains('.'))
        .unwrap_or_else(|| "shoal.localhost".to_owned())
}
