//! Startup parameters and the settings file.
//!
//! Command-line flags (with env fallbacks) select the listen address, the
//! connection password and an optional outbound peer link. Everything else
//! lives in a TOML settings file, `irisha.toml` by default.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("peer link must look like host:port:password, got {0:?}")]
    BadPeerSpec(String),
    #[error("invalid peer port {0:?}")]
    BadPeerPort(String),
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("ping_interval_secs ({ping}) must be below connection_timeout_secs ({timeout})")]
    PingNotBelowTimeout { ping: u64, timeout: u64 },
    #[error("domain must be a non-empty name without spaces")]
    BadDomain,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "irisha-server", about = "Line-oriented chat relay server")]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:6667", env = "IRISHA_LISTEN")]
    pub listen_addr: String,

    /// Password required from clients and inbound peer servers.
    #[arg(long, env = "IRISHA_PASSWORD")]
    pub password: Option<String>,

    /// Peer server to link to at startup (host:port:password).
    #[arg(long, env = "IRISHA_PEER")]
    pub peer: Option<PeerLink>,

    /// Path to the settings file.
    #[arg(long, default_value = "irisha.toml", env = "IRISHA_CONFIG")]
    pub config: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            password: None,
            peer: None,
            config: PathBuf::from("irisha.toml"),
        }
    }
}

/// Outbound link target given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLink {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl PeerLink {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerLink {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The password is last and may itself contain ':'.
        let mut parts = s.splitn(3, ':');
        let (Some(host), Some(port), Some(password)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ConfigError::BadPeerSpec(s.to_string()));
        };
        if host.is_empty() || password.is_empty() {
            return Err(ConfigError::BadPeerSpec(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| ConfigError::BadPeerPort(port.to_string()))?;
        Ok(PeerLink {
            host: host.to_string(),
            port,
            password: password.to_string(),
        })
    }
}

/// Values read from the settings file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// This server's name on the network.
    pub domain: String,
    /// Welcome text, sent line by line as the message of the day.
    pub welcome: String,
    /// Free-text description announced to peers.
    pub description: String,
    /// Idle time before a keepalive PING is sent.
    pub ping_interval_secs: u64,
    /// Idle time before a connection is dropped.
    pub connection_timeout_secs: u64,
    /// Password used when none is given on the command line.
    pub password: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            domain: "irisha.local".to_string(),
            welcome: "Welcome to Irisha".to_string(),
            description: "Irisha relay".to_string(),
            ping_interval_secs: 30,
            connection_timeout_secs: 120,
            password: None,
        }
    }
}

impl Settings {
    /// Load from `path`. A missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Settings file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings: Settings = toml::from_str(&text)
            .with_context(|| format!("parsing settings in {}", path.display()))?;
        settings
            .validate()
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.is_empty() || self.domain.contains(char::is_whitespace) {
            return Err(ConfigError::BadDomain);
        }
        if self.ping_interval_secs == 0 {
            return Err(ConfigError::ZeroTimeout("ping_interval_secs"));
        }
        if self.connection_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("connection_timeout_secs"));
        }
        if self.ping_interval_secs >= self.connection_timeout_secs {
            return Err(ConfigError::PingNotBelowTimeout {
                ping: self.ping_interval_secs,
                timeout: self.connection_timeout_secs,
            });
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}
