//! Configuration: TOML (or JSON) file describing the proxied services.
//!
//! The raw file structure is deserialized with serde defaults, then
//! validated into an immutable [`Config`] with parsed MAC addresses and
//! `Duration` fields. Everything downstream treats the service list as
//! already validated.

use crate::error::{ProxyError, ProxyResult};
use crate::wol::MacAddr;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub wol: WolSection,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

/// `[wol]` section: where wake signals are sent.
#[derive(Debug, Clone, Deserialize)]
pub struct WolSection {
    /// Destination for magic packets. The standard WOL convention is the
    /// limited broadcast address on discard port 9.
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,
}

impl Default for WolSection {
    fn default() -> Self {
        Self {
            broadcast_addr: default_broadcast_addr(),
        }
    }
}

/// One `[[services]]` entry as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub target_host: String,
    pub target_port: u16,
    pub proxy_port: u16,
    pub mac_address: String,
    #[serde(default = "default_wake_timeout")]
    pub wake_timeout: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_max_udp_sessions")]
    pub max_udp_sessions: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_broadcast_addr() -> String {
    "255.255.255.255:9".to_string()
}
fn default_wake_timeout() -> u64 {
    60
}
fn default_health_check_interval() -> u64 {
    10
}
fn default_protocol() -> String {
    "tcp".to_string()
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_max_udp_sessions() -> usize {
    100
}

/// Proxy protocol for a service, chosen once at service start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A validated, immutable service descriptor.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub target_host: String,
    pub target_port: u16,
    pub proxy_port: u16,
    pub mac_address: MacAddr,
    pub protocol: Protocol,
    pub wake_timeout: Duration,
    pub health_check_interval: Duration,
    pub connection_timeout: Duration,
    pub max_udp_sessions: usize,
}

impl ServiceConfig {
    /// `"host:port"` of the backing target, used for logging and as the
    /// wake-attempt key.
    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub broadcast_addr: SocketAddr,
    pub services: Vec<ServiceConfig>,
}

impl Config {
    /// Load and validate a config file. Files ending in `.json` are parsed
    /// as JSON (add-on style `options.json` deployments), everything else
    /// as TOML.
    pub fn load(path: &Path) -> ProxyResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let file: ConfigFile = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        Self::from_file(file)
    }

    /// Validate a parsed [`ConfigFile`] into a [`Config`].
    pub fn from_file(file: ConfigFile) -> ProxyResult<Self> {
        let broadcast_addr: SocketAddr = file.wol.broadcast_addr.parse().map_err(|_| {
            ProxyError::Config(format!(
                "invalid wol.broadcast_addr: {}",
                file.wol.broadcast_addr
            ))
        })?;

        if file.services.is_empty() {
            return Err(ProxyError::Config("no services configured".to_string()));
        }

        let mut services = Vec::with_capacity(file.services.len());
        for entry in &file.services {
            services.push(validate_service(entry)?);
        }

        // Proxy ports must be unique: each one maps to exactly one target.
        let mut ports: Vec<u16> = services.iter().map(|s| s.proxy_port).collect();
        ports.sort_unstable();
        ports.dedup();
        if ports.len() != services.len() {
            return Err(ProxyError::Config(
                "duplicate proxy_port across services".to_string(),
            ));
        }

        Ok(Self {
            log_level: file.log_level,
            broadcast_addr,
            services,
        })
    }
}

fn validate_service(entry: &ServiceEntry) -> ProxyResult<ServiceConfig> {
    let ctx = |msg: String| ProxyError::Config(format!("service on port {}: {}", entry.proxy_port, msg));

    if entry.target_host.is_empty() {
        return Err(ctx("target_host is required".to_string()));
    }
    if entry.target_port == 0 {
        return Err(ctx("target_port must be between 1 and 65535".to_string()));
    }
    if entry.proxy_port == 0 {
        return Err(ProxyError::Config(
            "proxy_port must be between 1 and 65535".to_string(),
        ));
    }
    let mac_address: MacAddr = entry.mac_address.parse()?;
    let protocol = match entry.protocol.as_str() {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        other => return Err(ctx(format!("protocol must be 'tcp' or 'udp', got '{}'", other))),
    };
    if !(30..=300).contains(&entry.wake_timeout) {
        return Err(ctx("wake_timeout must be between 30 and 300 seconds".to_string()));
    }
    if !(5..=60).contains(&entry.health_check_interval) {
        return Err(ctx(
            "health_check_interval must be between 5 and 60 seconds".to_string(),
        ));
    }
    if entry.connection_timeout == 0 {
        return Err(ctx("connection_timeout must be positive".to_string()));
    }
    if entry.max_udp_sessions == 0 {
        return Err(ctx("max_udp_sessions must be positive".to_string()));
    }

    Ok(ServiceConfig {
        target_host: entry.target_host.clone(),
        target_port: entry.target_port,
        proxy_port: entry.proxy_port,
        mac_address,
        protocol,
        wake_timeout: Duration::from_secs(entry.wake_timeout),
        health_check_interval: Duration::from_secs(entry.health_check_interval),
        connection_timeout: Duration::from_secs(entry.connection_timeout),
        max_udp_sessions: entry.max_udp_sessions,
    })
}
