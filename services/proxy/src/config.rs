//! Engine configuration.
//!
//! Endpoints are loaded from a JSON document named by `SNARE_CONFIG_FILE`;
//! process-wide settings can be overridden from the environment. The engine
//! only ever sees a validated, immutable [`Config`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::error::ConfigError;

/// Default bytes per read.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default send/receive timeout in seconds.
pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 30;

/// Default minimum log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// What an endpoint does with accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyType {
    /// Capture inbound bytes, never forward.
    #[serde(alias = "honeypot", alias = "Honeypot", alias = "honey_pot")]
    HoneyPot,
    /// Relay bytes to the configured target.
    #[serde(alias = "forward")]
    Forward,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::HoneyPot => f.write_str("HoneyPot"),
            ProxyType::Forward => f.write_str("Forward"),
        }
    }
}

/// Inclusive listening port range.
///
/// Deserializes from `"9000-9010"`, a single port number, or
/// `{ "start": 9000, "end": 9010 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PortRangeRepr")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    /// Every port in the range, in ascending order.
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    /// Number of ports, zero for an inverted range.
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_valid(&self) -> bool {
        self.start >= 1 && self.start <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port '{}'", p.trim()))
        };

        match s.split_once('-') {
            Some((start, end)) => Ok(Self::new(parse_port(start)?, parse_port(end)?)),
            None => Ok(Self::single(parse_port(s)?)),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortRangeRepr {
    Single(u16),
    Text(String),
    Bounds {
        #[serde(alias = "Start")]
        start: u16,
        #[serde(alias = "End")]
        end: u16,
    },
}

impl TryFrom<PortRangeRepr> for PortRange {
    type Error = String;

    fn try_from(repr: PortRangeRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            PortRangeRepr::Single(port) => Ok(Self::single(port)),
            PortRangeRepr::Text(text) => text.parse(),
            PortRangeRepr::Bounds { start, end } => Ok(Self::new(start, end)),
        }
    }
}

/// One listening rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    #[serde(alias = "ProxyType")]
    pub proxy_type: ProxyType,

    /// Bindable IP, or `any` for all IPv4 interfaces.
    #[serde(alias = "ListeningAddress", default = "default_listening_address")]
    pub listening_address: String,

    #[serde(alias = "ListeningPortRange")]
    pub listening_port_range: PortRange,

    /// Upstream host, required for [`ProxyType::Forward`].
    #[serde(alias = "TargetHost", default)]
    pub target_host: Option<String>,

    /// Upstream port, required for [`ProxyType::Forward`].
    #[serde(alias = "TargetPort", default)]
    pub target_port: Option<u16>,
}

fn default_listening_address() -> String {
    "any".to_string()
}

/// Join host and port, bracketing IPv6 literals.
pub(crate) fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl EndpointConfig {
    /// Honeypot endpoint on every interface.
    pub fn honeypot(ports: PortRange) -> Self {
        Self {
            proxy_type: ProxyType::HoneyPot,
            listening_address: default_listening_address(),
            listening_port_range: ports,
            target_host: None,
            target_port: None,
        }
    }

    /// Forward endpoint on every interface.
    pub fn forward(ports: PortRange, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            proxy_type: ProxyType::Forward,
            listening_address: default_listening_address(),
            listening_port_range: ports,
            target_host: Some(target_host.into()),
            target_port: Some(target_port),
        }
    }

    /// Set the listening address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.listening_address = address.into();
        self
    }

    /// Resolve the listening address to an IP.
    ///
    /// `any`, `*` and the empty string map to `0.0.0.0`.
    pub fn bind_ip(&self) -> Option<IpAddr> {
        let address = self.listening_address.trim();
        if address.is_empty() || address == "*" || address.eq_ignore_ascii_case("any") {
            return Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }
        address.parse().ok()
    }

    /// `host:port` of the forward target, if fully configured.
    pub fn target(&self) -> Option<String> {
        match (&self.target_host, self.target_port) {
            (Some(host), Some(port)) => Some(host_port(host, port)),
            _ => None,
        }
    }

    fn validate(&self, index: usize) -> std::result::Result<(), ConfigError> {
        let range = self.listening_port_range;
        if !range.is_valid() {
            return Err(ConfigError::InvalidPortRange {
                index,
                start: range.start,
                end: range.end,
            });
        }

        if self.bind_ip().is_none() {
            return Err(ConfigError::InvalidAddress {
                index,
                address: self.listening_address.clone(),
            });
        }

        if self.proxy_type == ProxyType::Forward {
            match &self.target_host {
                Some(host) if !host.trim().is_empty() => {}
                _ => return Err(ConfigError::MissingTargetHost { index }),
            }
            match self.target_port {
                Some(port) if port >= 1 => {}
                _ => return Err(ConfigError::MissingTargetPort { index }),
            }
        }

        Ok(())
    }
}

/// Process-wide settings shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    /// Bytes per read.
    #[serde(alias = "BufferSize")]
    pub buffer_size: usize,

    /// Send and receive timeout in seconds.
    #[serde(alias = "SocketTimeoutSecs", alias = "Timeout")]
    pub socket_timeout_secs: u64,

    /// Minimum log level (trace, debug, info, warn, error).
    #[serde(alias = "LogLevel")]
    pub log_level: String,

    /// Key handed to the connection recorder for reputation lookups.
    #[serde(alias = "ApiKey")]
    pub api_key: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            socket_timeout_secs: DEFAULT_SOCKET_TIMEOUT_SECS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            api_key: None,
        }
    }
}

impl ProxySettings {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn level_filter(&self) -> std::result::Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(self.log_level.trim())
            .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    /// Outbound traffic is only logged at maximum verbosity.
    pub fn logs_outbound_traffic(&self) -> bool {
        matches!(self.level_filter(), Ok(LevelFilter::TRACE))
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        if self.socket_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        self.level_filter()?;
        Ok(())
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(alias = "Endpoints")]
    pub endpoints: Vec<EndpointConfig>,

    #[serde(alias = "Settings", default)]
    pub settings: ProxySettings,
}

impl Config {
    pub fn new(endpoints: Vec<EndpointConfig>, settings: ProxySettings) -> Self {
        Self {
            endpoints,
            settings,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("SNARE_CONFIG_FILE")
            .context("Missing endpoint configuration. Set SNARE_CONFIG_FILE to a JSON file.")?;

        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a JSON file without validating it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply `SNARE_*` setting overrides from a variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SNARE_BUFFER_SIZE") {
            self.settings.buffer_size = v
                .parse()
                .context("SNARE_BUFFER_SIZE must be an integer (bytes).")?;
        }

        if let Some(v) = lookup("SNARE_SOCKET_TIMEOUT_SECS") {
            self.settings.socket_timeout_secs = v
                .parse()
                .context("SNARE_SOCKET_TIMEOUT_SECS must be an integer (seconds).")?;
        }

        if let Some(v) = lookup("SNARE_LOG_LEVEL") {
            self.settings.log_level = v;
        }

        if let Some(v) = lookup("SNARE_API_KEY") {
            self.settings.api_key = Some(v).filter(|key| !key.is_empty());
        }

        Ok(())
    }

    /// Validate every endpoint and the settings. The first failure wins.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            endpoint.validate(index)?;
        }

        self.settings.validate()
    }

    /// Total number of listeners the endpoints expand to.
    pub fn listener_count(&self) -> usize {
        self.endpoints
            .iter()
            .map(|e| e.listening_port_range.len())
            .sum()
    }
}
