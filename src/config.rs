//! Configuration loading and validation.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result, ValidationError};

/// Main configuration for the focuslock daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path of the JSON file backing the persisted key/value store.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Upstream DNS resolver that allowed queries are relayed to.
    #[serde(
        default = "default_upstream_resolver",
        deserialize_with = "deserialize_socket_addr"
    )]
    pub upstream_resolver: SocketAddr,

    /// How long to wait for the upstream answer, in milliseconds.
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,

    /// Interval between two lock expiry checks, in seconds.
    #[serde(default = "default_lock_check_interval")]
    pub lock_check_interval_secs: u64,

    /// Virtual interface settings.
    #[serde(default)]
    pub tunnel: TunnelSettings,

    /// Foreground app blocking settings.
    #[serde(default)]
    pub app_blocker: AppBlockerSettings,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Fixed configuration requested from the OS for the virtual interface.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TunnelSettings {
    /// Interface name (only honoured by providers that can name devices).
    #[serde(default = "default_tunnel_name")]
    pub name: String,

    /// Local end of the point-to-point link.
    #[serde(default = "default_tunnel_address")]
    pub address: Ipv4Addr,

    /// Peer end of the link, advertised as the DNS server. Must differ from
    /// `address`, or queries would be delivered locally.
    #[serde(default = "default_dns_address")]
    pub dns_address: Ipv4Addr,

    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Upper bound for a single blocking read, so cancellation is observed.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Human readable session label shown by the OS.
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Route the system resolver to `dns_address` once the device is up.
    #[serde(default = "default_configure_resolver")]
    pub configure_resolver: bool,
}

impl TunnelSettings {
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            name: default_tunnel_name(),
            address: default_tunnel_address(),
            dns_address: default_dns_address(),
            prefix_len: default_prefix_len(),
            mtu: default_mtu(),
            read_timeout_ms: default_read_timeout_ms(),
            session_name: default_session_name(),
            configure_resolver: default_configure_resolver(),
        }
    }
}

/// Foreground app blocking settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AppBlockerSettings {
    /// Identifier of this application; never blocked.
    #[serde(default = "default_own_package")]
    pub own_package: String,

    /// Minimum delay between two redirects for the same app, in milliseconds.
    #[serde(default = "default_redirect_debounce_ms")]
    pub redirect_debounce_ms: u64,
}

impl Default for AppBlockerSettings {
    fn default() -> Self {
        Self {
            own_package: default_own_package(),
            redirect_debounce_ms: default_redirect_debounce_ms(),
        }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(
        default = "default_metrics_listen",
        deserialize_with = "deserialize_socket_addr"
    )]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("focuslock-state.json")
}

fn default_upstream_resolver() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(1, 1, 1, 1), 53))
}

const fn default_forward_timeout_ms() -> u64 {
    5000
}

const fn default_lock_check_interval() -> u64 {
    60
}

fn default_tunnel_name() -> String {
    "focuslock0".into()
}

const fn default_tunnel_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 1)
}

const fn default_dns_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 2)
}

const fn default_prefix_len() -> u8 {
    32
}

const fn default_mtu() -> u16 {
    1500
}

const fn default_read_timeout_ms() -> u64 {
    250
}

fn default_session_name() -> String {
    "Focuslock DNS Filter".into()
}

const fn default_configure_resolver() -> bool {
    true
}

fn default_own_package() -> String {
    "com.tamashii.app".into()
}

const fn default_redirect_debounce_ms() -> u64 {
    1000
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9100))
}

fn deserialize_socket_addr<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            upstream_resolver: default_upstream_resolver(),
            forward_timeout_ms: default_forward_timeout_ms(),
            lock_check_interval_secs: default_lock_check_interval(),
            tunnel: TunnelSettings::default(),
            app_blocker: AppBlockerSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Load the file if it exists, fall back to defaults otherwise.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = ?path, "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate().map_err(ConfigError::from)?;
        Ok(config)
    }

    pub const fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub const fn lock_check_interval(&self) -> Duration {
        Duration::from_secs(self.lock_check_interval_secs)
    }

    pub const fn redirect_debounce(&self) -> Duration {
        Duration::from_millis(self.app_blocker.redirect_debounce_ms)
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.forward_timeout_ms == 0 {
            return Err(ValidationError::ZeroForwardTimeout);
        }
        if self.lock_check_interval_secs == 0 {
            return Err(ValidationError::ZeroLockCheckInterval);
        }
        if self.tunnel.read_timeout_ms == 0 {
            return Err(ValidationError::ZeroReadTimeout);
        }
        if self.tunnel.mtu < 576 {
            return Err(ValidationError::MtuTooSmall(self.tunnel.mtu));
        }
        if self.tunnel.prefix_len > 32 {
            return Err(ValidationError::InvalidPrefixLen(self.tunnel.prefix_len));
        }
        if self.tunnel.dns_address == self.tunnel.address {
            return Err(ValidationError::DnsAddressIsLocal(self.tunnel.dns_address));
        }
        if self.tunnel.name.trim().is_empty() {
            return Err(ValidationError::EmptyTunnelName);
        }
        if self.app_blocker.own_package.trim().is_empty() {
            return Err(ValidationError::EmptyOwnPackage);
        }
        Ok(())
    }
}
