//! Error types for the focuslock blocker.

use std::io;

use thiserror::Error;

/// Main error type for focuslock operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metrics error: {0}")]
    Metrics(String),

    /// The user declined the interactive tunnel permission prompt.
    #[error("VPN permission denied by user")]
    PermissionDenied,

    /// Requested lock extension does not fit in a timestamp.
    #[error("cannot extend lock by {0} hours")]
    LockOutOfRange(u32),

    /// The capability does not exist on this platform.
    #[error("{0} is not available on this platform")]
    Unsupported(&'static str),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("forward_timeout_ms must be greater than 0")]
    ZeroForwardTimeout,

    #[error("lock_check_interval_secs must be greater than 0")]
    ZeroLockCheckInterval,

    #[error("tunnel.read_timeout_ms must be greater than 0")]
    ZeroReadTimeout,

    #[error("tunnel.mtu must be at least 576, got {0}")]
    MtuTooSmall(u16),

    #[error("tunnel.prefix_len must be at most 32, got {0}")]
    InvalidPrefixLen(u8),

    #[error("tunnel.dns_address {0} must differ from tunnel.address")]
    DnsAddressIsLocal(std::net::Ipv4Addr),

    #[error("tunnel.name cannot be empty")]
    EmptyTunnelName,

    #[error("app_blocker.own_package cannot be empty")]
    EmptyOwnPackage,
}

/// Network-related errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The OS refused to hand out the virtual interface.
    #[error("failed to establish tunnel interface: {0}")]
    TunnelEstablish(String),

    #[error("packet construction failed: {0}")]
    PacketConstruction(String),

    #[error("failed to spawn tunnel worker: {0}")]
    WorkerSpawn(#[source] io::Error),

    #[error("failed to protect upstream socket: {0}")]
    Protect(#[source] io::Error),

    #[error("upstream resolver timed out")]
    ForwardTimeout,

    #[error("failed to forward DNS query: {0}")]
    Forward(#[source] io::Error),
}

/// Errors raised by the persisted key/value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read state file: {0}")]
    Read(#[source] io::Error),

    #[error("failed to write state file: {0}")]
    Write(#[source] io::Error),

    #[error("state file is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode state: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
