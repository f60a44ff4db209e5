//! DNS decision and relay.

pub mod blocker;
pub mod forwarder;

pub use blocker::{Blocker, DOH_DOMAINS, is_doh_endpoint};
pub use forwarder::{DnsForwarder, NoProtect, SocketProtector, UpstreamForwarder};

#[cfg(target_os = "linux")]
pub use forwarder::FwMark;
