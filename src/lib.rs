//! Focuslock - a self-imposed DNS and app blocker with a time-boxed lock.
//!
//! DNS queries from the device are routed into a virtual interface, where
//! blocked names are answered with `127.0.0.1` and everything else is relayed
//! to a real resolver. Known DNS-over-HTTPS endpoints are always blocked so
//! the interception cannot be bypassed. Foreground applications on the
//! blocked list are covered by a blocking screen while the lock is active.
//!
//! # Architecture
//!
//! - [`network`]: raw IPv4/UDP/DNS frame codec and tunnel device access
//! - [`dns`]: block decisions and upstream forwarding
//! - [`tunnel`]: session state machine and the per-packet worker
//! - [`lock`]: lock state derived from the persisted expiry
//! - [`monitor`]: foreground application interception
//! - [`blocklist`]: persisted domain/app lists and lock expiry
//! - [`commands`]: command surface for the host application
//! - [`config`]: configuration loading and validation
//! - [`error`]: error types
//!
//! ```rust
//! use focuslock::dns::Blocker;
//!
//! let blocker = Blocker::new(["tracker.com"]);
//! assert!(blocker.should_block("ads.tracker.com"));
//! assert!(!blocker.should_block("trackercom.evil"));
//! assert!(blocker.should_block("dns.google"));
//! ```

pub mod blocklist;
pub mod commands;
pub mod config;
pub mod dns;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod monitor;
pub mod network;
pub mod tunnel;

pub use config::Config;
pub use error::{Error, Result};
