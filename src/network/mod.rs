//! Tunnel device access and raw frame handling.

pub mod packet;
mod tunnel;

#[cfg(target_os = "linux")]
pub use tunnel::{TunDevice, TunProvider};
pub use tunnel::{MAX_FRAME_SIZE, TunnelDevice, TunnelProvider};

#[cfg(test)]
pub use tunnel::tests::MockDevice;
