//! Virtual network interface abstraction.
//!
//! Provides trait-based access to the tunnel device so that:
//! - the packet loop can be tested without a kernel interface
//! - each platform plugs in its own way of obtaining the device (a handle
//!   from the OS VPN service, or a TUN device created by the daemon)

use std::io;

use crate::config::TunnelSettings;
use crate::error::Result;

/// Largest frame the worker will read in one go.
pub const MAX_FRAME_SIZE: usize = 32767;

/// An established virtual interface, used from the tunnel worker only.
pub trait TunnelDevice: Send {
    /// Read one IPv4 frame into `buf`.
    ///
    /// Must return within a bounded time; `Ok(0)` means nothing arrived and
    /// the caller should check for cancellation and read again.
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete IPv4 frame.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Obtains the virtual interface from the OS.
pub trait TunnelProvider: Send + Sync {
    /// Request an interface with the given fixed configuration.
    ///
    /// Failure is fatal to the start attempt and is never retried.
    fn establish(&self, settings: &TunnelSettings) -> Result<Box<dyn TunnelDevice>>;
}

impl<F> TunnelProvider for F
where
    F: Fn(&TunnelSettings) -> Result<Box<dyn TunnelDevice>> + Send + Sync,
{
    fn establish(&self, settings: &TunnelSettings) -> Result<Box<dyn TunnelDevice>> {
        self(settings)
    }
}

#[cfg(target_os = "linux")]
pub use linux::{TunDevice, TunProvider};

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::process::Command;
    use std::time::Duration;

    use tokio::runtime::{self, Runtime};
    use tracing::{debug, info, warn};
    use tun_rs::{AsyncDevice, DeviceBuilder};

    use super::{TunnelDevice, TunnelProvider};
    use crate::config::TunnelSettings;
    use crate::error::{NetworkError, Result};

    /// TUN device driven from the blocking tunnel worker.
    ///
    /// Owns a single-threaded runtime whose reactor bounds every read by
    /// `read_timeout`.
    pub struct TunDevice {
        device: AsyncDevice,
        runtime: Runtime,
        read_timeout: Duration,
    }

    impl TunnelDevice for TunDevice {
        fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let (device, timeout) = (&self.device, self.read_timeout);
            self.runtime
                .block_on(async { tokio::time::timeout(timeout, device.recv(buf)).await })
                .unwrap_or(Ok(0))
        }

        fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            let written = self.runtime.block_on(self.device.send(frame))?;
            if written != frame.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short tunnel write: {written} of {} bytes", frame.len()),
                ));
            }
            Ok(())
        }
    }

    /// Creates the TUN interface for the daemon. Requires `CAP_NET_ADMIN`.
    ///
    /// The interface is point-to-point: `address` is the local end and
    /// `dns_address` the peer, so queries sent to the peer are routed into
    /// the device rather than delivered locally.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TunProvider;

    impl TunProvider {
        /// Point systemd-resolved at the tunnel for every domain.
        fn configure_resolver(settings: &TunnelSettings) {
            let dns = settings.dns_address.to_string();
            let steps: [&[&str]; 2] = [
                &["dns", &settings.name, &dns],
                &["domain", &settings.name, "~."],
            ];

            for args in steps {
                debug!(?args, "configuring resolver");
                match Command::new("resolvectl").args(args).status() {
                    Ok(status) if status.success() => {}
                    Ok(status) => {
                        warn!(%status, "resolvectl {} failed", args.join(" "));
                        return;
                    }
                    Err(err) => {
                        warn!(
                            error = %err,
                            "resolvectl unavailable, point the resolver at {dns} by hand"
                        );
                        return;
                    }
                }
            }
            info!(name = %settings.name, dns = %dns, "system resolver routed through tunnel");
        }
    }

    impl TunnelProvider for TunProvider {
        fn establish(&self, settings: &TunnelSettings) -> Result<Box<dyn TunnelDevice>> {
            let establish = |err: io::Error| NetworkError::TunnelEstablish(err.to_string());

            let runtime = runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
                .map_err(establish)?;

            let device = {
                let _context = runtime.enter();
                DeviceBuilder::new()
                    .name(&settings.name)
                    .ipv4(settings.address, settings.prefix_len, Some(settings.dns_address))
                    .mtu(settings.mtu)
                    .build_async()
                    .map_err(establish)?
            };

            info!(
                session = %settings.session_name,
                name = %settings.name,
                address = %settings.address,
                dns = %settings.dns_address,
                mtu = settings.mtu,
                "tunnel interface established"
            );
            if settings.configure_resolver {
                Self::configure_resolver(settings);
            }

            Ok(Box::new(TunDevice {
                device,
                runtime,
                read_timeout: settings.read_timeout(),
            }))
        }
    }
}
