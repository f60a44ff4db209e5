//! Relay of allowed queries to the real resolver.
//!
//! Each query gets its own UDP socket. The socket is handed to a
//! [`SocketProtector`] before use so that its traffic bypasses the tunnel;
//! otherwise the forwarded query would be routed straight back into it.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::error::{NetworkError, Result};

/// Receive buffer for upstream answers.
pub const MAX_UPSTREAM_RESPONSE_SIZE: usize = 4096;

/// Relays a raw DNS message upstream and returns the raw answer.
pub trait DnsForwarder: Send + Sync {
    fn forward(&self, query: &[u8]) -> Result<Vec<u8>>;
}

impl<T: DnsForwarder + ?Sized> DnsForwarder for Arc<T> {
    fn forward(&self, query: &[u8]) -> Result<Vec<u8>> {
        (**self).forward(query)
    }
}

/// Exempts a socket from the tunnel's routing.
///
/// On a platform VPN this is the OS "protect" call; the Linux daemon uses a
/// firewall mark that policy routing excludes from the tunnel.
pub trait SocketProtector: Send + Sync {
    fn protect(&self, socket: &Socket) -> io::Result<()>;
}

impl<F> SocketProtector for F
where
    F: Fn(&Socket) -> io::Result<()> + Send + Sync,
{
    fn protect(&self, socket: &Socket) -> io::Result<()> {
        self(socket)
    }
}

/// Leaves sockets untouched. Only correct when the tunnel does not capture
/// the upstream resolver's route.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProtect;

impl SocketProtector for NoProtect {
    fn protect(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }
}

/// Sets `SO_MARK` on the socket (requires `CAP_NET_ADMIN`).
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
pub struct FwMark(pub u32);

#[cfg(target_os = "linux")]
impl SocketProtector for FwMark {
    fn protect(&self, socket: &Socket) -> io::Result<()> {
        socket.set_mark(self.0)
    }
}

/// Forwards queries to a fixed upstream resolver over UDP.
#[derive(Clone)]
pub struct UpstreamForwarder {
    upstream: SocketAddr,
    timeout: Duration,
    protector: Arc<dyn SocketProtector>,
}

impl UpstreamForwarder {
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        Self::with_protector(upstream, timeout, Arc::new(NoProtect))
    }

    pub fn with_protector(
        upstream: SocketAddr,
        timeout: Duration,
        protector: Arc<dyn SocketProtector>,
    ) -> Self {
        Self {
            upstream,
            timeout,
            protector,
        }
    }

    pub const fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    fn open_socket(&self) -> Result<UdpSocket> {
        let (domain, local) = match self.upstream {
            SocketAddr::V4(_) => (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
            SocketAddr::V6(_) => (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))),
        };

        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(NetworkError::Forward)?;
        self.protector
            .protect(&socket)
            .map_err(NetworkError::Protect)?;
        socket.bind(&local.into()).map_err(NetworkError::Forward)?;

        let socket = UdpSocket::from(socket);
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(NetworkError::Forward)?;
        socket
            .connect(self.upstream)
            .map_err(NetworkError::Forward)?;
        Ok(socket)
    }
}

impl DnsForwarder for UpstreamForwarder {
    fn forward(&self, query: &[u8]) -> Result<Vec<u8>> {
        let socket = self.open_socket()?;
        socket.send(query).map_err(NetworkError::Forward)?;

        let mut buf = [0u8; MAX_UPSTREAM_RESPONSE_SIZE];
        let len = socket.recv(&mut buf).map_err(|err| match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => NetworkError::ForwardTimeout,
            _ => NetworkError::Forward(err),
        })?;

        if len == buf.len() {
            debug!(
                upstream = %self.upstream,
                len,
                "upstream answer filled the buffer, likely truncated"
            );
        }
        trace!(upstream = %self.upstream, len, "upstream answered");
        Ok(buf[..len].to_vec())
    }
}
