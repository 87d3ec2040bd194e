mod tcp_connector;
mod tls_connector;
mod unified_connector;

use std::{io, net::IpAddr, os::fd::RawFd};

use nix::errno::Errno;
use smol_str::SmolStr;
pub use tcp_connector::*;
pub use tls_connector::*;
pub use unified_connector::*;

use crate::{buffer::ByteBuffer, selector::Interest, Origin, Result};

/// Outcome of one non-blocking transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Bytes(usize),
    WouldBlock,
    Eof,
}

/// A non-blocking byte stream as seen by a channel.
///
/// `connect` is re-entrant: `Err(WouldBlock)` means the attempt is still in
/// flight and the call should be repeated once the descriptor is ready.
pub trait Socket: Send {
    fn connect(&mut self) -> io::Result<()>;
    fn is_connected(&self) -> bool;
    fn read(&mut self, max: usize, buf: &mut ByteBuffer) -> io::Result<Transfer>;
    fn write(&mut self, buf: &mut ByteBuffer) -> io::Result<Transfer>;
    fn close(&mut self);
    /// Negotiated ALPN id, or the configured fallback.
    fn protocol(&self) -> &str;
    /// What the socket itself waits for while connecting.
    fn interests(&self) -> Option<Interest>;
    /// Output is buffered below the channel.
    fn wants_write(&self) -> bool {
        false
    }
    fn raw_fd(&self) -> Option<RawFd>;
    fn addresses(&self) -> &[IpAddr];
    /// The address whose connect attempt came back unreachable.
    fn failed_address(&self) -> Option<IpAddr>;
    /// Whether the peer's certificate is also valid for `host`.
    fn verify_hostname(&self, _host: &str) -> bool {
        false
    }
}

impl Socket for Box<dyn Socket> {
    #[inline]
    fn connect(&mut self) -> io::Result<()> {
        self.as_mut().connect()
    }
    #[inline]
    fn is_connected(&self) -> bool {
        self.as_ref().is_connected()
    }
    #[inline]
    fn read(&mut self, max: usize, buf: &mut ByteBuffer) -> io::Result<Transfer> {
        self.as_mut().read(max, buf)
    }
    #[inline]
    fn write(&mut self, buf: &mut ByteBuffer) -> io::Result<Transfer> {
        self.as_mut().write(buf)
    }
    #[inline]
    fn close(&mut self) {
        self.as_mut().close()
    }
    #[inline]
    fn protocol(&self) -> &str {
        self.as_ref().protocol()
    }
    #[inline]
    fn interests(&self) -> Option<Interest> {
        self.as_ref().interests()
    }
    #[inline]
    fn wants_write(&self) -> bool {
        self.as_ref().wants_write()
    }
    #[inline]
    fn raw_fd(&self) -> Option<RawFd> {
        self.as_ref().raw_fd()
    }
    #[inline]
    fn addresses(&self) -> &[IpAddr] {
        self.as_ref().addresses()
    }
    #[inline]
    fn failed_address(&self) -> Option<IpAddr> {
        self.as_ref().failed_address()
    }
    #[inline]
    fn verify_hostname(&self, host: &str) -> bool {
        self.as_ref().verify_hostname(host)
    }
}

/// Where a connector should dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub origin: Origin,
    pub addresses: Vec<IpAddr>,
    /// Overrides the connector's ALPN list.
    pub alpn: Option<Vec<String>>,
    /// Name presented in SNI and checked against the certificate. Stays the
    /// requested host when `origin` is an alternative service.
    pub server_name: SmolStr,
}

impl Target {
    pub fn new(origin: Origin, addresses: Vec<IpAddr>) -> Self {
        Self {
            server_name: origin.host.clone(),
            origin,
            addresses,
            alpn: None,
        }
    }

    #[inline]
    pub fn offers_h2(&self) -> Option<bool> {
        self.alpn
            .as_ref()
            .map(|alpn| alpn.iter().any(|p| p == "h2"))
    }
}

/// Builds sockets for a target. Nothing is dialled until the socket's
/// `connect` is called.
pub trait Connector {
    type Connection: Socket + 'static;

    fn connect(&self, target: &Target) -> Result<Self::Connection>;
}

/// Type-erased connector held by channels and the pool.
pub trait SocketFactory: Send + Sync {
    fn build(&self, target: &Target) -> Result<Box<dyn Socket>>;
}

impl<C> SocketFactory for C
where
    C: Connector + Send + Sync,
{
    #[inline]
    fn build(&self, target: &Target) -> Result<Box<dyn Socket>> {
        Ok(Box::new(self.connect(target)?))
    }
}

/// Connect errors that mean the address family or route is gone, as
/// opposed to the peer refusing.
pub fn is_unreachable(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENETUNREACH | Errno::EHOSTUNREACH | Errno::EADDRNOTAVAIL | Errno::EAFNOSUPPORT)
    )
}
