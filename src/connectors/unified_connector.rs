use std::{io, net::IpAddr, os::fd::RawFd};

use super::{
    tcp_connector::{TcpConnector, TcpSocket},
    tls_connector::{TlsConnector, TlsSocket},
    Connector, Socket, Target, Transfer,
};
use crate::{buffer::ByteBuffer, selector::Interest, Options, Result};

/// Picks plain TCP or TLS over TCP by the target's scheme.
#[derive(Default, Clone, Debug)]
pub struct UnifiedConnector {
    raw_tcp: TcpConnector,
    tcp_tls: TlsConnector<TcpConnector>,
}

impl UnifiedConnector {
    pub fn new(raw_tcp: TcpConnector, tcp_tls: TlsConnector<TcpConnector>) -> Self {
        Self { raw_tcp, tcp_tls }
    }

    /// Connector configured from `options`: ALPN follows the `http2` flag and
    /// cleartext HTTP/2 follows `http2_prior_knowledge`.
    pub fn from_options(options: &Options) -> Self {
        let raw_tcp = TcpConnector::new(options.http2_prior_knowledge);
        let tcp_tls =
            TlsConnector::new_with_tls_default(raw_tcp.clone(), Some(options.alpn_protocols()));
        Self::new(raw_tcp, tcp_tls)
    }
}

#[derive(Debug)]
pub enum UnifiedConnection {
    Tcp(TcpSocket),
    TcpTls(TlsSocket<TcpSocket>),
}

impl Connector for UnifiedConnector {
    type Connection = UnifiedConnection;

    fn connect(&self, target: &Target) -> Result<Self::Connection> {
        if target.origin.is_tls() {
            self.tcp_tls.connect(target).map(UnifiedConnection::TcpTls)
        } else {
            self.raw_tcp.connect(target).map(UnifiedConnection::Tcp)
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $s:ident => $e:expr) => {
        match $self {
            UnifiedConnection::Tcp($s) => $e,
            UnifiedConnection::TcpTls($s) => $e,
        }
    };
}

impl Socket for UnifiedConnection {
    #[inline]
    fn connect(&mut self) -> io::Result<()> {
        dispatch!(self, s => s.connect())
    }

    #[inline]
    fn is_connected(&self) -> bool {
        dispatch!(self, s => s.is_connected())
    }

    #[inline]
    fn read(&mut self, max: usize, buf: &mut ByteBuffer) -> io::Result<Transfer> {
        dispatch!(self, s => s.read(max, buf))
    }

    #[inline]
    fn write(&mut self, buf: &mut ByteBuffer) -> io::Result<Transfer> {
        dispatch!(self, s => s.write(buf))
    }

    #[inline]
    fn close(&mut self) {
        dispatch!(self, s => s.close())
    }

    #[inline]
    fn protocol(&self) -> &str {
        dispatch!(self, s => s.protocol())
    }

    #[inline]
    fn interests(&self) -> Option<Interest> {
        dispatch!(self, s => s.interests())
    }

    #[inline]
    fn wants_write(&self) -> bool {
        dispatch!(self, s => s.wants_write())
    }

    #[inline]
    fn raw_fd(&self) -> Option<RawFd> {
        dispatch!(self, s => s.raw_fd())
    }

    #[inline]
    fn addresses(&self) -> &[IpAddr] {
        dispatch!(self, s => s.addresses())
    }

    #[inline]
    fn failed_address(&self) -> Option<IpAddr> {
        dispatch!(self, s => s.failed_address())
    }

    #[inline]
    fn verify_hostname(&self, host: &str) -> bool {
        dispatch!(self, s => s.verify_hostname(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::{Origin, Scheme};

    #[test]
    fn test_dispatch_by_scheme() {
        let connector = UnifiedConnector::from_options(&Options::default());
        let addresses = vec![IpAddr::from([127, 0, 0, 1])];
        let plain = Target::new(Origin::new(Scheme::Http, "localhost", 80), addresses.clone());
        let tls = Target::new(Origin::new(Scheme::Https, "localhost", 443), addresses);

        assert!(matches!(
            connector.connect(&plain).unwrap(),
            UnifiedConnection::Tcp(_)
        ));
        let conn = connector.connect(&tls).unwrap();
        assert!(matches!(conn, UnifiedConnection::TcpTls(_)));
        assert_eq!(conn.addresses(), &[IpAddr::from([127, 0, 0, 1])]);
        assert!(conn.raw_fd().is_none());
    }
}
