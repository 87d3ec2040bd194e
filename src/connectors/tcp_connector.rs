use std::{
    io::{self, Write},
    net::{IpAddr, SocketAddr},
    os::fd::{AsRawFd, RawFd},
};

use nix::errno::Errno;
use socket2::{Domain, Protocol, SockAddr, Socket as RawSocket, Type};

use super::{is_unreachable, Connector, Socket, Target, Transfer};
use crate::{buffer::ByteBuffer, selector::Interest, Origin, Result};

/// Dials plain TCP. Cleartext connections speak HTTP/1.1 unless prior
/// knowledge of HTTP/2 is configured.
#[derive(Default, Clone, Debug)]
pub struct TcpConnector {
    pub prior_knowledge: bool,
}

impl TcpConnector {
    #[inline]
    pub const fn new(prior_knowledge: bool) -> Self {
        Self { prior_knowledge }
    }
}

impl Connector for TcpConnector {
    type Connection = TcpSocket;

    fn connect(&self, target: &Target) -> Result<Self::Connection> {
        let h2 = target.offers_h2().unwrap_or(true) && self.prior_knowledge;
        Ok(TcpSocket::new(
            target.origin.clone(),
            target.addresses.clone(),
            if h2 { "h2" } else { "http/1.1" },
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectState {
    Idle,
    InProgress,
    Connected,
    Closed,
}

/// Non-blocking TCP stream that walks its address list on refusal.
#[derive(Debug)]
pub struct TcpSocket {
    origin: Origin,
    addresses: Vec<IpAddr>,
    index: usize,
    socket: Option<RawSocket>,
    state: ConnectState,
    failed: Option<IpAddr>,
    protocol: &'static str,
}

impl TcpSocket {
    pub fn new(origin: Origin, addresses: Vec<IpAddr>, protocol: &'static str) -> Self {
        Self {
            origin,
            addresses,
            index: 0,
            socket: None,
            state: ConnectState::Idle,
            failed: None,
            protocol,
        }
    }

    #[inline]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    fn current(&self) -> Option<SocketAddr> {
        self.addresses
            .get(self.index)
            .map(|ip| SocketAddr::new(*ip, self.origin.port))
    }

    fn start(&mut self, addr: SocketAddr) -> io::Result<()> {
        let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        // we will ignore the set nodelay error
        let _ = socket.set_nodelay(true);
        let result = socket.connect(&SockAddr::from(addr));
        self.socket = Some(socket);
        match result {
            Ok(()) => {
                self.state = ConnectState::Connected;
                Ok(())
            }
            Err(e) if in_progress(&e) => {
                self.state = ConnectState::InProgress;
                Err(io::ErrorKind::WouldBlock.into())
            }
            Err(e) => Err(e),
        }
    }

    fn check(&mut self) -> io::Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        if let Some(e) = socket.take_error()? {
            return Err(e);
        }
        match socket.peer_addr() {
            Ok(_) => {
                self.state = ConnectState::Connected;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                Err(io::ErrorKind::WouldBlock.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Move to the next address, or give the error back when none are left
    /// or the address itself is unreachable.
    fn fail(&mut self, e: io::Error) -> io::Result<()> {
        self.socket = None;
        self.state = ConnectState::Idle;
        if is_unreachable(&e) {
            self.failed = self.addresses.get(self.index).copied();
            return Err(e);
        }
        #[cfg(feature = "logging")]
        tracing::debug!("connect to {:?} failed: {e}", self.current());
        self.index += 1;
        if self.index >= self.addresses.len() {
            self.index = 0;
            self.state = ConnectState::Closed;
            return Err(e);
        }
        Ok(())
    }
}

#[inline]
fn in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || matches!(
            e.raw_os_error().map(Errno::from_raw),
            Some(Errno::EINPROGRESS | Errno::EALREADY)
        )
}

impl Socket for TcpSocket {
    fn connect(&mut self) -> io::Result<()> {
        loop {
            let attempt = match self.state {
                ConnectState::Connected => return Ok(()),
                ConnectState::InProgress => self.check(),
                ConnectState::Idle | ConnectState::Closed => {
                    let Some(addr) = self.current() else {
                        return Err(io::Error::new(
                            io::ErrorKind::AddrNotAvailable,
                            format!("no address for {}", self.origin),
                        ));
                    };
                    self.start(addr)
                }
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(e),
                Err(e) => self.fail(e)?,
            }
        }
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.state == ConnectState::Connected
    }

    fn read(&mut self, max: usize, buf: &mut ByteBuffer) -> io::Result<Transfer> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(Transfer::Eof);
        };
        if max == 0 || buf.is_full() {
            return Ok(Transfer::WouldBlock);
        }
        match buf.read_from(socket, max) {
            Ok(0) => Ok(Transfer::Eof),
            Ok(n) => Ok(Transfer::Bytes(n)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(Transfer::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &mut ByteBuffer) -> io::Result<Transfer> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(Transfer::Eof);
        };
        if buf.is_empty() {
            return Ok(Transfer::Bytes(0));
        }
        match socket.write(buf.as_slice()) {
            Ok(0) => Ok(Transfer::Eof),
            Ok(n) => {
                buf.consume(n);
                Ok(Transfer::Bytes(n))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(Transfer::WouldBlock)
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(Transfer::Eof),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
        self.state = ConnectState::Closed;
        self.index = 0;
    }

    #[inline]
    fn protocol(&self) -> &str {
        self.protocol
    }

    #[inline]
    fn interests(&self) -> Option<Interest> {
        match self.state {
            ConnectState::InProgress | ConnectState::Idle => Some(Interest::Writable),
            _ => None,
        }
    }

    #[inline]
    fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    #[inline]
    fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    #[inline]
    fn failed_address(&self) -> Option<IpAddr> {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Read, net::TcpListener, time::Duration};

    use super::*;
    use crate::origin::Scheme;

    fn connect_blocking(socket: &mut TcpSocket) -> io::Result<()> {
        for _ in 0..200 {
            match socket.connect() {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                other => return other,
            }
        }
        Err(io::ErrorKind::TimedOut.into())
    }

    #[test]
    fn test_connect_and_transfer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0; 4];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(b"pong").unwrap();
            buf
        });

        let origin = Origin::new(Scheme::Http, "localhost", port);
        let mut socket = TcpSocket::new(origin, vec![IpAddr::from([127, 0, 0, 1])], "http/1.1");
        assert!(!socket.is_connected());
        connect_blocking(&mut socket).unwrap();
        assert!(socket.is_connected());
        assert!(socket.raw_fd().is_some());

        let mut out = ByteBuffer::new(16);
        out.append(b"ping");
        while !out.is_empty() {
            socket.write(&mut out).unwrap();
        }
        assert_eq!(&server.join().unwrap(), b"ping");

        let mut input = ByteBuffer::new(16);
        while input.len() < 4 {
            match socket.read(16, &mut input).unwrap() {
                Transfer::Eof => break,
                _ => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        assert_eq!(input.as_slice(), b"pong");
    }

    #[test]
    fn test_refused_falls_back_to_next_address() {
        // grab a port with nothing listening on it
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let listener = TcpListener::bind(("127.0.0.2", port));
        let Ok(listener) = listener else {
            // 127.0.0.2 is not routable everywhere
            return;
        };
        let origin = Origin::new(Scheme::Http, "multi.test", port);
        let mut socket = TcpSocket::new(
            origin,
            vec![IpAddr::from([127, 0, 0, 1]), IpAddr::from([127, 0, 0, 2])],
            "http/1.1",
        );
        connect_blocking(&mut socket).unwrap();
        assert_eq!(socket.index, 1);
        drop(listener);
    }

    #[test]
    fn test_refused_without_fallback_errors() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let origin = Origin::new(Scheme::Http, "localhost", port);
        let mut socket = TcpSocket::new(origin, vec![IpAddr::from([127, 0, 0, 1])], "http/1.1");
        let err = connect_blocking(&mut socket).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert!(socket.failed_address().is_none());
    }

    #[test]
    fn test_protocol_follows_prior_knowledge() {
        let origin = Origin::new(Scheme::Http, "localhost", 80);
        let mut target = Target::new(origin, vec![]);
        assert_eq!(TcpConnector::new(false).connect(&target).unwrap().protocol(), "http/1.1");
        assert_eq!(TcpConnector::new(true).connect(&target).unwrap().protocol(), "h2");
        target.alpn = Some(vec!["http/1.1".into()]);
        assert_eq!(TcpConnector::new(true).connect(&target).unwrap().protocol(), "http/1.1");
    }
}
