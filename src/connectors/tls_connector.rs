use std::{
    fmt::Debug,
    io::{self, Write},
    net::IpAddr,
    os::fd::RawFd,
    sync::Arc,
};

use rustls::{
    client::{danger::ServerCertVerifier, WebPkiServerVerifier},
    pki_types::{ServerName, UnixTime},
    ClientConfig, ClientConnection, RootCertStore,
};

use super::{Connector, Socket, Target, Transfer};
use crate::{buffer::ByteBuffer, selector::Interest, FromUriError, Result};

const TLS_BUFFER_SIZE: usize = 32 * 1024;

/// A connector for establishing TLS sessions over an inner connector.
///
/// The session is driven sans-io: ciphertext moves through the inner
/// socket's non-blocking reads and writes, so a handshake spans as many
/// ticks as the network needs.
#[derive(Clone)]
pub struct TlsConnector<C> {
    inner_connector: C,
    tls_config: Arc<ClientConfig>,
    verifier: Option<Arc<dyn ServerCertVerifier>>,
}

impl<C: Debug> std::fmt::Debug for TlsConnector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsConnector, inner: {:?}", self.inner_connector)
    }
}

impl<C> TlsConnector<C> {
    pub fn new(
        inner_connector: C,
        tls_config: Arc<ClientConfig>,
        verifier: Option<Arc<dyn ServerCertVerifier>>,
    ) -> Self {
        Self {
            inner_connector,
            tls_config,
            verifier,
        }
    }

    // Create a new `TlsConnector` with custom ALPN protocols.
    pub fn new_with_tls_default(inner_connector: C, alpn: Option<Vec<&str>>) -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let roots = Arc::new(root_store);

        let mut cfg = ClientConfig::builder()
            .with_root_certificates(roots.clone())
            .with_no_client_auth();

        // Set ALPN from client side
        if let Some(alpn) = alpn {
            cfg.alpn_protocols = alpn.iter().map(|a| a.as_bytes().to_vec()).collect();
        }

        let verifier = WebPkiServerVerifier::builder(roots)
            .build()
            .ok()
            .map(|v| v as Arc<dyn ServerCertVerifier>);
        TlsConnector::new(inner_connector, Arc::new(cfg), verifier)
    }

    #[inline]
    pub fn inner_connector(&self) -> &C {
        &self.inner_connector
    }

    #[inline]
    pub fn tls_config(&self) -> &Arc<ClientConfig> {
        &self.tls_config
    }
}

impl<C: Default> Default for TlsConnector<C> {
    /// Create a new `TlsConnector` with the default inner connector.
    /// Additionally, the default ALPN protocols are set to `h2` and `http/1.1`.
    #[inline]
    fn default() -> Self {
        let alpn = Some(vec!["h2", "http/1.1"]);
        TlsConnector::new_with_tls_default(Default::default(), alpn)
    }
}

impl<C> Connector for TlsConnector<C>
where
    C: Connector,
{
    type Connection = TlsSocket<C::Connection>;

    fn connect(&self, target: &Target) -> Result<Self::Connection> {
        let inner = self.inner_connector.connect(target)?;
        let server_name =
            ServerName::try_from(target.server_name.to_string()).map_err(FromUriError::from)?;
        let config = match &target.alpn {
            Some(alpn) => {
                let mut cfg = (*self.tls_config).clone();
                cfg.alpn_protocols = alpn.iter().map(|a| a.as_bytes().to_vec()).collect();
                Arc::new(cfg)
            }
            None => self.tls_config.clone(),
        };
        let conn = ClientConnection::new(config, server_name)?;
        Ok(TlsSocket::new(inner, conn, self.verifier.clone()))
    }
}

/// TLS session layered over a non-blocking socket.
pub struct TlsSocket<S> {
    inner: S,
    conn: ClientConnection,
    verifier: Option<Arc<dyn ServerCertVerifier>>,
    incoming: ByteBuffer,
    outgoing: ByteBuffer,
    protocol: &'static str,
    handshaken: bool,
}

impl<S: Debug> Debug for TlsSocket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSocket")
            .field("inner", &self.inner)
            .field("protocol", &self.protocol)
            .field("handshaken", &self.handshaken)
            .finish()
    }
}

#[inline]
fn tls_error(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl<S: Socket> TlsSocket<S> {
    pub fn new(
        inner: S,
        conn: ClientConnection,
        verifier: Option<Arc<dyn ServerCertVerifier>>,
    ) -> Self {
        Self {
            inner,
            conn,
            verifier,
            incoming: ByteBuffer::new(TLS_BUFFER_SIZE),
            outgoing: ByteBuffer::new(TLS_BUFFER_SIZE),
            protocol: "http/1.1",
            handshaken: false,
        }
    }

    #[inline]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Move queued records to the inner socket until it would block.
    fn flush_tls(&mut self) -> io::Result<Transfer> {
        let mut total = 0;
        loop {
            while self.conn.wants_write() && !self.outgoing.is_full() {
                if self.conn.write_tls(&mut self.outgoing)? == 0 {
                    break;
                }
            }
            if self.outgoing.is_empty() {
                return Ok(Transfer::Bytes(total));
            }
            match self.inner.write(&mut self.outgoing)? {
                Transfer::Bytes(n) => total += n,
                other => return Ok(other),
            }
        }
    }

    /// Read ciphertext and hand it to the session.
    fn fill(&mut self) -> io::Result<Transfer> {
        let max = self.incoming.remaining();
        let read = self.inner.read(max, &mut self.incoming)?;
        while !self.incoming.is_empty() && self.conn.wants_read() {
            let mut slice = self.incoming.as_slice();
            let n = self.conn.read_tls(&mut slice)?;
            self.incoming.consume(n);
            self.conn.process_new_packets().map_err(tls_error)?;
            if n == 0 {
                break;
            }
        }
        Ok(read)
    }
}

impl<S: Socket> Socket for TlsSocket<S> {
    fn connect(&mut self) -> io::Result<()> {
        if self.handshaken {
            return Ok(());
        }
        self.inner.connect()?;
        loop {
            if let Transfer::Eof = self.flush_tls()? {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            if !self.conn.is_handshaking() {
                self.handshaken = true;
                self.protocol = match self.conn.alpn_protocol() {
                    Some(b"h2") => "h2",
                    _ => "http/1.1",
                };
                #[cfg(feature = "logging")]
                tracing::debug!("tls handshake done, alpn {}", self.protocol);
                return Ok(());
            }
            match self.fill()? {
                Transfer::Bytes(_) => continue,
                Transfer::WouldBlock => return Err(io::ErrorKind::WouldBlock.into()),
                Transfer::Eof => return Err(io::ErrorKind::UnexpectedEof.into()),
            }
        }
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.handshaken && self.inner.is_connected()
    }

    fn read(&mut self, max: usize, buf: &mut ByteBuffer) -> io::Result<Transfer> {
        if max == 0 || buf.is_full() {
            return Ok(Transfer::WouldBlock);
        }
        self.flush_tls()?;
        loop {
            match buf.read_from(&mut self.conn.reader(), max) {
                // close_notify
                Ok(0) => return Ok(Transfer::Eof),
                Ok(n) => return Ok(Transfer::Bytes(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Transfer::Eof),
                Err(e) => return Err(e),
            }
            match self.fill()? {
                Transfer::Bytes(_) => continue,
                other => return Ok(other),
            }
        }
    }

    fn write(&mut self, buf: &mut ByteBuffer) -> io::Result<Transfer> {
        let n = if buf.is_empty() {
            0
        } else {
            self.conn.writer().write(buf.as_slice())?
        };
        buf.consume(n);
        if let Transfer::Eof = self.flush_tls()? {
            return Ok(Transfer::Eof);
        }
        if n == 0 && !buf.is_empty() {
            return Ok(Transfer::WouldBlock);
        }
        Ok(Transfer::Bytes(n))
    }

    fn close(&mut self) {
        if self.handshaken {
            self.conn.send_close_notify();
            let _ = self.flush_tls();
        }
        self.inner.close();
    }

    #[inline]
    fn protocol(&self) -> &str {
        self.protocol
    }

    fn interests(&self) -> Option<Interest> {
        if !self.inner.is_connected() {
            return self.inner.interests();
        }
        if self.conn.is_handshaking() {
            return Interest::from_flags(true, self.wants_write());
        }
        None
    }

    #[inline]
    fn wants_write(&self) -> bool {
        !self.outgoing.is_empty() || self.conn.wants_write()
    }

    #[inline]
    fn raw_fd(&self) -> Option<RawFd> {
        self.inner.raw_fd()
    }

    #[inline]
    fn addresses(&self) -> &[IpAddr] {
        self.inner.addresses()
    }

    #[inline]
    fn failed_address(&self) -> Option<IpAddr> {
        self.inner.failed_address()
    }

    fn verify_hostname(&self, host: &str) -> bool {
        let (Some(verifier), Some(certs)) = (&self.verifier, self.conn.peer_certificates()) else {
            return false;
        };
        let Some((end_entity, intermediates)) = certs.split_first() else {
            return false;
        };
        let Ok(name) = ServerName::try_from(host.to_string()) else {
            return false;
        };
        verifier
            .verify_server_cert(end_entity, intermediates, &name, &[], UnixTime::now())
            .is_ok()
    }
}
