//! In-memory sockets for channel, pool and engine tests.
use std::{
    collections::VecDeque,
    io,
    net::IpAddr,
    os::fd::RawFd,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use http::Request;

use crate::{
    buffer::ByteBuffer,
    connectors::{Socket, SocketFactory, Target, Transfer},
    selector::Interest,
    Origin, PendingRequest, RequestId, Result,
};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    /// Results handed out by successive `connect` calls; empty means success.
    pub connect: VecDeque<io::Result<()>>,
    pub inbound: Vec<u8>,
    pub written: Vec<u8>,
    pub eof: bool,
    pub closed: bool,
    pub connected: bool,
    pub failed: Option<IpAddr>,
    pub protocol: Option<&'static str>,
    pub verified_hosts: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockHandle(pub Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn push_inbound(&self, data: &[u8]) {
        self.with(|s| s.inbound.extend_from_slice(data));
    }

    pub fn written(&self) -> String {
        self.with(|s| String::from_utf8_lossy(&s.written).into_owned())
    }
}

#[derive(Debug)]
pub(crate) struct MockSocket {
    state: MockHandle,
    addresses: Vec<IpAddr>,
}

impl Socket for MockSocket {
    fn connect(&mut self) -> io::Result<()> {
        self.state.with(|s| match s.connect.pop_front() {
            None | Some(Ok(())) => {
                s.connected = true;
                Ok(())
            }
            Some(Err(e)) => Err(e),
        })
    }

    fn is_connected(&self) -> bool {
        self.state.with(|s| s.connected)
    }

    fn read(&mut self, max: usize, buf: &mut ByteBuffer) -> io::Result<Transfer> {
        self.state.with(|s| {
            if s.inbound.is_empty() {
                return Ok(if s.eof {
                    Transfer::Eof
                } else {
                    Transfer::WouldBlock
                });
            }
            let n = buf.append(&s.inbound[..max.min(s.inbound.len())]);
            s.inbound.drain(..n);
            Ok(Transfer::Bytes(n))
        })
    }

    fn write(&mut self, buf: &mut ByteBuffer) -> io::Result<Transfer> {
        self.state.with(|s| {
            if s.eof {
                return Ok(Transfer::Eof);
            }
            let n = buf.len();
            s.written.extend_from_slice(buf.as_slice());
            buf.consume(n);
            Ok(Transfer::Bytes(n))
        })
    }

    fn close(&mut self) {
        self.state.with(|s| s.closed = true);
    }

    fn protocol(&self) -> &str {
        self.state.with(|s| s.protocol.unwrap_or("http/1.1"))
    }

    fn interests(&self) -> Option<Interest> {
        if self.is_connected() {
            None
        } else {
            Some(Interest::Writable)
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    fn failed_address(&self) -> Option<IpAddr> {
        self.state.with(|s| s.failed)
    }

    fn verify_hostname(&self, host: &str) -> bool {
        self.state.with(|s| s.verified_hosts.iter().any(|h| h == host))
    }
}

/// Hands out the queued sockets in order, then fresh default ones.
#[derive(Debug, Default)]
pub(crate) struct MockConnector {
    sockets: Mutex<VecDeque<MockHandle>>,
    pub built: Mutex<Vec<MockHandle>>,
    pub targets: Mutex<Vec<Target>>,
}

impl MockConnector {
    pub fn push(&self, handle: MockHandle) {
        self.sockets.lock().unwrap().push_back(handle);
    }

    pub fn built(&self) -> usize {
        self.built.lock().unwrap().len()
    }
}

impl SocketFactory for MockConnector {
    fn build(&self, target: &Target) -> Result<Box<dyn Socket>> {
        let state = self.sockets.lock().unwrap().pop_front().unwrap_or_default();
        self.built.lock().unwrap().push(state.clone());
        self.targets.lock().unwrap().push(target.clone());
        Ok(Box::new(MockSocket {
            state,
            addresses: target.addresses.clone(),
        }))
    }
}

pub(crate) fn request(id: u64, url: &str) -> PendingRequest {
    let request = Request::get(url).body(Bytes::new()).unwrap();
    let origin = Origin::try_from(request.uri()).unwrap();
    PendingRequest::new(RequestId(id), origin, Arc::new(request))
}
