//! One socket, its buffers and the protocol driver speaking over it.
//!
//! A channel is driven entirely from the engine's tick: the selector asks it
//! for interests and a descriptor, and `call` moves bytes once the
//! descriptor is ready. Everything a caller needs to learn comes back out of
//! `poll_event`.
use std::{
    collections::VecDeque,
    io,
    net::IpAddr,
    os::fd::RawFd,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};
use smol_str::SmolStr;

use crate::{
    altsvc::{AltSvcCache, AltSvcEntry},
    buffer::ByteBuffer,
    connectors::{is_unreachable, Socket, SocketFactory, Target, Transfer},
    error::{ErrorResponse, Outcome},
    http::{build_driver, DriverEvent, ProtocolDriver},
    selector::{Interest, Selectable, Token},
    Options, Origin, PendingRequest, RequestId, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Open,
    Closing,
    Closed,
}

/// What the engine should do with a channel after its tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Deregister and hand the channel back to the pool.
    Close,
}

#[derive(Debug)]
pub enum ChannelEvent {
    Response {
        id: RequestId,
        outcome: Outcome,
    },
    Promise {
        parent: RequestId,
        request: Request<Bytes>,
        response: Response<Bytes>,
    },
    AltSvc {
        entry: AltSvcEntry,
    },
    /// The peer refused to serve `origin` on this connection. The requests
    /// were taken off the channel and must be resent elsewhere.
    Uncoalesce {
        origin: Origin,
        requests: Vec<PendingRequest>,
    },
    /// A connect attempt to `address` failed for lack of a route. The
    /// channel was reset and keeps its requests.
    Unreachable {
        address: IpAddr,
    },
    Close,
}

pub struct Channel {
    id: Token,
    origin: Origin,
    origins: Vec<Origin>,
    server_name: SmolStr,
    options: Arc<Options>,
    factory: Arc<dyn SocketFactory>,
    altsvc: Arc<AltSvcCache>,
    addresses: Vec<IpAddr>,
    alpn: Option<Vec<String>>,
    coalescing: bool,
    socket: Option<Box<dyn Socket>>,
    state: State,
    read_buf: ByteBuffer,
    write_buf: ByteBuffer,
    pending: VecDeque<PendingRequest>,
    driver: Option<Box<dyn ProtocolDriver>>,
    threshold: Duration,
    remaining: Duration,
    error: Option<Arc<TransportError>>,
    closing: bool,
    eof: bool,
    events: VecDeque<ChannelEvent>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("origins", &self.origins)
            .field("state", &self.state)
            .field("addresses", &self.addresses)
            .field("pending", &self.pending.len())
            .field("protocol", &self.protocol())
            .finish()
    }
}

impl Channel {
    pub fn new(
        id: Token,
        origin: Origin,
        options: Arc<Options>,
        factory: Arc<dyn SocketFactory>,
        altsvc: Arc<AltSvcCache>,
    ) -> Self {
        let buffer_size = options.buffer_size;
        let threshold = options.timeouts.connect;
        Self {
            id,
            origins: vec![origin.clone()],
            server_name: origin.host.clone(),
            origin,
            options,
            factory,
            altsvc,
            addresses: Vec::new(),
            alpn: None,
            coalescing: true,
            socket: None,
            state: State::Idle,
            read_buf: ByteBuffer::new(buffer_size),
            write_buf: ByteBuffer::new(buffer_size),
            pending: VecDeque::new(),
            driver: None,
            threshold,
            remaining: threshold,
            error: None,
            closing: false,
            eof: false,
            events: VecDeque::new(),
        }
    }

    /// Never coalesced with other origins and limited to HTTP/1.1; used for
    /// origins a server refused to serve on a shared connection.
    pub fn dedicated(mut self) -> Self {
        self.coalescing = false;
        self.alpn = Some(vec!["http/1.1".to_string()]);
        self
    }

    /// Authenticate the peer as `host` instead of the origin's own host,
    /// for connections to an alternative service.
    pub fn with_server_name(mut self, host: &str) -> Self {
        self.server_name = SmolStr::new(host);
        self
    }

    #[inline]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    #[inline]
    pub fn is_dedicated(&self) -> bool {
        !self.coalescing
    }

    #[inline]
    pub fn id(&self) -> Token {
        self.id
    }

    #[inline]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    #[inline]
    pub fn origins(&self) -> &[Origin] {
        &self.origins
    }

    #[inline]
    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    pub fn set_addresses(&mut self, addresses: Vec<IpAddr>) {
        self.addresses = addresses;
    }

    #[inline]
    pub fn error(&self) -> Option<&Arc<TransportError>> {
        self.error.as_ref()
    }

    /// Negotiated protocol once a socket exists.
    #[inline]
    pub fn protocol(&self) -> Option<&str> {
        self.socket.as_ref().map(|s| s.protocol())
    }

    pub fn pending_ids(&self) -> Vec<RequestId> {
        self.pending.iter().map(|r| r.id).collect()
    }

    /// Requests queued or in flight.
    #[inline]
    pub fn has_work(&self) -> bool {
        !self.pending.is_empty() || self.driver.as_ref().is_some_and(|d| !d.is_empty())
    }

    #[inline]
    pub fn matches(&self, origin: &Origin) -> bool {
        self.origins.contains(origin)
    }

    /// Can carry requests for `origin` whose peer must be authenticated as
    /// `server_name`.
    pub fn serves(&self, origin: &Origin, server_name: &str) -> bool {
        if !self.matches(origin) {
            return false;
        }
        if server_name == origin.host {
            self.server_name == self.origin.host
        } else {
            self.origin == *origin && self.server_name == server_name
        }
    }

    /// Can take new requests.
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.error.is_none() && matches!(self.state, State::Idle | State::Open) && !self.closing
    }

    /// Fit to sit idle in a pool.
    #[inline]
    pub fn is_reusable(&self) -> bool {
        self.is_usable() && !self.has_work()
    }

    /// Remaining timeout budget, when the channel is waiting on something.
    pub fn timeout(&self) -> Option<Duration> {
        match self.state {
            State::Closed => None,
            State::Idle if self.pending.is_empty() || self.addresses.is_empty() => None,
            _ => Some(self.remaining),
        }
    }

    #[inline]
    pub fn poll_event(&mut self) -> Option<ChannelEvent> {
        self.events.pop_front()
    }

    /// Queue a request on this channel.
    pub fn send(&mut self, mut request: PendingRequest) {
        if let Some(error) = self.error.as_ref() {
            let outcome = Err(ErrorResponse::shared(error.clone()));
            self.events.push_back(ChannelEvent::Response {
                id: request.id,
                outcome,
            });
            return;
        }
        if request.alt_used.is_none() && request.origin != self.origin {
            let redirected = self
                .altsvc
                .lookup(&request.origin)
                .iter()
                .any(|e| e.alternative == self.origin);
            if redirected {
                request.alt_used = HeaderValue::from_str(&self.origin.authority()).ok();
            }
        }
        let was_idle = !self.has_work();
        match self.driver.as_mut() {
            Some(driver) if self.state == State::Open && !self.write_buf.is_full() => {
                driver.send(request)
            }
            _ => self.pending.push_back(request),
        }
        if was_idle && self.state == State::Open {
            self.rearm();
        }
    }

    /// Run one tick: connect if needed, then read and write until the
    /// socket would block.
    pub fn call(&mut self) -> TickOutcome {
        if self.state == State::Idle {
            self.connect();
        }
        if matches!(self.state, State::Open | State::Closing) {
            self.flush_pending();
            self.read();
            self.write();
            self.settle();
        }
        if matches!(self.state, State::Open | State::Closing) {
            self.rearm();
        }
        match self.state {
            State::Closed => TickOutcome::Close,
            _ => TickOutcome::Continue,
        }
    }

    /// Start or continue connecting. Stays idle while the attempt is in
    /// flight.
    pub fn connect(&mut self) {
        if self.state != State::Idle || self.error.is_some() || self.addresses.is_empty() {
            return;
        }
        if self.socket.is_none() {
            let mut target = Target::new(self.origin.clone(), self.addresses.clone());
            target.alpn = self.alpn.clone();
            target.server_name = self.server_name.clone();
            match self.factory.build(&target) {
                Ok(socket) => {
                    self.socket = Some(socket);
                    self.threshold = self.options.timeouts.connect;
                    self.remaining = self.threshold;
                }
                Err(e) => return self.fail(e),
            }
        }
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        match socket.connect() {
            Ok(()) => self.transition(State::Open),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if is_unreachable(&e) => {
                let address = socket.failed_address();
                #[cfg(feature = "logging")]
                tracing::debug!("channel {:?} unreachable {address:?}: {e}", self.id);
                self.reset();
                if let Some(address) = address {
                    self.events.push_back(ChannelEvent::Unreachable { address });
                } else {
                    self.fail(TransportError::Unreachable(e));
                }
            }
            Err(e) => self.fail(TransportError::Connect(e)),
        }
    }

    fn transition(&mut self, next: State) {
        if self.state == next {
            return;
        }
        #[cfg(feature = "logging")]
        tracing::debug!("channel {:?} {:?} -> {next:?}", self.id, self.state);
        match next {
            State::Open => {
                let protocol = self.socket.as_ref().map(|s| s.protocol()).unwrap_or("http/1.1");
                self.driver = Some(build_driver(protocol, &self.options));
                self.state = State::Open;
                self.rearm();
                self.flush_pending();
            }
            State::Closing => {
                if self.state == State::Open {
                    self.state = State::Closing;
                }
            }
            State::Closed => {
                if let Some(socket) = self.socket.as_mut() {
                    socket.close();
                }
                self.socket = None;
                self.read_buf.clear();
                self.write_buf.clear();
                self.state = State::Closed;
                let leftover = self.take_requests();
                if !leftover.is_empty() {
                    let error = Arc::new(TransportError::ClosedHandle);
                    self.respond_all(leftover, &error);
                }
                self.driver = None;
                self.events.push_back(ChannelEvent::Close);
            }
            State::Idle => self.state = State::Idle,
        }
    }

    /// Reset the budget for the current phase.
    fn rearm(&mut self) {
        let timeouts = &self.options.timeouts;
        self.threshold = match self.state {
            State::Idle => timeouts.connect,
            _ if !self.has_work() => timeouts.keep_alive,
            _ if !self.write_buf.is_empty() => timeouts.write_timeout(),
            _ => timeouts.read_timeout(),
        };
        self.remaining = self.threshold;
    }

    fn flush_pending(&mut self) {
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        if self.state != State::Open {
            return;
        }
        while !self.write_buf.is_full() {
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            driver.send(request);
        }
    }

    fn read(&mut self) {
        while self.state == State::Open && !self.read_buf.is_full() {
            let Some(socket) = self.socket.as_mut() else {
                return;
            };
            let max = self.options.window_size.min(self.read_buf.remaining());
            match socket.read(max, &mut self.read_buf) {
                Ok(Transfer::Bytes(_)) => {
                    if let Some(driver) = self.driver.as_mut() {
                        driver.feed(self.read_buf.as_slice());
                    }
                    self.read_buf.clear();
                    self.drain_driver();
                }
                Ok(Transfer::WouldBlock) => return,
                Ok(Transfer::Eof) => return self.on_eof(),
                Err(e) => return self.fail(TransportError::Io(e)),
            }
        }
    }

    fn write(&mut self) {
        while matches!(self.state, State::Open | State::Closing) {
            self.flush_pending();
            if let Some(driver) = self.driver.as_mut() {
                driver.consume(&mut self.write_buf);
            }
            let Some(socket) = self.socket.as_mut() else {
                return;
            };
            if self.write_buf.is_empty() && !socket.wants_write() {
                return;
            }
            match socket.write(&mut self.write_buf) {
                Ok(Transfer::Bytes(0)) | Ok(Transfer::WouldBlock) => return,
                Ok(Transfer::Bytes(_)) => {}
                Ok(Transfer::Eof) => return self.on_eof(),
                Err(e) => return self.fail(TransportError::Io(e)),
            }
        }
    }

    /// Finish a graceful close once everything queued went out.
    fn settle(&mut self) {
        if self.state != State::Closing {
            return;
        }
        let flushed = self.write_buf.is_empty()
            && !self.socket.as_ref().is_some_and(|s| s.wants_write())
            && !self.driver.as_ref().is_some_and(|d| d.wants_write());
        if flushed && !self.has_work() {
            self.transition(State::Closed);
        }
    }

    fn on_eof(&mut self) {
        #[cfg(feature = "logging")]
        tracing::debug!("channel {:?} eof", self.id);
        self.eof = true;
        self.write_buf.clear();
        match self.driver.as_mut() {
            Some(driver) => {
                driver.on_eof();
                self.drain_driver();
            }
            None => self.fail(TransportError::Eof),
        }
        // a reset inside the driver already moved to a fresh socket
        if self.eof && matches!(self.state, State::Open | State::Closing) {
            self.transition(State::Closed);
        }
    }

    fn drain_driver(&mut self) {
        while let Some(event) = self.driver.as_mut().and_then(|d| d.poll_event()) {
            match event {
                DriverEvent::Response(request, response) => self.on_response(request, response),
                DriverEvent::Promise {
                    parent,
                    request,
                    response,
                } => self.events.push_back(ChannelEvent::Promise {
                    parent: parent.id,
                    request,
                    response,
                }),
                DriverEvent::Origin(origin) => self.on_origin(origin),
                DriverEvent::Error(request, error) => self.events.push_back(ChannelEvent::Response {
                    id: request.id,
                    outcome: Err(ErrorResponse::new(error)),
                }),
                DriverEvent::ConnectionError(error) => return self.fail(error),
                DriverEvent::Close => {
                    self.transition(State::Closing);
                    self.settle();
                }
                DriverEvent::Reset => return self.on_reset(),
            }
        }
    }

    fn on_response(&mut self, request: PendingRequest, response: Response<Bytes>) {
        if response.status() == StatusCode::MISDIRECTED_REQUEST && request.origin != self.origin {
            #[cfg(feature = "logging")]
            tracing::info!("channel {:?} misdirected {}", self.id, request.origin);
            let origin = request.origin.clone();
            let mut requests = vec![request];
            requests.extend(self.unmerge(&origin));
            self.events
                .push_back(ChannelEvent::Uncoalesce { origin, requests });
            return;
        }
        if request.alt_used.is_none() {
            let values: Vec<&str> = response
                .headers()
                .get_all("alt-svc")
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            if !values.is_empty() {
                for entry in self.altsvc.store_response(&request.origin, &values) {
                    self.events.push_back(ChannelEvent::AltSvc { entry });
                }
            }
        }
        self.events.push_back(ChannelEvent::Response {
            id: request.id,
            outcome: Ok(response),
        });
    }

    fn on_origin(&mut self, origin: Origin) {
        if self.matches(&origin) || !self.coalescing {
            return;
        }
        let verified = self
            .socket
            .as_ref()
            .is_some_and(|s| s.verify_hostname(&origin.host));
        if verified && origin.scheme == self.origin.scheme {
            #[cfg(feature = "logging")]
            tracing::debug!("channel {:?} authoritative for {origin}", self.id);
            self.origins.push(origin);
        }
    }

    /// The driver went away with requests the peer never processed: replay
    /// them on a fresh socket, unless the caller asked to close.
    fn on_reset(&mut self) {
        let requests = self.take_requests();
        if self.closing {
            let error = Arc::new(TransportError::ClosedHandle);
            self.respond_all(requests, &error);
            return self.transition(State::Closed);
        }
        #[cfg(feature = "logging")]
        tracing::debug!("channel {:?} reset with {} pending", self.id, requests.len());
        self.reset();
        self.pending = requests.into();
        self.connect();
    }

    /// Drop the socket and driver and go back to idle. Requests stay.
    pub fn reset(&mut self) {
        let mut requests = self.take_requests();
        requests.extend(self.pending.drain(..));
        if let Some(socket) = self.socket.as_mut() {
            socket.close();
        }
        self.socket = None;
        self.driver = None;
        self.read_buf.clear();
        self.write_buf.clear();
        self.pending = requests.into();
        self.eof = false;
        self.state = State::Idle;
        self.threshold = self.options.timeouts.connect;
        self.remaining = self.threshold;
    }

    /// Requests from the driver followed by the local queue, in order.
    fn take_requests(&mut self) -> Vec<PendingRequest> {
        let mut requests = self
            .driver
            .as_mut()
            .map(|d| d.take_pending())
            .unwrap_or_default();
        requests.extend(self.pending.drain(..));
        requests
    }

    fn respond_all(&mut self, requests: Vec<PendingRequest>, error: &Arc<TransportError>) {
        for request in requests {
            self.events.push_back(ChannelEvent::Response {
                id: request.id,
                outcome: Err(ErrorResponse::shared(error.clone())),
            });
        }
    }

    /// Fail every request with `error` and close. The error sticks: later
    /// sends get it back immediately.
    pub fn fail(&mut self, error: TransportError) {
        #[cfg(feature = "logging")]
        tracing::error!("channel {:?} failed: {error}", self.id);
        let error = Arc::new(error);
        let requests = self.take_requests();
        self.respond_all(requests, &error);
        self.error = Some(error);
        if self.state != State::Closed {
            self.transition(State::Closed);
        }
    }

    /// Forget the addresses of `failed`'s family. With nothing left the
    /// channel fails as unreachable.
    pub fn drop_unreachable(&mut self, failed: IpAddr) -> usize {
        self.addresses
            .retain(|ip| ip.is_ipv4() != failed.is_ipv4());
        if self.addresses.is_empty() {
            self.fail(TransportError::Unreachable(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no reachable address left after {failed}"),
            )));
        }
        self.addresses.len()
    }

    /// Account for `elapsed` without readiness. An exhausted budget fails the
    /// channel, except an open channel without work, which just closes.
    pub fn handle_timeout(&mut self, elapsed: Duration) {
        if self.timeout().is_none() {
            return;
        }
        self.remaining = self.remaining.saturating_sub(elapsed);
        if !self.remaining.is_zero() {
            return;
        }
        let threshold = self.threshold;
        match self.state {
            State::Idle => self.fail(TransportError::ConnectTimeout(threshold)),
            State::Open if !self.has_work() => {
                #[cfg(feature = "logging")]
                tracing::debug!("channel {:?} keep-alive expired", self.id);
                self.close();
            }
            State::Open | State::Closing => {
                let error = if !self.write_buf.is_empty() {
                    TransportError::WriteTimeout(threshold)
                } else if self.has_work() {
                    TransportError::ReadTimeout(threshold)
                } else {
                    TransportError::OperationTimeout(threshold)
                };
                self.fail(error);
            }
            State::Closed => {}
        }
    }

    /// Gracefully close: in-flight requests finish, nothing new is sent.
    pub fn close(&mut self) {
        self.closing = true;
        match self.state {
            State::Idle => {
                let requests = self.take_requests();
                let error = Arc::new(TransportError::ClosedHandle);
                self.respond_all(requests, &error);
                self.transition(State::Closed);
            }
            State::Open => {
                self.transition(State::Closing);
                if let Some(driver) = self.driver.as_mut() {
                    driver.close();
                }
                self.drain_driver();
                self.write();
                self.settle();
            }
            State::Closing | State::Closed => {}
        }
    }

    /// Same scheme and port, overlapping addresses, and still usable.
    pub fn is_mergeable(&self, other: &Channel) -> bool {
        self.id != other.id
            && self.is_usable()
            && self.origin.scheme == other.origin.scheme
            && self.origin.port == other.origin.port
            && self.addresses.iter().any(|ip| other.addresses.contains(ip))
    }

    /// Whether this channel may also serve `other`'s origin.
    pub fn is_coalescable(&self, other: &Channel) -> bool {
        if !self.coalescing || !other.coalescing {
            return false;
        }
        if self.origin == other.origin {
            return self.server_name == other.server_name;
        }
        // alternative channels stay on their own socket
        if other.server_name != other.origin.host {
            return false;
        }
        self.origin.is_tls()
            && self.state == State::Open
            && self.protocol() == Some("h2")
            && self
                .socket
                .as_ref()
                .is_some_and(|s| s.verify_hostname(&other.origin.host))
    }

    /// Take over `other`'s origins and requests. `other` is left empty.
    pub fn merge(&mut self, other: &mut Channel) {
        #[cfg(feature = "logging")]
        tracing::debug!("channel {:?} merging {:?}", self.id, other.id);
        for origin in other.origins.drain(..) {
            if !self.origins.contains(&origin) {
                self.origins.push(origin);
            }
        }
        for request in other.take_requests() {
            self.send(request);
        }
    }

    /// Stop serving `origin` and return its requests, oldest first.
    pub fn unmerge(&mut self, origin: &Origin) -> Vec<PendingRequest> {
        if origin != &self.origin {
            self.origins.retain(|o| o != origin);
        }
        let mut released = self
            .driver
            .as_mut()
            .map(|d| d.release(origin))
            .unwrap_or_default();
        let (matching, kept): (VecDeque<_>, VecDeque<_>) =
            self.pending.drain(..).partition(|r| &r.origin == origin);
        self.pending = kept;
        released.extend(matching);
        released
    }
}

impl Selectable for Channel {
    fn interests(&mut self) -> Option<Interest> {
        match self.state {
            State::Closed => None,
            State::Idle => {
                if self.pending.is_empty() || self.addresses.is_empty() || self.error.is_some() {
                    return None;
                }
                match self.socket.as_ref() {
                    Some(socket) => socket.interests(),
                    None => Some(Interest::Writable),
                }
            }
            State::Open | State::Closing => {
                let writable = !self.write_buf.is_empty()
                    || !self.pending.is_empty()
                    || self.socket.as_ref().is_some_and(|s| s.wants_write())
                    || self.driver.as_ref().is_some_and(|d| d.wants_write());
                let readable = self.state == State::Open && !self.read_buf.is_full();
                Interest::from_flags(readable, writable)
            }
        }
    }

    fn raw_fd(&mut self) -> Option<RawFd> {
        if self.state == State::Idle {
            self.connect();
        }
        self.socket.as_ref().and_then(|s| s.raw_fd())
    }
}
