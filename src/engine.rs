//! Single-threaded orchestration of channels.
//!
//! The engine owns its channels by token, routes every request to a channel
//! (through the Alt-Svc cache, existing channels, coalescing candidates and
//! finally the pool), runs one selector pass per `next_tick` and buffers
//! outcomes until the caller asks for them.
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::Request;
use smol_str::SmolStr;

use crate::{
    altsvc::AltSvcCache,
    channel::{Channel, ChannelEvent, State, TickOutcome},
    error::{ErrorResponse, Outcome},
    events::{Emitter, Event, EventKind},
    pool::Pool,
    resolver::Resolver,
    selector::{Selectable, Selector, Sources, Token, RESOLVER},
    timers::{Timers, TotalTimer},
    Options, Origin, PendingRequest, RequestId, Result, TransportError,
};

type RetryPolicy = Box<dyn Fn(&Request<Bytes>, &TransportError) -> bool + Send>;

/// Retry idempotent requests that failed at the connection level.
pub fn default_retry_policy(request: &Request<Bytes>, error: &TransportError) -> bool {
    request.method().is_idempotent() && error.is_retryable()
}

/// Where a new channel ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Registered with the selector under its own token.
    Registered(Token),
    /// Folded into the channel with this token.
    Coalesced(Token),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Attempt(RequestId, u32),
    Total(RequestId),
}

impl Deadline {
    #[inline]
    fn id(&self) -> RequestId {
        match self {
            Deadline::Attempt(id, _) | Deadline::Total(id) => *id,
        }
    }
}

struct Tracked {
    request: Arc<Request<Bytes>>,
    origin: Origin,
    retries: usize,
    attempt: u32,
    total: Option<TotalTimer>,
}

#[derive(Default)]
struct Handles {
    channels: HashMap<Token, Channel>,
    resolver: Option<Box<dyn Resolver>>,
}

impl Sources for Handles {
    fn source(&mut self, token: Token) -> Option<&mut dyn Selectable> {
        if token == RESOLVER {
            return self.resolver.as_mut().map(|r| r as &mut dyn Selectable);
        }
        self.channels.get_mut(&token).map(|c| c as &mut dyn Selectable)
    }
}

pub struct Engine {
    options: Arc<Options>,
    pool: Arc<Pool>,
    altsvc: Arc<AltSvcCache>,
    selector: Selector,
    handles: Handles,
    resolving: HashMap<SmolStr, Vec<Token>>,
    requests: HashMap<RequestId, Tracked>,
    responses: HashMap<RequestId, Outcome>,
    timers: Timers<Deadline>,
    retry_policy: RetryPolicy,
    emitter: Emitter,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("channels", &self.handles.channels.len())
            .field("requests", &self.requests.len())
            .field("responses", &self.responses.len())
            .finish()
    }
}

impl Engine {
    pub fn new(options: Options, pool: Arc<Pool>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            altsvc: pool.altsvc().clone(),
            options: Arc::new(options),
            pool,
            selector: Selector::new(),
            handles: Handles::default(),
            resolving: HashMap::new(),
            requests: HashMap::new(),
            responses: HashMap::new(),
            timers: Timers::new(),
            retry_policy: Box::new(default_retry_policy),
            emitter: Emitter::new(),
        })
    }

    /// Engine with its own Alt-Svc cache and a pool dialling TCP and TLS.
    pub fn with_options(options: Options) -> Result<Self> {
        let altsvc = Arc::new(AltSvcCache::new());
        let pool = Arc::new(Pool::from_options(&options, altsvc));
        Self::new(options, pool)
    }

    #[inline]
    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    #[inline]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    #[inline]
    pub fn altsvc(&self) -> &Arc<AltSvcCache> {
        &self.altsvc
    }

    pub fn set_retry_policy<F>(&mut self, policy: F)
    where
        F: Fn(&Request<Bytes>, &TransportError) -> bool + Send + 'static,
    {
        self.retry_policy = Box::new(policy);
    }

    pub fn on<F>(&mut self, kind: EventKind, callback: F)
    where
        F: FnMut(&Event<'_>) + Send + 'static,
    {
        self.emitter.on(kind, callback);
    }

    pub fn once<F>(&mut self, kind: EventKind, callback: F)
    where
        F: FnMut(&Event<'_>) + Send + 'static,
    {
        self.emitter.once(kind, callback);
    }

    #[inline]
    pub fn channel(&self, token: Token) -> Option<&Channel> {
        self.handles.channels.get(&token)
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.handles.channels.len()
    }

    /// Submit a request. Its outcome is collected with `response`.
    pub fn send(&mut self, request: Request<Bytes>) -> Result<RequestId> {
        let origin = Origin::try_from(request.uri())?;
        let id = self.pool.next_request_id();
        let total = self.options.timeouts.total.map(|budget| {
            self.timers.after(budget, Deadline::Total(id));
            TotalTimer::new(budget)
        });
        self.requests.insert(
            id,
            Tracked {
                request: Arc::new(request),
                origin,
                retries: self.options.max_retries,
                attempt: 0,
                total,
            },
        );
        self.submit(id);
        Ok(id)
    }

    /// Submit `requests` and wait for all of them. Outcomes come back in
    /// submission order.
    pub fn perform<I>(&mut self, requests: I) -> Result<Vec<Outcome>>
    where
        I: IntoIterator<Item = Request<Bytes>>,
    {
        let requests: Vec<_> = requests.into_iter().collect();
        for request in requests.iter() {
            Origin::try_from(request.uri())?;
        }
        let ids = requests
            .into_iter()
            .map(|r| self.send(r))
            .collect::<Result<Vec<_>>>()?;

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            loop {
                if let Some(outcome) = self.response(id) {
                    outcomes.push(outcome);
                    break;
                }
                self.next_tick(Some(self.options.timeouts.operation))?;
            }
        }
        Ok(outcomes)
    }

    /// Take the outcome of `id` if it is final. A retryable failure with
    /// budget left is resubmitted instead and `None` is returned.
    pub fn response(&mut self, id: RequestId) -> Option<Outcome> {
        let outcome = self.responses.remove(&id)?;
        let retry = match (&outcome, self.requests.get_mut(&id)) {
            (Err(error), Some(tracked)) => {
                let in_budget = tracked.total.as_ref().map_or(true, |t| t.check().is_ok());
                let allowed = tracked.retries > 0
                    && in_budget
                    && (self.retry_policy)(&tracked.request, error.error());
                if allowed {
                    tracked.retries -= 1;
                }
                allowed
            }
            _ => false,
        };
        if retry {
            #[cfg(feature = "logging")]
            tracing::debug!("retrying request {id}");
            self.submit(id);
            return None;
        }
        self.requests.remove(&id);
        self.timers.retain(|d| d.id() != id);
        self.emitter.emit(&Event::Response {
            id,
            outcome: &outcome,
        });
        Some(outcome)
    }

    fn submit(&mut self, id: RequestId) {
        let Some(tracked) = self.requests.get_mut(&id) else {
            return;
        };
        tracked.attempt += 1;
        if let Some(timeout) = self.options.timeouts.request {
            self.timers.after(timeout, Deadline::Attempt(id, tracked.attempt));
        }
        let request = PendingRequest::new(id, tracked.origin.clone(), tracked.request.clone());
        self.dispatch(request);
    }

    /// The origin a request should actually be sent to.
    fn route(&self, origin: &Origin) -> Origin {
        self.altsvc
            .lookup(origin)
            .into_iter()
            .find(|e| e.is_supported() && e.alternative.scheme == origin.scheme)
            .map(|e| e.alternative)
            .unwrap_or_else(|| origin.clone())
    }

    fn dispatch(&mut self, request: PendingRequest) {
        let target = self.route(&request.origin);
        let server_name = request.origin.host.clone();
        if let Some(channel) = self
            .handles
            .channels
            .values_mut()
            .find(|c| c.is_usable() && c.serves(&target, &server_name))
        {
            return channel.send(request);
        }
        match self
            .pool
            .checkout_connection_for(&target, &server_name, &self.options)
        {
            Ok(mut channel) => {
                channel.send(request);
                if channel.addresses().is_empty() {
                    self.resolve(channel);
                } else {
                    self.bind(channel);
                }
            }
            Err(e) => self.deliver(request.id, Err(ErrorResponse::new(e))),
        }
    }

    /// Coalesce `channel` into a live or pooled channel that can carry its
    /// origin, or register it on its own.
    fn bind(&mut self, mut channel: Channel) -> Binding {
        if let Some(survivor) = self
            .handles
            .channels
            .values_mut()
            .find(|c| c.is_mergeable(&channel) && c.is_coalescable(&channel))
        {
            survivor.merge(&mut channel);
            let token = survivor.id();
            self.pool.release_connection(channel);
            return Binding::Coalesced(token);
        }
        if let Some(mut idle) = self.pool.checkout_mergeable_connection(&channel) {
            if idle.is_coalescable(&channel) {
                idle.merge(&mut channel);
                let token = idle.id();
                self.pool.release_connection(channel);
                self.register(idle);
                return Binding::Coalesced(token);
            }
            self.pool.checkin_connection(idle);
        }
        let token = channel.id();
        self.register(channel);
        Binding::Registered(token)
    }

    fn register(&mut self, channel: Channel) {
        let token = channel.id();
        self.selector.register(token);
        self.handles.channels.insert(token, channel);
    }

    /// Park `channel` until the resolver has its addresses.
    fn resolve(&mut self, channel: Channel) {
        let host = channel.origin().host.clone();
        let token = channel.id();
        self.handles.channels.insert(token, channel);
        let (pool, options) = (&self.pool, &self.options);
        let resolver = self
            .handles
            .resolver
            .get_or_insert_with(|| pool.checkout_resolver(&options.resolver));
        let waiting = self.resolving.entry(host.clone()).or_default();
        waiting.push(token);
        if waiting.len() == 1 {
            resolver.resolve(&host);
        }
        self.selector.register(RESOLVER);
        self.collect_answers();
    }

    fn collect_answers(&mut self) {
        while let Some((host, answer)) = self.handles.resolver.as_mut().and_then(|r| r.answer()) {
            let tokens = self.resolving.remove(&host).unwrap_or_default();
            for token in tokens {
                let Some(mut channel) = self.handles.channels.remove(&token) else {
                    continue;
                };
                match &answer {
                    Ok(addresses) => {
                        channel.set_addresses(addresses.clone());
                        self.bind(channel);
                    }
                    Err(_) => {
                        channel.fail(TransportError::Resolve(host.clone()));
                        self.handles.channels.insert(token, channel);
                    }
                }
            }
        }
    }

    /// Run one selector pass, then timeouts, deadlines and events.
    pub fn next_tick(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.collect_answers();
        self.process_events();

        let wait = [timeout, self.timers.wait_interval()]
            .into_iter()
            .chain(self.handles.channels.values().map(|c| c.timeout()))
            .flatten()
            .min();
        let started = Instant::now();
        let mut ready = Vec::new();
        let mut closing = Vec::new();
        let selected = self
            .selector
            .select(&mut self.handles, wait, |handles, monitor| {
                ready.push(monitor.token);
                if monitor.token == RESOLVER {
                    if let Some(resolver) = handles.resolver.as_mut() {
                        resolver.call();
                    }
                } else if let Some(channel) = handles.channels.get_mut(&monitor.token) {
                    if channel.call() == TickOutcome::Close {
                        closing.push(monitor.token);
                    }
                }
            });
        match selected {
            Ok(()) | Err(TransportError::SelectTimeout(_)) => {}
            Err(e) => return Err(e),
        }
        for token in closing {
            self.selector.deregister(token);
        }

        let elapsed = started.elapsed();
        for (token, channel) in self.handles.channels.iter_mut() {
            if !ready.contains(token) {
                channel.handle_timeout(elapsed);
            }
        }
        for token in self.selector.take_pruned() {
            if let Some(channel) = self.handles.channels.get_mut(&token) {
                channel.fail(TransportError::ClosedHandle);
            }
        }
        let mut expired = Vec::new();
        self.timers.fire(elapsed, |deadline| expired.push(deadline));
        for deadline in expired {
            self.on_deadline(deadline);
        }

        self.collect_answers();
        self.process_events();
        Ok(())
    }

    fn on_deadline(&mut self, deadline: Deadline) {
        let id = deadline.id();
        if self.responses.contains_key(&id) {
            return;
        }
        let Some(tracked) = self.requests.get_mut(&id) else {
            return;
        };
        let error = match deadline {
            Deadline::Attempt(_, attempt) if attempt == tracked.attempt => {
                let Some(timeout) = self.options.timeouts.request else {
                    return;
                };
                TransportError::RequestTimeout(timeout)
            }
            Deadline::Attempt(..) => return,
            Deadline::Total(_) => {
                tracked.retries = 0;
                let Some(total) = tracked.total else {
                    return;
                };
                TransportError::TotalTimeout(total.elapsed())
            }
        };
        #[cfg(feature = "logging")]
        tracing::info!("request {id} timed out: {error}");
        self.deliver(id, Err(ErrorResponse::new(error)));
    }

    /// Buffer an outcome. Late outcomes for finished or superseded attempts
    /// are dropped.
    fn deliver(&mut self, id: RequestId, outcome: Outcome) {
        if !self.requests.contains_key(&id) || self.responses.contains_key(&id) {
            return;
        }
        self.responses.insert(id, outcome);
    }

    fn process_events(&mut self) {
        loop {
            let mut progressed = false;
            let tokens: Vec<Token> = self.handles.channels.keys().copied().collect();
            for token in tokens {
                while let Some(event) = self
                    .handles
                    .channels
                    .get_mut(&token)
                    .and_then(|c| c.poll_event())
                {
                    progressed = true;
                    self.on_channel_event(token, event);
                }
            }
            if !progressed {
                break;
            }
        }
        self.sweep();
    }

    fn on_channel_event(&mut self, token: Token, event: ChannelEvent) {
        match event {
            ChannelEvent::Response { id, outcome } => self.deliver(id, outcome),
            ChannelEvent::Promise {
                parent,
                request,
                response,
            } => self.emitter.emit(&Event::Promise {
                parent,
                request: &request,
                response: &response,
            }),
            ChannelEvent::AltSvc { entry } => self.emitter.emit(&Event::AltSvc(&entry)),
            ChannelEvent::Uncoalesce { origin, requests } => {
                if self.emitter.has_subscribers(EventKind::Uncoalesce) {
                    let ids: Vec<RequestId> = requests.iter().map(|r| r.id).collect();
                    self.emitter.emit(&Event::Uncoalesce {
                        origin: &origin,
                        requests: &ids,
                    });
                }
                self.dedicate(origin, requests);
            }
            ChannelEvent::Unreachable { address } => {
                self.emitter.emit(&Event::Unreachable {
                    channel: token,
                    address,
                });
                if let Some(channel) = self.handles.channels.get_mut(&token) {
                    channel.drop_unreachable(address);
                }
            }
            ChannelEvent::Close => self.emitter.emit(&Event::Close { channel: token }),
        }
    }

    /// Resend `requests` on an HTTP/1.1 channel of their own, shared by every
    /// request later refused for `origin`.
    fn dedicate(&mut self, origin: Origin, requests: Vec<PendingRequest>) {
        if let Some(channel) = self
            .handles
            .channels
            .values_mut()
            .find(|c| c.is_usable() && c.is_dedicated() && c.origin() == &origin)
        {
            for mut request in requests {
                request.alt_used = None;
                channel.send(request);
            }
            return;
        }
        let mut channel = match self.pool.checkout_connection(&origin, &self.options) {
            Ok(channel) => channel.dedicated(),
            Err(e) => {
                let error = Arc::new(e);
                for request in requests {
                    self.deliver(request.id, Err(ErrorResponse::shared(error.clone())));
                }
                return;
            }
        };
        for mut request in requests {
            request.alt_used = None;
            channel.send(request);
        }
        if channel.addresses().is_empty() {
            self.resolve(channel);
        } else {
            self.register(channel);
        }
    }

    /// Hand closed channels back to the pool.
    fn sweep(&mut self) {
        let closed: Vec<Token> = self
            .handles
            .channels
            .iter()
            .filter(|(_, c)| c.state() == State::Closed)
            .map(|(t, _)| *t)
            .collect();
        for token in closed {
            self.selector.deregister(token);
            if let Some(channel) = self.handles.channels.remove(&token) {
                self.pool.release_connection(channel);
            }
        }
    }

    /// Gracefully close one channel, or every channel and the resolver.
    pub fn close(&mut self, channel: Option<Token>) -> Result<()> {
        let tokens: Vec<Token> = match channel {
            Some(token) => vec![token],
            None => self.handles.channels.keys().copied().collect(),
        };
        for token in tokens.iter() {
            if let Some(channel) = self.handles.channels.get_mut(token) {
                channel.close();
            }
        }
        self.process_events();
        while tokens
            .iter()
            .any(|t| self.handles.channels.contains_key(t))
        {
            self.next_tick(Some(self.options.timeouts.operation))?;
        }
        if channel.is_none() {
            if let Some(resolver) = self.handles.resolver.take() {
                self.selector.deregister(RESOLVER);
                self.pool.checkin_resolver(resolver);
            }
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for (token, channel) in self.handles.channels.drain() {
            self.selector.deregister(token);
            if channel.state() == State::Open && channel.is_reusable() {
                self.pool.checkin_connection(channel);
            } else {
                self.pool.release_connection(channel);
            }
        }
        if let Some(resolver) = self.handles.resolver.take() {
            self.pool.checkin_resolver(resolver);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Read, Write},
        net::{IpAddr, Ipv4Addr, TcpListener, TcpStream},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        thread,
    };

    use super::*;
    use crate::{
        origin::Scheme,
        resolver::ResolverOptions,
        testing::{request, MockConnector, MockHandle},
    };

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn read_head(stream: &mut TcpStream) -> Option<String> {
        let mut head = Vec::new();
        let mut byte = [0; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(1) => head.push(byte[0]),
                _ => return None,
            }
        }
        Some(String::from_utf8_lossy(&head).into_owned())
    }

    /// Serve every connection on its own thread. The handler sees each
    /// request head and returns the raw response, or `None` to hang up.
    fn serve<F>(handler: F) -> u16
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind((LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(handler);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else {
                    return;
                };
                let handler = handler.clone();
                thread::spawn(move || {
                    while let Some(head) = read_head(&mut stream) {
                        match handler(&head) {
                            Some(response) => {
                                if stream.write_all(response.as_bytes()).is_err() {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                });
            }
        });
        port
    }

    fn ok(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    fn get(url: &str) -> Request<Bytes> {
        Request::get(url).body(Bytes::new()).unwrap()
    }

    fn options() -> Options {
        let mut options = Options::default();
        options.timeouts.operation = Duration::from_secs(5);
        options.timeouts.connect = Duration::from_secs(5);
        options
    }

    /// Engine over mock sockets with `hosts` resolving to `addresses`.
    fn mock_engine(connector: &Arc<MockConnector>, hosts: &[&str], addresses: Vec<IpAddr>) -> Engine {
        let pool = Pool::new(connector.clone(), Arc::new(AltSvcCache::new()), None);
        let mut options = options();
        for host in hosts {
            options.resolver = options.resolver.with_host(host, addresses.clone());
        }
        Engine::new(options, Arc::new(pool)).unwrap()
    }

    fn h2_frame(typ: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(9 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
        frame.push(typ);
        frame.push(flags);
        frame.extend_from_slice(&stream_id.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_perform_returns_outcomes_in_submission_order() {
        let slow = serve(|_| {
            thread::sleep(Duration::from_millis(150));
            Some(ok("slow"))
        });
        let fast = serve(|_| Some(ok("fast")));
        let mut engine = Engine::with_options(options()).unwrap();

        let outcomes = engine
            .perform([
                get(&format!("http://127.0.0.1:{slow}/")),
                get(&format!("http://127.0.0.1:{fast}/")),
            ])
            .unwrap();
        let bodies: Vec<_> = outcomes
            .into_iter()
            .map(|o| o.unwrap().into_body())
            .collect();
        assert_eq!(bodies, vec![Bytes::from("slow"), Bytes::from("fast")]);
    }

    #[test]
    fn test_invalid_uri_rejected_before_sending() {
        let mut engine = Engine::with_options(options()).unwrap();
        let err = engine.perform([get("/relative")]).unwrap_err();
        assert!(matches!(err, TransportError::FromUri(_)));
        assert_eq!(engine.channel_count(), 0);
    }

    #[test]
    fn test_dropped_connection_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let port = serve(move |_| match seen.fetch_add(1, Ordering::SeqCst) {
            0 => None,
            _ => Some(ok("second")),
        });
        let mut engine = Engine::with_options(options()).unwrap();

        let outcomes = engine
            .perform([get(&format!("http://127.0.0.1:{port}/"))])
            .unwrap();
        assert_eq!(outcomes[0].as_ref().unwrap().body(), &Bytes::from("second"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_policy_can_refuse() {
        let port = serve(|_| None);
        let mut engine = Engine::with_options(options()).unwrap();
        engine.set_retry_policy(|_, _| false);

        let outcomes = engine
            .perform([get(&format!("http://127.0.0.1:{port}/"))])
            .unwrap();
        let err = outcomes[0].as_ref().unwrap_err();
        assert!(matches!(err.error(), TransportError::Eof));
    }

    #[test]
    fn test_non_idempotent_requests_are_not_retried() {
        let request = Request::post("http://example.com/")
            .body(Bytes::new())
            .unwrap();
        assert!(!default_retry_policy(&request, &TransportError::Eof));
        assert!(default_retry_policy(
            &get("http://example.com/"),
            &TransportError::Eof
        ));
        assert!(!default_retry_policy(
            &get("http://example.com/"),
            &TransportError::H1Decode("bad".into())
        ));
    }

    #[test]
    fn test_alt_svc_routes_later_requests() {
        let heads = Arc::new(Mutex::new(Vec::new()));
        let recorded = heads.clone();
        let port = Arc::new(AtomicUsize::new(0));
        let advertised = port.clone();
        let bound = serve(move |head| {
            recorded.lock().unwrap().push(head.to_ascii_lowercase());
            let port = advertised.load(Ordering::SeqCst);
            Some(format!(
                "HTTP/1.1 200 OK\r\nalt-svc: http%2F1.1=\"b.example:{port}\"\r\ncontent-length: 2\r\n\r\nok"
            ))
        });
        port.store(bound as usize, Ordering::SeqCst);

        let mut options = options();
        options.resolver = ResolverOptions::default()
            .with_host("a.example", vec![LOCALHOST])
            .with_host("b.example", vec![LOCALHOST]);
        let mut engine = Engine::with_options(options).unwrap();
        let advertisements = Arc::new(AtomicUsize::new(0));
        let counter = advertisements.clone();
        engine.on(EventKind::AltSvc, move |event| {
            if let Event::AltSvc(entry) = event {
                assert_eq!(entry.alternative.host, "b.example");
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let url = format!("http://a.example:{bound}/");
        let first = engine.perform([get(&url)]).unwrap();
        assert!(first[0].is_ok());
        assert_eq!(advertisements.load(Ordering::SeqCst), 1);

        let second = engine.perform([get(&url)]).unwrap();
        assert!(second[0].is_ok());
        let heads = heads.lock().unwrap();
        assert_eq!(heads.len(), 2);
        assert!(!heads[0].contains("alt-used"));
        assert!(heads[1].contains(&format!("alt-used: b.example:{bound}")));
        assert!(heads[1].contains(&format!("host: a.example:{bound}")));
    }

    #[test]
    fn test_request_timeout_fails_attempt() {
        let port = serve(|_| {
            thread::sleep(Duration::from_millis(500));
            None
        });
        let mut options = options();
        options.timeouts.request = Some(Duration::from_millis(100));
        options.max_retries = 0;
        let mut engine = Engine::with_options(options).unwrap();

        let outcomes = engine
            .perform([get(&format!("http://127.0.0.1:{port}/"))])
            .unwrap();
        let err = outcomes[0].as_ref().unwrap_err();
        assert!(matches!(err.error(), TransportError::RequestTimeout(_)));
    }

    #[test]
    fn test_response_event_fires_once_per_request() {
        let port = serve(|_| Some(ok("hi")));
        let mut engine = Engine::with_options(options()).unwrap();
        let finished = Arc::new(Mutex::new(Vec::new()));
        let sink = finished.clone();
        engine.on(EventKind::Response, move |event| {
            if let Event::Response { id, .. } = event {
                sink.lock().unwrap().push(*id);
            }
        });

        let url = format!("http://127.0.0.1:{port}/");
        let outcomes = engine.perform([get(&url), get(&url)]).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(finished.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_h2_channel_coalesces_verified_origin() {
        let connector = Arc::new(MockConnector::default());
        let socket = MockHandle::default();
        socket.with(|s| {
            s.protocol = Some("h2");
            s.verified_hosts = vec!["b.example".to_string()];
        });
        connector.push(socket);
        let pool = Pool::new(connector.clone(), Arc::new(AltSvcCache::new()), None);

        let mut options = options();
        options.resolver = ResolverOptions::default()
            .with_host("a.example", vec![LOCALHOST])
            .with_host("b.example", vec![LOCALHOST]);
        let mut engine = Engine::new(options, Arc::new(pool)).unwrap();

        engine.send(get("https://a.example/")).unwrap();
        engine.next_tick(Some(Duration::from_millis(10))).unwrap();
        engine.send(get("https://b.example/")).unwrap();

        assert_eq!(engine.channel_count(), 1);
        let channel = engine.handles.channels.values().next().unwrap();
        assert_eq!(channel.state(), State::Open);
        let b = "https://b.example/".parse::<http::Uri>().unwrap();
        assert!(channel.matches(&Origin::try_from(&b).unwrap()));
        assert_eq!(connector.built(), 1);
    }

    #[test]
    fn test_route_skips_alternatives_with_other_scheme() {
        let connector = Arc::new(MockConnector::default());
        let engine = mock_engine(&connector, &[], Vec::new());
        let a = Origin::new(Scheme::Http, "a.example", 80);

        engine.altsvc().parse_and_store(&a, r#"h2=":8443""#);
        assert_eq!(engine.altsvc().lookup(&a)[0].alternative.scheme, Scheme::Https);
        assert_eq!(engine.route(&a), a);

        engine.altsvc().parse_and_store(&a, r#"http%2F1.1=":8080""#);
        assert_eq!(engine.route(&a), Origin::new(Scheme::Http, "a.example", 8080));
    }

    #[test]
    fn test_alternative_channel_keeps_server_name() {
        let connector = Arc::new(MockConnector::default());
        let mut engine = mock_engine(&connector, &["b.example"], vec![LOCALHOST]);
        let a = Origin::new(Scheme::Https, "a.example", 443);
        engine.altsvc().parse_and_store(&a, r#"h2="b.example:8443""#);

        engine.send(get("https://a.example/")).unwrap();
        engine.send(get("https://b.example:8443/")).unwrap();
        engine.next_tick(Some(Duration::from_millis(10))).unwrap();

        assert_eq!(engine.channel_count(), 2);
        let targets = connector.targets.lock().unwrap();
        let names: Vec<_> = targets
            .iter()
            .map(|t| (t.origin.host.as_str(), t.server_name.as_str()))
            .collect();
        assert!(names.contains(&("b.example", "a.example")), "{names:?}");
        assert!(names.contains(&("b.example", "b.example")), "{names:?}");
    }

    #[test]
    fn test_misdirected_origin_moves_to_dedicated_channel() {
        let connector = Arc::new(MockConnector::default());
        let socket = MockHandle::default();
        socket.with(|s| {
            s.protocol = Some("h2");
            s.verified_hosts = vec!["b.example".to_string()];
        });
        connector.push(socket.clone());
        let mut engine = mock_engine(&connector, &["a.example", "b.example"], vec![LOCALHOST]);
        let uncoalesced = Arc::new(Mutex::new(Vec::new()));
        let sink = uncoalesced.clone();
        engine.on(EventKind::Uncoalesce, move |event| {
            if let Event::Uncoalesce { origin, requests } = event {
                sink.lock().unwrap().push((origin.host.clone(), requests.to_vec()));
            }
        });

        engine.send(get("https://a.example/")).unwrap();
        engine.next_tick(Some(Duration::from_millis(10))).unwrap();
        let b_id = engine.send(get("https://b.example/")).unwrap();
        assert_eq!(engine.channel_count(), 1);
        let shared = *engine.handles.channels.keys().next().unwrap();

        // stream 1 carries a, stream 3 carries b
        let mut encoder = hpack::Encoder::new();
        let block = encoder.encode(vec![(&b":status"[..], &b"421"[..])]);
        socket.push_inbound(&h2_frame(0x4, 0, 0, &[]));
        socket.push_inbound(&h2_frame(0x1, 0x1 | 0x4, 3, &block));
        engine.handles.channels.get_mut(&shared).unwrap().call();
        engine.process_events();

        assert_eq!(
            *uncoalesced.lock().unwrap(),
            vec![(SmolStr::new("b.example"), vec![b_id])]
        );
        let b = Origin::new(Scheme::Https, "b.example", 443);
        assert!(!engine.channel(shared).unwrap().matches(&b));
        assert_eq!(engine.channel_count(), 2);
        let dedicated = engine
            .handles
            .channels
            .values()
            .find(|c| c.id() != shared)
            .unwrap();
        assert!(dedicated.is_dedicated());
        assert!(dedicated.matches(&b));
        assert_eq!(dedicated.pending_ids(), vec![b_id]);

        engine.next_tick(Some(Duration::from_millis(10))).unwrap();
        let targets = connector.targets.lock().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].origin, b);
        assert_eq!(targets[1].alpn, Some(vec!["http/1.1".to_string()]));
    }

    #[test]
    fn test_dedicated_channel_is_shared_per_origin() {
        let connector = Arc::new(MockConnector::default());
        let mut engine = mock_engine(&connector, &["b.example"], vec![LOCALHOST]);
        let b = Origin::new(Scheme::Https, "b.example", 443);

        engine.dedicate(b.clone(), vec![request(1, "https://b.example/1")]);
        engine.dedicate(b.clone(), vec![request(2, "https://b.example/2")]);

        assert_eq!(engine.channel_count(), 1);
        let channel = engine.handles.channels.values().next().unwrap();
        assert!(channel.is_dedicated());
        assert_eq!(channel.pending_ids(), vec![RequestId(1), RequestId(2)]);
        assert_eq!(engine.pool().connection_count(&b), 1);
    }

    #[test]
    fn test_unreachable_family_is_dropped_and_next_address_dialled() {
        let connector = Arc::new(MockConnector::default());
        let v6 = IpAddr::from([0, 0, 0, 0, 0, 0, 0, 1]);
        let first = MockHandle::default();
        first.with(|s| {
            s.connect
                .push_back(Err(io::Error::from_raw_os_error(nix::libc::ENETUNREACH)));
            s.failed = Some(v6);
        });
        connector.push(first.clone());
        let mut engine = mock_engine(&connector, &["a.example"], vec![v6, LOCALHOST]);
        let unreachable = Arc::new(Mutex::new(Vec::new()));
        let sink = unreachable.clone();
        engine.on(EventKind::Unreachable, move |event| {
            if let Event::Unreachable { address, .. } = event {
                sink.lock().unwrap().push(*address);
            }
        });

        let id = engine.send(get("http://a.example/")).unwrap();
        engine.next_tick(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(*unreachable.lock().unwrap(), vec![v6]);
        assert!(first.with(|s| s.closed));
        let channel = engine.handles.channels.values().next().unwrap();
        assert_eq!(channel.addresses(), &[LOCALHOST]);
        assert_eq!(channel.state(), State::Idle);

        engine.next_tick(Some(Duration::from_millis(10))).unwrap();
        let channel = engine.handles.channels.values().next().unwrap();
        assert_eq!(channel.state(), State::Open);
        assert!(engine.response(id).is_none());
        let targets = connector.targets.lock().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].addresses, vec![v6, LOCALHOST]);
        assert_eq!(targets[1].addresses, vec![LOCALHOST]);
    }

    #[test]
    fn test_resolve_failure_fails_request() {
        let connector = Arc::new(MockConnector::default());
        let pool = Pool::new(connector.clone(), Arc::new(AltSvcCache::new()), None);
        let mut engine = Engine::new(options(), Arc::new(pool)).unwrap();

        let id = engine.send(get("http://does-not-exist.invalid/")).unwrap();
        let mut outcome = None;
        for _ in 0..100 {
            engine.next_tick(Some(Duration::from_millis(100))).unwrap();
            outcome = engine.response(id);
            if outcome.is_some() {
                break;
            }
        }
        let err = outcome.unwrap().unwrap_err();
        assert!(matches!(err.error(), TransportError::Resolve(_)));
        assert_eq!(engine.channel_count(), 0);
        assert_eq!(connector.built(), 0);
    }

    #[test]
    fn test_close_all_drains_channels() {
        let port = serve(|_| Some(ok("x")));
        let mut engine = Engine::with_options(options()).unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        engine.on(EventKind::Close, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        engine
            .perform([get(&format!("http://127.0.0.1:{port}/"))])
            .unwrap();
        assert_eq!(engine.channel_count(), 1);
        engine.close(None).unwrap();
        assert_eq!(engine.channel_count(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
