//! Thread-safe channel pool with per-origin admission control.
//!
//! Every origin has a counter of live channels, checked out or idle. A
//! checkout beyond `max_connections_per_origin` parks the calling thread on
//! the origin's condition variable until a channel comes back or is
//! discarded, or `timeouts.pool` runs out.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use crate::{
    altsvc::AltSvcCache,
    channel::Channel,
    connectors::{SocketFactory, UnifiedConnector},
    options::{DEFAULT_MAX_IDLE, MAX_IDLE_CONNS},
    resolver::{Resolver, ResolverOptions, SystemResolver},
    selector::Token,
    Options, Origin, RequestId, Result, TransportError,
};

pub(crate) struct Idle<T> {
    pub(crate) conn: T,
    idle_at: Instant,
}

impl<T> Idle<T> {
    #[inline]
    pub(crate) fn new(conn: T) -> Self {
        Self {
            conn,
            idle_at: Instant::now(),
        }
    }

    #[inline]
    pub(crate) fn expired(&self, max_elapsed: Duration) -> bool {
        self.idle_at.elapsed() > max_elapsed
    }
}

#[derive(Default)]
struct PoolInner {
    idle: VecDeque<Idle<Channel>>,
    counts: HashMap<Origin, usize>,
    waiters: HashMap<Origin, Arc<Condvar>>,
}

impl PoolInner {
    /// Close `channel` and free its origin's slot.
    fn discard(&mut self, mut channel: Channel) {
        channel.close();
        let origin = channel.origin().clone();
        #[cfg(feature = "logging")]
        tracing::debug!("pool discarded channel {:?} for {origin}", channel.id());
        let Some(count) = self.counts.get_mut(&origin) else {
            return self.notify(&origin);
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return self.notify(&origin);
        }
        self.counts.remove(&origin);
        // parked checkouts re-register when they wake
        if let Some(waiter) = self.waiters.remove(&origin) {
            waiter.notify_all();
        }
    }

    fn notify(&self, origin: &Origin) {
        if let Some(waiter) = self.waiters.get(origin) {
            waiter.notify_one();
        }
    }

    fn clear_expired(&mut self) {
        let (expired, live): (VecDeque<_>, VecDeque<_>) = self
            .idle
            .drain(..)
            .partition(|i| i.expired(i.conn.options().timeouts.keep_alive));
        self.idle = live;
        for idle in expired {
            self.discard(idle.conn);
        }
    }
}

pub struct Pool {
    factory: Arc<dyn SocketFactory>,
    altsvc: Arc<AltSvcCache>,
    max_idle: usize,
    inner: Mutex<PoolInner>,
    resolvers: Mutex<Vec<Box<dyn Resolver>>>,
    next_channel: AtomicUsize,
    next_request: AtomicU64,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("max_idle", &self.max_idle)
            .field("idle", &self.idle_connection_count())
            .finish()
    }
}

impl Pool {
    pub fn new(
        factory: Arc<dyn SocketFactory>,
        altsvc: Arc<AltSvcCache>,
        max_idle: Option<usize>,
    ) -> Self {
        let max_idle = max_idle
            .map(|n| n.min(MAX_IDLE_CONNS))
            .unwrap_or(DEFAULT_MAX_IDLE);
        Self {
            factory,
            altsvc,
            max_idle,
            inner: Mutex::new(PoolInner::default()),
            resolvers: Mutex::new(Vec::new()),
            // token 0 belongs to the resolver
            next_channel: AtomicUsize::new(1),
            next_request: AtomicU64::new(1),
        }
    }

    /// Pool dialling through TCP and rustls, configured from `options`.
    pub fn from_options(options: &Options, altsvc: Arc<AltSvcCache>) -> Self {
        let connector = UnifiedConnector::from_options(options);
        Self::new(Arc::new(connector), altsvc, Some(options.max_idle))
    }

    #[inline]
    pub fn altsvc(&self) -> &Arc<AltSvcCache> {
        &self.altsvc
    }

    #[inline]
    pub fn next_token(&self) -> Token {
        Token(self.next_channel.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An idle channel for `origin` built with equal options, else a new one
    /// if the origin is below its cap. At the cap, wait for a slot.
    pub fn checkout_connection(&self, origin: &Origin, options: &Arc<Options>) -> Result<Channel> {
        self.checkout_connection_for(origin, &origin.host, options)
    }

    /// Like `checkout_connection`, for a channel that authenticates its peer
    /// as `server_name`. Differs from the origin's host when `origin` is an
    /// alternative service.
    pub fn checkout_connection_for(
        &self,
        origin: &Origin,
        server_name: &str,
        options: &Arc<Options>,
    ) -> Result<Channel> {
        let deadline = Instant::now() + options.timeouts.pool;
        let mut inner = self.lock();
        loop {
            inner.clear_expired();
            let reusable = inner
                .idle
                .iter()
                .position(|i| {
                    i.conn.origin() == origin
                        && i.conn.server_name() == server_name
                        && i.conn.options() == options
                });
            if let Some(channel) = reusable.and_then(|pos| inner.idle.remove(pos)) {
                #[cfg(feature = "logging")]
                tracing::debug!("pool reused channel {:?} for {origin}", channel.conn.id());
                return Ok(channel.conn);
            }

            let count = inner.counts.entry(origin.clone()).or_default();
            if *count < options.max_connections_per_origin {
                *count += 1;
                let channel = Channel::new(
                    self.next_token(),
                    origin.clone(),
                    options.clone(),
                    self.factory.clone(),
                    self.altsvc.clone(),
                )
                .with_server_name(server_name);
                #[cfg(feature = "logging")]
                tracing::debug!("pool built channel {:?} for {origin}", channel.id());
                return Ok(channel);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                #[cfg(feature = "logging")]
                tracing::info!("pool checkout for {origin} timed out");
                return Err(TransportError::PoolTimeout(options.timeouts.pool));
            }
            let waiter = inner.waiters.entry(origin.clone()).or_default().clone();
            inner = waiter
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Park `channel` as idle. It keeps its slot; only a discard frees it.
    pub fn checkin_connection(&self, channel: Channel) {
        let mut inner = self.lock();
        if !channel.is_reusable() || self.max_idle == 0 {
            return inner.discard(channel);
        }
        inner.clear_expired();
        while inner.idle.len() >= self.max_idle {
            match inner.idle.pop_front() {
                Some(oldest) => inner.discard(oldest.conn),
                None => break,
            }
        }
        let origin = channel.origin().clone();
        inner.idle.push_back(Idle::new(channel));
        inner.notify(&origin);
    }

    /// Close `channel` and give its slot back.
    pub fn release_connection(&self, channel: Channel) {
        self.lock().discard(channel);
    }

    /// Remove and return an idle channel that `channel` could share a socket
    /// with.
    pub fn checkout_mergeable_connection(&self, channel: &Channel) -> Option<Channel> {
        let mut inner = self.lock();
        inner.clear_expired();
        let pos = inner
            .idle
            .iter()
            .position(|i| i.conn.is_mergeable(channel))?;
        inner.idle.remove(pos).map(|i| i.conn)
    }

    pub fn checkout_resolver(&self, options: &ResolverOptions) -> Box<dyn Resolver> {
        let mut resolvers = self.resolvers.lock().unwrap_or_else(PoisonError::into_inner);
        match resolvers.iter().position(|r| r.options() == options) {
            Some(pos) => resolvers.swap_remove(pos),
            None => Box::new(SystemResolver::new(options.clone())),
        }
    }

    /// Park `resolver` for reuse. Lookups it still runs are abandoned.
    pub fn checkin_resolver(&self, mut resolver: Box<dyn Resolver>) {
        if !resolver.is_empty() {
            resolver.close();
        }
        self.resolvers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resolver);
    }

    pub fn idle_connection_count(&self) -> usize {
        self.lock().idle.len()
    }

    /// Live channels for `origin`, checked out or idle.
    pub fn connection_count(&self, origin: &Origin) -> usize {
        self.lock().counts.get(origin).copied().unwrap_or(0)
    }
}
