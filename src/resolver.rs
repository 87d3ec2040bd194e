//! Host name resolution behind the same readiness shape as a channel.
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fs::File,
    io::{self, Read, Write},
    net::{IpAddr, ToSocketAddrs},
    os::fd::{AsRawFd, RawFd},
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    thread,
};

use nix::{fcntl::OFlag, unistd::pipe2};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
    selector::{Interest, Selectable},
    Result, TransportError,
};

/// Resolver configuration; the pool hands out resolvers whose options are
/// equal to the requested ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverOptions {
    /// Static overrides consulted before the system resolver.
    pub hosts: BTreeMap<String, Vec<IpAddr>>,
    pub cache: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            hosts: BTreeMap::new(),
            cache: true,
        }
    }
}

impl ResolverOptions {
    pub fn with_host(mut self, host: &str, addresses: Vec<IpAddr>) -> Self {
        self.hosts.insert(host.to_ascii_lowercase(), addresses);
        self
    }
}

pub type Answer = (SmolStr, Result<Vec<IpAddr>>);

/// Asynchronous host to address lookup.
///
/// `resolve` starts a lookup; answers are collected with `answer` once the
/// resolver has made progress, which for descriptor-backed resolvers means
/// after the selector reported readiness and `call` ran.
pub trait Resolver: Send {
    fn options(&self) -> &ResolverOptions;
    fn resolve(&mut self, host: &str);
    fn answer(&mut self) -> Option<Answer>;
    fn interests(&mut self) -> Option<Interest> {
        None
    }
    fn raw_fd(&mut self) -> Option<RawFd> {
        None
    }
    fn call(&mut self) {}
    fn close(&mut self) {}
    /// No lookups outstanding.
    fn is_empty(&self) -> bool;
}

impl Selectable for Box<dyn Resolver> {
    #[inline]
    fn interests(&mut self) -> Option<Interest> {
        Resolver::interests(self.as_mut())
    }

    #[inline]
    fn raw_fd(&mut self) -> Option<RawFd> {
        Resolver::raw_fd(self.as_mut())
    }
}

/// `getaddrinfo` on a helper thread. Each finished lookup writes a byte to
/// the pipe behind `wake`, so the selector can wait on it like a socket.
#[derive(Debug)]
struct Worker {
    hosts: Sender<SmolStr>,
    answers: Receiver<(SmolStr, Option<Vec<IpAddr>>)>,
    wake: File,
}

impl Worker {
    fn spawn() -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        let (hosts, queue) = mpsc::channel::<SmolStr>();
        let (done, answers) = mpsc::channel();
        let mut signal = File::from(write);
        thread::Builder::new()
            .name("tick-resolver".into())
            .spawn(move || {
                for host in queue {
                    let addresses = getaddrinfo(&host);
                    if done.send((host, addresses)).is_err() {
                        return;
                    }
                    // a full pipe already carries a wakeup
                    let _ = signal.write(&[1]);
                }
            })?;
        Ok(Self {
            hosts,
            answers,
            wake: File::from(read),
        })
    }

    fn drain_wakeups(&mut self) {
        let mut buf = [0; 64];
        while matches!(self.wake.read(&mut buf), Ok(n) if n > 0) {}
    }
}

fn getaddrinfo(host: &str) -> Option<Vec<IpAddr>> {
    let mut addresses: Vec<IpAddr> = Vec::new();
    for addr in (host, 0).to_socket_addrs().ok()? {
        if !addresses.contains(&addr.ip()) {
            addresses.push(addr.ip());
        }
    }
    (!addresses.is_empty()).then_some(addresses)
}

/// Static hosts, IP literals and cached names are answered inside
/// `resolve`. Everything else goes to `getaddrinfo` on a helper thread and
/// is answered after the descriptor turns readable and `call` ran.
#[derive(Debug, Default)]
pub struct SystemResolver {
    options: ResolverOptions,
    cache: HashMap<SmolStr, Vec<IpAddr>>,
    answers: VecDeque<Answer>,
    worker: Option<Worker>,
    in_flight: Vec<SmolStr>,
}

impl SystemResolver {
    pub fn new(options: ResolverOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    /// Answer from static hosts, literals or the cache.
    fn lookup_local(&self, host: &str) -> Option<Vec<IpAddr>> {
        if let Some(addresses) = self.options.hosts.get(host) {
            return Some(addresses.clone());
        }
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Some(vec![ip]);
        }
        self.cache.get(host).cloned()
    }

    fn worker(&mut self) -> io::Result<&mut Worker> {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => Worker::spawn()?,
        };
        Ok(self.worker.insert(worker))
    }

    fn on_lookup(&mut self, host: SmolStr, addresses: Option<Vec<IpAddr>>) {
        if let Some(pos) = self.in_flight.iter().position(|h| *h == host) {
            self.in_flight.swap_remove(pos);
        }
        let answer = match addresses {
            Some(addresses) => {
                #[cfg(feature = "logging")]
                tracing::debug!("resolved {host} to {addresses:?}");
                if self.options.cache {
                    let key = SmolStr::new(host.to_ascii_lowercase());
                    self.cache.insert(key, addresses.clone());
                }
                Ok(addresses)
            }
            None => {
                #[cfg(feature = "logging")]
                tracing::info!("failed to resolve {host}");
                Err(TransportError::Resolve(host.clone()))
            }
        };
        self.answers.push_back((host, answer));
    }
}

impl Resolver for SystemResolver {
    #[inline]
    fn options(&self) -> &ResolverOptions {
        &self.options
    }

    fn resolve(&mut self, host: &str) {
        let host = SmolStr::new(host);
        if let Some(addresses) = self.lookup_local(&host.to_ascii_lowercase()) {
            return self.answers.push_back((host, Ok(addresses)));
        }
        let sent = self.worker().and_then(|w| {
            w.hosts
                .send(host.clone())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "resolver thread exited"))
        });
        match sent {
            Ok(()) => self.in_flight.push(host),
            Err(e) => {
                #[cfg(feature = "logging")]
                tracing::error!("resolver unavailable: {e}");
                self.worker = None;
                self.answers.push_back((host, Err(TransportError::Io(e))));
            }
        }
    }

    #[inline]
    fn answer(&mut self) -> Option<Answer> {
        self.answers.pop_front()
    }

    fn interests(&mut self) -> Option<Interest> {
        (!self.in_flight.is_empty()).then_some(Interest::Readable)
    }

    fn raw_fd(&mut self) -> Option<RawFd> {
        self.worker.as_ref().map(|w| w.wake.as_raw_fd())
    }

    fn call(&mut self) {
        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        worker.drain_wakeups();
        let mut finished = Vec::new();
        let exited = loop {
            match worker.answers.try_recv() {
                Ok(done) => finished.push(done),
                Err(TryRecvError::Empty) => break false,
                Err(TryRecvError::Disconnected) => break true,
            }
        };
        for (host, addresses) in finished {
            self.on_lookup(host, addresses);
        }
        if exited {
            #[cfg(feature = "logging")]
            tracing::error!("resolver thread exited with {} lookups", self.in_flight.len());
            self.worker = None;
            for host in self.in_flight.drain(..) {
                self.answers.push_back((host.clone(), Err(TransportError::Resolve(host))));
            }
        }
    }

    /// Stop the helper thread. Lookups still running are abandoned.
    fn close(&mut self) {
        self.worker = None;
        self.in_flight.clear();
        self.answers.clear();
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.in_flight.is_empty() && self.answers.is_empty()
    }
}
