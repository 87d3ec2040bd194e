//! Readiness multiplexer over `poll(2)`.
//!
//! The selector never owns the handles it waits on: it keeps tokens, and
//! asks a [`Sources`] table for the interests and descriptor behind each
//! token on every pass.
use std::{
    os::fd::{BorrowedFd, RawFd},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};

use crate::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// Reserved for the engine's resolver; channels start at 1.
pub const RESOLVER: Token = Token(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    Both,
}

impl Interest {
    #[inline]
    pub fn is_readable(self) -> bool {
        matches!(self, Interest::Readable | Interest::Both)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, Interest::Writable | Interest::Both)
    }

    /// Combine two optional interests.
    pub fn merge(a: Option<Interest>, b: Option<Interest>) -> Option<Interest> {
        match (a, b) {
            (None, x) | (x, None) => x,
            (Some(a), Some(b)) => {
                let r = a.is_readable() || b.is_readable();
                let w = a.is_writable() || b.is_writable();
                Interest::from_flags(r, w)
            }
        }
    }

    #[inline]
    pub fn from_flags(readable: bool, writable: bool) -> Option<Interest> {
        match (readable, writable) {
            (true, true) => Some(Interest::Both),
            (true, false) => Some(Interest::Readable),
            (false, true) => Some(Interest::Writable),
            (false, false) => None,
        }
    }

    fn poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.is_readable() {
            flags |= PollFlags::POLLIN;
        }
        if self.is_writable() {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// Something the selector can wait on.
pub trait Selectable {
    /// `None` means nothing to wait for this pass.
    fn interests(&mut self) -> Option<Interest>;
    /// May trigger a lazy connect; `None` when there is no descriptor yet.
    fn raw_fd(&mut self) -> Option<RawFd>;
}

/// Token to handle lookup.
pub trait Sources {
    fn source(&mut self, token: Token) -> Option<&mut dyn Selectable>;
}

/// Readiness of one handle for one `select` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Monitor {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, Default)]
pub struct Selector {
    registered: Vec<Token>,
    pruned: Vec<Token>,
}

struct Armed {
    token: Token,
    fd: RawFd,
    interest: Interest,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, token: Token) {
        if !self.registered.contains(&token) {
            self.registered.push(token);
        }
    }

    pub fn deregister(&mut self, token: Token) -> bool {
        let before = self.registered.len();
        self.registered.retain(|t| *t != token);
        before != self.registered.len()
    }

    #[inline]
    pub fn is_registered(&self, token: Token) -> bool {
        self.registered.contains(&token)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Tokens dropped because their descriptor was closed or their source
    /// disappeared.
    pub fn take_pruned(&mut self) -> Vec<Token> {
        std::mem::take(&mut self.pruned)
    }

    /// Wait up to `timeout` (forever when `None`) and call `on_ready` once
    /// for every ready handle.
    ///
    /// Returns `SelectTimeout` when nothing became ready in time. With
    /// nothing to wait on and no timeout it returns immediately.
    pub fn select<S, F>(
        &mut self,
        sources: &mut S,
        timeout: Option<Duration>,
        mut on_ready: F,
    ) -> Result<()>
    where
        S: Sources + ?Sized,
        F: FnMut(&mut S, Monitor),
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let armed = self.arm(sources);
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));

            if armed.is_empty() {
                return match (timeout, remaining) {
                    (Some(t), Some(left)) => {
                        std::thread::sleep(left);
                        Err(TransportError::SelectTimeout(t))
                    }
                    _ => Ok(()),
                };
            }

            let polled = if armed.len() == 1 {
                wait_one(&armed[0], remaining)
            } else {
                wait_many(&armed, remaining)
            };
            let ready = match polled {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(TransportError::Io(e.into())),
            };

            let mut fired = false;
            let mut invalid = false;
            for (armed, revents) in armed.iter().zip(ready) {
                let Some(revents) = revents else {
                    continue;
                };
                if revents.contains(PollFlags::POLLNVAL) {
                    #[cfg(feature = "logging")]
                    tracing::debug!("pruning closed handle {:?}", armed.token);
                    self.prune(armed.token);
                    invalid = true;
                    continue;
                }
                let failed = revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP);
                let monitor = Monitor {
                    token: armed.token,
                    readable: armed.interest.is_readable()
                        && (failed || revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI)),
                    writable: armed.interest.is_writable()
                        && (failed || revents.contains(PollFlags::POLLOUT)),
                };
                if monitor.readable || monitor.writable {
                    fired = true;
                    on_ready(sources, monitor);
                }
            }

            if fired {
                return Ok(());
            }
            if !invalid || remaining.is_some_and(|r| r.is_zero()) {
                return Err(TransportError::SelectTimeout(timeout.unwrap_or_default()));
            }
        }
    }

    fn arm<S: Sources + ?Sized>(&mut self, sources: &mut S) -> Vec<Armed> {
        let mut armed = Vec::with_capacity(self.registered.len());
        let mut gone = Vec::new();
        for token in self.registered.iter().copied() {
            let Some(source) = sources.source(token) else {
                gone.push(token);
                continue;
            };
            let Some(interest) = source.interests() else {
                continue;
            };
            if let Some(fd) = source.raw_fd() {
                armed.push(Armed {
                    token,
                    fd,
                    interest,
                });
            }
        }
        for token in gone {
            self.prune(token);
        }
        armed
    }

    fn prune(&mut self, token: Token) {
        if self.deregister(token) {
            self.pruned.push(token);
        }
    }
}

fn poll_timeout(remaining: Option<Duration>) -> PollTimeout {
    match remaining {
        None => PollTimeout::NONE,
        Some(d) => {
            // round up so a sub-millisecond wait does not spin
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            let ms = ms.min(i32::MAX as u128) as i32;
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
        }
    }
}

fn wait_one(armed: &Armed, remaining: Option<Duration>) -> nix::Result<Vec<Option<PollFlags>>> {
    // SAFETY: the descriptor belongs to a source that outlives this call and
    // nothing else runs until poll returns.
    let fd = unsafe { BorrowedFd::borrow_raw(armed.fd) };
    let mut fds = [PollFd::new(fd, armed.interest.poll_flags())];
    let n = poll(&mut fds, poll_timeout(remaining))?;
    if n == 0 {
        return Ok(vec![None]);
    }
    Ok(vec![fds[0].revents()])
}

fn wait_many(armed: &[Armed], remaining: Option<Duration>) -> nix::Result<Vec<Option<PollFlags>>> {
    let mut fds: Vec<PollFd<'_>> = armed
        .iter()
        .map(|a| {
            // SAFETY: see `wait_one`.
            let fd = unsafe { BorrowedFd::borrow_raw(a.fd) };
            PollFd::new(fd, a.interest.poll_flags())
        })
        .collect();
    let n = poll(&mut fds, poll_timeout(remaining))?;
    if n == 0 {
        return Ok(vec![None; armed.len()]);
    }
    Ok(fds.iter().map(|fd| fd.revents()).collect())
}
