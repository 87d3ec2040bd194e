//! Timer buckets keyed by requested duration, plus a cumulative deadline.
use std::time::{Duration, Instant};

use crate::{Result, TransportError};

/// Payloads registered with the same duration at the same moment share a
/// bucket and fire together.
#[derive(Debug)]
pub struct TimerBucket<T> {
    duration: Duration,
    remaining: Duration,
    payloads: Vec<T>,
}

impl<T> TimerBucket<T> {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            remaining: duration,
            payloads: Vec::new(),
        }
    }

    #[inline]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    #[inline]
    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    #[inline]
    fn is_fresh(&self) -> bool {
        self.remaining == self.duration
    }

    /// Subtract `elapsed`; when the bucket runs out every payload is handed to
    /// `f` and the bucket is emptied. Returns whether it expired.
    pub fn elapse<F: FnMut(T)>(&mut self, elapsed: Duration, f: &mut F) -> bool {
        self.remaining = self.remaining.saturating_sub(elapsed);
        if !self.remaining.is_zero() {
            return false;
        }
        for payload in self.payloads.drain(..) {
            f(payload);
        }
        true
    }
}

/// Set of buckets ordered by remaining time.
#[derive(Debug)]
pub struct Timers<T> {
    buckets: Vec<TimerBucket<T>>,
}

impl<T> Default for Timers<T> {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
        }
    }
}

impl<T> Timers<T> {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after(&mut self, duration: Duration, payload: T) {
        if let Some(bucket) = self
            .buckets
            .iter_mut()
            .find(|b| b.duration == duration && b.is_fresh())
        {
            bucket.payloads.push(payload);
            return;
        }
        let mut bucket = TimerBucket::new(duration);
        bucket.payloads.push(payload);
        let pos = self
            .buckets
            .partition_point(|b| b.remaining <= bucket.remaining);
        self.buckets.insert(pos, bucket);
    }

    /// Time until the nearest bucket fires.
    #[inline]
    pub fn wait_interval(&self) -> Option<Duration> {
        self.buckets.first().map(|b| b.remaining)
    }

    pub fn fire<F: FnMut(T)>(&mut self, elapsed: Duration, mut f: F) {
        self.buckets
            .retain_mut(|bucket| !bucket.elapse(elapsed, &mut f) && !bucket.is_empty());
    }

    /// Drop payloads for which `keep` returns false.
    pub fn retain<F: FnMut(&T) -> bool>(&mut self, mut keep: F) {
        for bucket in self.buckets.iter_mut() {
            bucket.payloads.retain(&mut keep);
        }
        self.buckets.retain(|b| !b.is_empty());
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(TimerBucket::len).sum()
    }
}

/// Wall-clock budget spanning several operations; it does not reset on
/// progress, only on an explicit `reset`.
#[derive(Debug, Clone, Copy)]
pub struct TotalTimer {
    budget: Duration,
    started: Instant,
}

impl TotalTimer {
    #[inline]
    pub fn new(budget: Duration) -> Self {
        Self::started_at(budget, Instant::now())
    }

    #[inline]
    pub fn started_at(budget: Duration, started: Instant) -> Self {
        Self { budget, started }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.started = Instant::now();
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[inline]
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.budget
            .saturating_sub(now.saturating_duration_since(self.started))
    }

    pub fn check_at(&self, now: Instant) -> Result<()> {
        if now.saturating_duration_since(self.started) >= self.budget {
            return Err(TransportError::TotalTimeout(self.budget));
        }
        Ok(())
    }

    #[inline]
    pub fn check(&self) -> Result<()> {
        self.check_at(Instant::now())
    }
}
