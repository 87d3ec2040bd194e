//! Tunables consumed by channels, the engine and the pool.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{resolver::ResolverOptions, Result, TransportError};

pub(crate) const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
pub(crate) const DEFAULT_MAX_CONNECTIONS_PER_ORIGIN: usize = 8;
pub(crate) const DEFAULT_MAX_IDLE: usize = 32;
// https://datatracker.ietf.org/doc/html/rfc6335
pub(crate) const MAX_IDLE_CONNS: usize = 16384;

/// Per-phase timeouts. Durations are written as `{"secs": .., "nanos": ..}`
/// in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub connect: Duration,
    /// Fallback for read and write when those are unset.
    pub operation: Duration,
    /// How long an open channel may sit without work before it is closed.
    pub keep_alive: Duration,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
    /// Single attempt of a request, from submission to response.
    pub request: Option<Duration>,
    /// Whole request lifetime including retries.
    pub total: Option<Duration>,
    /// Waiting for a pool slot.
    pub pool: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(60),
            operation: Duration::from_secs(60),
            keep_alive: Duration::from_secs(20),
            read: None,
            write: None,
            request: None,
            total: None,
            pool: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    #[inline]
    pub fn read_timeout(&self) -> Duration {
        self.read.unwrap_or(self.operation)
    }

    #[inline]
    pub fn write_timeout(&self) -> Duration {
        self.write.unwrap_or(self.operation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub timeouts: Timeouts,
    /// Bytes read from a socket per tick.
    pub window_size: usize,
    /// Capacity of each channel buffer.
    pub buffer_size: usize,
    pub max_connections_per_origin: usize,
    pub max_idle: usize,
    pub max_retries: usize,
    /// HTTP/1.1 requests in flight per connection.
    pub max_pipelined: usize,
    /// HTTP/1.1 requests before the connection is recycled.
    pub max_requests_per_connection: usize,
    /// Offer `h2` through ALPN.
    pub http2: bool,
    /// Speak HTTP/2 on cleartext connections without negotiation.
    pub http2_prior_knowledge: bool,
    pub push_promise: bool,
    pub max_concurrent_streams: u32,
    pub resolver: ResolverOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            window_size: DEFAULT_BUFFER_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_connections_per_origin: DEFAULT_MAX_CONNECTIONS_PER_ORIGIN,
            max_idle: DEFAULT_MAX_IDLE,
            max_retries: 3,
            max_pipelined: 1,
            max_requests_per_connection: 200,
            http2: true,
            http2_prior_knowledge: false,
            push_promise: false,
            max_concurrent_streams: 100,
            resolver: ResolverOptions::default(),
        }
    }
}

impl Options {
    /// Load from JSON; missing fields take their defaults.
    pub fn from_json(s: &str) -> Result<Self> {
        let options: Options = serde_json::from_str(s)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("window_size", self.window_size),
            ("buffer_size", self.buffer_size),
            ("max_connections_per_origin", self.max_connections_per_origin),
            ("max_pipelined", self.max_pipelined),
            ("max_requests_per_connection", self.max_requests_per_connection),
            ("max_concurrent_streams", self.max_concurrent_streams as usize),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(TransportError::Validation(format!("{name} must be positive")));
            }
        }
        if self.max_idle > MAX_IDLE_CONNS {
            return Err(TransportError::Validation(format!(
                "max_idle must not exceed {MAX_IDLE_CONNS}"
            )));
        }
        let timeouts = [
            ("connect", self.timeouts.connect),
            ("operation", self.timeouts.operation),
            ("keep_alive", self.timeouts.keep_alive),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(TransportError::Validation(format!(
                    "{name} timeout must be positive"
                )));
            }
        }
        Ok(())
    }

    /// ALPN ids offered on TLS connections.
    pub fn alpn_protocols(&self) -> Vec<&'static str> {
        if self.http2 {
            vec!["h2", "http/1.1"]
        } else {
            vec!["http/1.1"]
        }
    }
}
