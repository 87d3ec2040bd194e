use std::{fmt, sync::Arc};

use bytes::Bytes;
use http::{HeaderValue, Request};

use crate::Origin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A request bound for a channel. The envelope is immutable and shared, so
/// resubmitting after a reset or unmerge never copies the body.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: RequestId,
    pub origin: Origin,
    pub request: Arc<Request<Bytes>>,
    /// Set when the request was steered to an Alt-Svc alternative.
    pub alt_used: Option<HeaderValue>,
}

impl PendingRequest {
    #[inline]
    pub fn new(id: RequestId, origin: Origin, request: Arc<Request<Bytes>>) -> Self {
        Self {
            id,
            origin,
            request,
            alt_used: None,
        }
    }

    #[inline]
    pub fn method(&self) -> &http::Method {
        self.request.method()
    }

    /// Path and query for the request line, `/` when empty.
    pub fn path(&self) -> &str {
        self.request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
    }

    /// Value for `Host` / `:authority`, omitting the default port.
    pub fn authority(&self) -> String {
        if self.origin.port == self.origin.scheme.default_port() {
            self.origin.host_literal()
        } else {
            self.origin.authority()
        }
    }
}
