//! Typed subscription table for engine events.
use std::{collections::HashMap, net::IpAddr};

use bytes::Bytes;
use http::{Request, Response};

use crate::{altsvc::AltSvcEntry, error::Outcome, selector::Token, Origin, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Response,
    Promise,
    AltSvc,
    Uncoalesce,
    Unreachable,
    Close,
}

#[derive(Debug)]
pub enum Event<'a> {
    /// A request finished, successfully or not, and will not be retried.
    Response {
        id: RequestId,
        outcome: &'a Outcome,
    },
    /// A server push attached to `parent`.
    Promise {
        parent: RequestId,
        request: &'a Request<Bytes>,
        response: &'a Response<Bytes>,
    },
    AltSvc(&'a AltSvcEntry),
    /// `origin` was split off a coalesced channel and its requests moved.
    Uncoalesce {
        origin: &'a Origin,
        requests: &'a [RequestId],
    },
    Unreachable {
        channel: Token,
        address: IpAddr,
    },
    Close {
        channel: Token,
    },
}

impl Event<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Response { .. } => EventKind::Response,
            Event::Promise { .. } => EventKind::Promise,
            Event::AltSvc(_) => EventKind::AltSvc,
            Event::Uncoalesce { .. } => EventKind::Uncoalesce,
            Event::Unreachable { .. } => EventKind::Unreachable,
            Event::Close { .. } => EventKind::Close,
        }
    }
}

type Callback = Box<dyn FnMut(&Event<'_>) + Send>;

struct Subscriber {
    once: bool,
    callback: Callback,
}

#[derive(Default)]
pub struct Emitter {
    subscribers: HashMap<EventKind, Vec<Subscriber>>,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<_, _> = self
            .subscribers
            .iter()
            .map(|(k, v)| (*k, v.len()))
            .collect();
        f.debug_struct("Emitter").field("subscribers", &counts).finish()
    }
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, kind: EventKind, callback: F)
    where
        F: FnMut(&Event<'_>) + Send + 'static,
    {
        self.subscribe(kind, false, Box::new(callback));
    }

    /// Like `on`, but the callback is dropped after its first call.
    pub fn once<F>(&mut self, kind: EventKind, callback: F)
    where
        F: FnMut(&Event<'_>) + Send + 'static,
    {
        self.subscribe(kind, true, Box::new(callback));
    }

    fn subscribe(&mut self, kind: EventKind, once: bool, callback: Callback) {
        self.subscribers
            .entry(kind)
            .or_default()
            .push(Subscriber { once, callback });
    }

    /// Call every subscriber of the event's kind in registration order.
    pub fn emit(&mut self, event: &Event<'_>) {
        let Some(subscribers) = self.subscribers.get_mut(&event.kind()) else {
            return;
        };
        subscribers.retain_mut(|s| {
            (s.callback)(event);
            !s.once
        });
    }

    #[inline]
    pub fn has_subscribers(&self, kind: EventKind) -> bool {
        self.subscribers.get(&kind).is_some_and(|s| !s.is_empty())
    }
}
