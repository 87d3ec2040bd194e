//! Sans-io HTTP drivers. A driver turns requests into bytes and bytes into
//! events; the channel owns the socket and the buffers in between.
mod h1;
mod h2;

use bytes::{Bytes, BytesMut};
use http::{Request, Response};

pub use self::{h1::Http1Driver, h2::Http2Driver};
use crate::{buffer::ByteBuffer, Options, Origin, PendingRequest, TransportError};

#[derive(Debug)]
pub enum DriverEvent {
    Response(PendingRequest, Response<Bytes>),
    /// Server push associated with the request that opened `parent`.
    Promise {
        parent: PendingRequest,
        request: Request<Bytes>,
        response: Response<Bytes>,
    },
    /// The peer declared it is authoritative for another origin.
    Origin(Origin),
    /// One request failed; the connection stays usable.
    Error(PendingRequest, TransportError),
    /// The connection is unusable; everything in flight failed with it.
    ConnectionError(TransportError),
    /// Finish what is in flight, then close.
    Close,
    /// The connection went away but requests remain that were never
    /// processed by the peer; they can be replayed on a new socket.
    Reset,
}

pub trait ProtocolDriver: Send {
    fn protocol(&self) -> &'static str;
    /// Queue a request; it is encoded as soon as the driver's limits allow.
    fn send(&mut self, request: PendingRequest);
    /// Move encoded bytes into `buf` up to its capacity.
    fn consume(&mut self, buf: &mut ByteBuffer);
    fn feed(&mut self, data: &[u8]);
    /// The peer closed its side.
    fn on_eof(&mut self);
    fn poll_event(&mut self) -> Option<DriverEvent>;
    /// Every request without a response, in submission order. The driver is
    /// left empty.
    fn take_pending(&mut self) -> Vec<PendingRequest>;
    /// Remove and return the requests for `origin`.
    fn release(&mut self, origin: &Origin) -> Vec<PendingRequest>;
    /// No request awaiting a response.
    fn is_empty(&self) -> bool;
    /// Encoded bytes are waiting for `consume`.
    fn wants_write(&self) -> bool;
    /// Stop accepting requests and queue any goodbye frames.
    fn close(&mut self);
}

/// Driver for a negotiated ALPN id; anything other than `h2` speaks
/// HTTP/1.1.
pub fn build_driver(protocol: &str, options: &Options) -> Box<dyn ProtocolDriver> {
    match protocol {
        "h2" => Box::new(Http2Driver::new(options)),
        _ => Box::new(Http1Driver::new(options)),
    }
}

#[inline]
fn drain_into(outbound: &mut BytesMut, buf: &mut ByteBuffer) {
    let n = buf.append(&outbound[..]);
    let _ = outbound.split_to(n);
}
