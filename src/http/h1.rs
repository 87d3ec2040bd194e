//! HTTP/1.1 client driver with optional pipelining, on `httparse`.
use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode, Version};

use super::{drain_into, DriverEvent, ProtocolDriver};
use crate::{buffer::ByteBuffer, Options, Origin, PendingRequest, TransportError};

/// Maximum number of headers to parse.
const MAX_HEADERS_COUNT: usize = 100;
/// Maximum response header size (64KB).
const MAX_HEADERS_SIZE: usize = 64 * 1024;

#[derive(Debug)]
enum Chunk {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

#[derive(Debug)]
enum BodyKind {
    Empty,
    Length(usize),
    Chunked(Chunk),
    UntilClose,
}

#[derive(Debug)]
struct Partial {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    kind: BodyKind,
    body: BytesMut,
}

#[derive(Debug)]
pub struct Http1Driver {
    max_pipelined: usize,
    max_requests: usize,
    queued: VecDeque<PendingRequest>,
    inflight: VecDeque<PendingRequest>,
    outbound: BytesMut,
    inbound: BytesMut,
    current: Option<Partial>,
    events: VecDeque<DriverEvent>,
    sent: usize,
    /// No further request will be written on this connection.
    closing: bool,
    finished: bool,
}

impl Http1Driver {
    pub fn new(options: &Options) -> Self {
        Self {
            max_pipelined: options.max_pipelined.max(1),
            max_requests: options.max_requests_per_connection.max(1),
            queued: VecDeque::new(),
            inflight: VecDeque::new(),
            outbound: BytesMut::new(),
            inbound: BytesMut::new(),
            current: None,
            events: VecDeque::new(),
            sent: 0,
            closing: false,
            finished: false,
        }
    }

    fn pump(&mut self) {
        while !self.closing
            && self.inflight.len() < self.max_pipelined
            && self.sent < self.max_requests
        {
            let Some(request) = self.queued.pop_front() else {
                break;
            };
            encode_request(&request, &mut self.outbound);
            self.inflight.push_back(request);
            self.sent += 1;
        }
        if self.sent >= self.max_requests {
            self.closing = true;
        }
        self.settle();
    }

    /// Once the last in-flight response is in, a closing connection either
    /// closes or asks to be replayed on a new socket.
    fn settle(&mut self) {
        if !self.closing || self.finished || !self.inflight.is_empty() || self.current.is_some() {
            return;
        }
        self.finished = true;
        if self.queued.is_empty() {
            self.events.push_back(DriverEvent::Close);
        } else {
            self.events.push_back(DriverEvent::Reset);
        }
    }

    fn fail(&mut self, error: TransportError) {
        #[cfg(feature = "logging")]
        tracing::error!("http/1.1 connection error: {error}");
        self.closing = true;
        self.finished = true;
        self.current = None;
        self.inbound.clear();
        self.events.push_back(DriverEvent::ConnectionError(error));
    }

    fn parse(&mut self) {
        loop {
            if self.finished {
                return;
            }
            if self.current.is_none() {
                match self.parse_head() {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => return self.fail(e),
                }
            }
            match self.parse_body() {
                Ok(true) => self.complete(),
                Ok(false) => return,
                Err(e) => return self.fail(e),
            }
        }
    }

    fn parse_head(&mut self) -> Result<bool, TransportError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
        let mut response = httparse::Response::new(&mut headers);
        let len = match response.parse(&self.inbound) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if self.inbound.len() > MAX_HEADERS_SIZE {
                    return Err(TransportError::H1Decode("response head too large".into()));
                }
                return Ok(false);
            }
            Err(e) => return Err(TransportError::H1Decode(e.to_string())),
        };

        let code = response.code.unwrap_or(0);
        let status = StatusCode::from_u16(code)
            .map_err(|_| TransportError::H1Decode(format!("invalid status {code}")))?;
        let version = match response.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let mut map = HeaderMap::with_capacity(response.headers.len());
        for h in response.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|e| TransportError::H1Decode(e.to_string()))?;
            let value = HeaderValue::from_bytes(h.value)
                .map_err(|e| TransportError::H1Decode(e.to_string()))?;
            map.append(name, value);
        }
        self.inbound.advance(len);

        // interim responses carry no body and do not answer the request
        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            return self.parse_head();
        }

        let Some(request) = self.inflight.front() else {
            return Err(TransportError::H1Decode("unsolicited response".into()));
        };
        let kind = if request.method() == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            BodyKind::Empty
        } else if is_chunked(&map) {
            BodyKind::Chunked(Chunk::Size)
        } else if let Some(len) = content_length(&map)? {
            if len == 0 {
                BodyKind::Empty
            } else {
                BodyKind::Length(len)
            }
        } else {
            BodyKind::UntilClose
        };

        self.current = Some(Partial {
            status,
            version,
            headers: map,
            kind,
            body: BytesMut::new(),
        });
        Ok(true)
    }

    /// Returns true when the current body is complete.
    fn parse_body(&mut self) -> Result<bool, TransportError> {
        let Some(partial) = self.current.as_mut() else {
            return Ok(false);
        };
        let inbound = &mut self.inbound;
        loop {
            match &mut partial.kind {
                BodyKind::Empty => return Ok(true),
                BodyKind::Length(remaining) => {
                    let n = (*remaining).min(inbound.len());
                    partial.body.extend_from_slice(&inbound.split_to(n));
                    *remaining -= n;
                    return Ok(*remaining == 0);
                }
                BodyKind::UntilClose => {
                    partial.body.extend_from_slice(&inbound.split());
                    return Ok(false);
                }
                BodyKind::Chunked(chunk) => match chunk {
                    Chunk::Size => {
                        let Some(line) = take_line(inbound)? else {
                            return Ok(false);
                        };
                        let size = line.split(|b| *b == b';').next().unwrap_or_default();
                        let size = std::str::from_utf8(size)
                            .ok()
                            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
                            .ok_or_else(|| TransportError::H1Decode("invalid chunk size".into()))?;
                        *chunk = if size == 0 {
                            Chunk::Trailers
                        } else {
                            Chunk::Data(size)
                        };
                    }
                    Chunk::Data(remaining) => {
                        if inbound.is_empty() {
                            return Ok(false);
                        }
                        let n = (*remaining).min(inbound.len());
                        partial.body.extend_from_slice(&inbound.split_to(n));
                        *remaining -= n;
                        if *remaining == 0 {
                            *chunk = Chunk::DataEnd;
                        }
                    }
                    Chunk::DataEnd => {
                        let Some(line) = take_line(inbound)? else {
                            return Ok(false);
                        };
                        if !line.is_empty() {
                            return Err(TransportError::H1Decode("missing chunk terminator".into()));
                        }
                        *chunk = Chunk::Size;
                    }
                    Chunk::Trailers => {
                        let Some(line) = take_line(inbound)? else {
                            return Ok(false);
                        };
                        if line.is_empty() {
                            return Ok(true);
                        }
                    }
                },
            }
        }
    }

    fn complete(&mut self) {
        let (Some(partial), Some(request)) = (self.current.take(), self.inflight.pop_front()) else {
            return;
        };
        let keep_alive = match partial.version {
            Version::HTTP_10 => has_token(&partial.headers, "keep-alive"),
            _ => !has_token(&partial.headers, "close"),
        };
        if !keep_alive || matches!(partial.kind, BodyKind::UntilClose) {
            self.closing = true;
        }

        let mut response = Response::new(partial.body.freeze());
        *response.status_mut() = partial.status;
        *response.version_mut() = partial.version;
        *response.headers_mut() = partial.headers;
        self.events.push_back(DriverEvent::Response(request, response));
        self.pump();
    }
}

fn encode_request(request: &PendingRequest, out: &mut BytesMut) {
    let req = &request.request;
    out.extend_from_slice(req.method().as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(request.path().as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    let headers = req.headers();
    if !headers.contains_key(header::HOST) {
        out.extend_from_slice(b"host: ");
        out.extend_from_slice(request.authority().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if let Some(alt_used) = request.alt_used.as_ref() {
        out.extend_from_slice(b"alt-used: ");
        out.extend_from_slice(alt_used.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    let body = req.body();
    let needs_length = !body.is_empty()
        || matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH);
    if needs_length
        && !headers.contains_key(header::CONTENT_LENGTH)
        && !headers.contains_key(header::TRANSFER_ENCODING)
    {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
}

/// Split off one CRLF-terminated line, without the terminator.
fn take_line(buf: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_HEADERS_SIZE => {
            Err(TransportError::H1Decode("line too long".into()))
        }
        None => Ok(None),
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>, TransportError> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| TransportError::H1Decode("invalid content-length".into()))?;
        if length.is_some_and(|l| l != parsed) {
            return Err(TransportError::H1Decode("conflicting content-length".into()));
        }
        length = Some(parsed);
    }
    Ok(length)
}

fn has_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case(token))
}

impl ProtocolDriver for Http1Driver {
    #[inline]
    fn protocol(&self) -> &'static str {
        "http/1.1"
    }

    fn send(&mut self, request: PendingRequest) {
        self.queued.push_back(request);
        self.pump();
    }

    #[inline]
    fn consume(&mut self, buf: &mut ByteBuffer) {
        drain_into(&mut self.outbound, buf);
    }

    fn feed(&mut self, data: &[u8]) {
        if self.finished {
            return;
        }
        self.inbound.extend_from_slice(data);
        self.parse();
    }

    fn on_eof(&mut self) {
        if self.finished {
            return;
        }
        if matches!(
            self.current.as_ref().map(|p| &p.kind),
            Some(BodyKind::UntilClose)
        ) {
            self.complete();
        }
        self.closing = true;
        self.current = None;
        while let Some(request) = self.inflight.pop_front() {
            self.events
                .push_back(DriverEvent::Error(request, TransportError::Eof));
        }
        self.settle();
    }

    #[inline]
    fn poll_event(&mut self) -> Option<DriverEvent> {
        self.events.pop_front()
    }

    fn take_pending(&mut self) -> Vec<PendingRequest> {
        self.current = None;
        self.inbound.clear();
        self.outbound.clear();
        self.inflight.drain(..).chain(self.queued.drain(..)).collect()
    }

    fn release(&mut self, origin: &Origin) -> Vec<PendingRequest> {
        // in-flight requests stay: responses are matched by position
        let (released, kept) = self.queued.drain(..).partition(|r| &r.origin == origin);
        self.queued = kept;
        released.into()
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.inflight.is_empty()
    }

    #[inline]
    fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn close(&mut self) {
        self.closing = true;
        self.settle();
    }
}
