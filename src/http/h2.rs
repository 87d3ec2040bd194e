//! HTTP/2 client driver (RFC 9113): framing, flow control and stream
//! bookkeeping. Header blocks are compressed with the `hpack` crate.
use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri, Version};

use super::{drain_into, DriverEvent, ProtocolDriver};
use crate::{
    buffer::ByteBuffer, error::H2ErrorCode, Options, Origin, PendingRequest, TransportError,
};

pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub(crate) const FRAME_HEADER_LEN: usize = 9;

pub(crate) const FRAME_DATA: u8 = 0x0;
pub(crate) const FRAME_HEADERS: u8 = 0x1;
pub(crate) const FRAME_RST_STREAM: u8 = 0x3;
pub(crate) const FRAME_SETTINGS: u8 = 0x4;
pub(crate) const FRAME_PUSH_PROMISE: u8 = 0x5;
pub(crate) const FRAME_PING: u8 = 0x6;
pub(crate) const FRAME_GOAWAY: u8 = 0x7;
pub(crate) const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub(crate) const FRAME_CONTINUATION: u8 = 0x9;
// RFC 8336
pub(crate) const FRAME_ORIGIN: u8 = 0xc;

pub(crate) const FLAG_END_STREAM: u8 = 0x1;
pub(crate) const FLAG_ACK: u8 = 0x1;
pub(crate) const FLAG_END_HEADERS: u8 = 0x4;
pub(crate) const FLAG_PADDED: u8 = 0x8;
pub(crate) const FLAG_PRIORITY: u8 = 0x20;

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

const DEFAULT_WINDOW: i64 = 65_535;
const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;
const MAX_WINDOW: i64 = (1 << 31) - 1;
const MAX_STREAM_ID: u32 = (1 << 31) - 1;

const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

struct Stream {
    request: PendingRequest,
    head: Option<(StatusCode, HeaderMap)>,
    body: BytesMut,
    send_window: i64,
    pending_body: Bytes,
    end_sent: bool,
}

struct Pushed {
    parent: PendingRequest,
    request: Request<Bytes>,
    head: Option<(StatusCode, HeaderMap)>,
    body: BytesMut,
}

struct HeaderBlock {
    stream_id: u32,
    promised: Option<u32>,
    end_stream: bool,
    block: BytesMut,
}

pub struct Http2Driver {
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    outbound: BytesMut,
    inbound: BytesMut,
    events: VecDeque<DriverEvent>,
    queued: VecDeque<PendingRequest>,
    streams: BTreeMap<u32, Stream>,
    pushed: HashMap<u32, Pushed>,
    next_stream_id: u32,
    max_concurrent: usize,
    max_frame_size: usize,
    send_window: i64,
    initial_send_window: i64,
    continuation: Option<HeaderBlock>,
    push: bool,
    closing: bool,
    finished: bool,
}

impl std::fmt::Debug for Http2Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Driver")
            .field("streams", &self.streams.len())
            .field("queued", &self.queued.len())
            .field("next_stream_id", &self.next_stream_id)
            .field("closing", &self.closing)
            .finish()
    }
}

fn write_frame(out: &mut BytesMut, typ: u8, flags: u8, stream_id: u32, payload: &[u8]) {
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.put_uint(payload.len() as u64, 3);
    out.put_u8(typ);
    out.put_u8(flags);
    out.put_u32(stream_id & MAX_STREAM_ID);
    out.extend_from_slice(payload);
}

/// Strip the padding of a padded frame.
fn unpad(flags: u8, mut payload: Bytes) -> Result<Bytes, H2ErrorCode> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(H2ErrorCode::ProtocolError);
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(H2ErrorCode::ProtocolError);
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

impl Http2Driver {
    pub fn new(options: &Options) -> Self {
        let mut driver = Self {
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            outbound: BytesMut::new(),
            inbound: BytesMut::new(),
            events: VecDeque::new(),
            queued: VecDeque::new(),
            streams: BTreeMap::new(),
            pushed: HashMap::new(),
            next_stream_id: 1,
            max_concurrent: options.max_concurrent_streams.max(1) as usize,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            send_window: DEFAULT_WINDOW,
            initial_send_window: DEFAULT_WINDOW,
            continuation: None,
            push: options.push_promise,
            closing: false,
            finished: false,
        };
        driver.outbound.extend_from_slice(PREFACE);
        let mut settings = BytesMut::new();
        for (id, value) in [
            (SETTINGS_ENABLE_PUSH, options.push_promise as u32),
            (
                SETTINGS_MAX_CONCURRENT_STREAMS,
                options.max_concurrent_streams,
            ),
        ] {
            settings.put_u16(id);
            settings.put_u32(value);
        }
        write_frame(&mut driver.outbound, FRAME_SETTINGS, 0, 0, &settings);
        driver
    }

    fn pump(&mut self) {
        while !self.closing && self.streams.len() < self.max_concurrent {
            let Some(request) = self.queued.pop_front() else {
                break;
            };
            if self.next_stream_id > MAX_STREAM_ID {
                // ids exhausted: replay everything on a fresh connection
                self.queued.push_front(request);
                self.closing = true;
                break;
            }
            self.open_stream(request);
        }
        self.flush_bodies();
        self.settle();
    }

    fn settle(&mut self) {
        if !self.closing || self.finished || !self.streams.is_empty() {
            return;
        }
        self.finished = true;
        if self.queued.is_empty() {
            self.events.push_back(DriverEvent::Close);
        } else {
            self.events.push_back(DriverEvent::Reset);
        }
    }

    fn open_stream(&mut self, request: PendingRequest) {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let req = &request.request;
        let authority = request.authority();
        let scheme = request.origin.scheme.as_str();
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b":method".to_vec(), req.method().as_str().as_bytes().to_vec()),
            (b":scheme".to_vec(), scheme.as_bytes().to_vec()),
            (b":authority".to_vec(), authority.into_bytes()),
            (b":path".to_vec(), request.path().as_bytes().to_vec()),
        ];
        for (name, value) in req.headers() {
            if CONNECTION_HEADERS.contains(&name.as_str()) {
                continue;
            }
            fields.push((name.as_str().as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        if let Some(alt_used) = request.alt_used.as_ref() {
            fields.push((b"alt-used".to_vec(), alt_used.as_bytes().to_vec()));
        }
        let block = self
            .encoder
            .encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));

        let body = req.body().clone();
        let end_stream = body.is_empty();
        self.write_header_block(stream_id, &block, end_stream);

        #[cfg(feature = "logging")]
        tracing::debug!("h2 stream {stream_id} opened for {}", request.id);
        self.streams.insert(
            stream_id,
            Stream {
                request,
                head: None,
                body: BytesMut::new(),
                send_window: self.initial_send_window,
                pending_body: body,
                end_sent: end_stream,
            },
        );
    }

    fn write_header_block(&mut self, stream_id: u32, block: &[u8], end_stream: bool) {
        let mut chunks = block.chunks(self.max_frame_size).peekable();
        let first = chunks.next().unwrap_or_default();
        let mut flags = if end_stream { FLAG_END_STREAM } else { 0 };
        if chunks.peek().is_none() {
            flags |= FLAG_END_HEADERS;
        }
        write_frame(&mut self.outbound, FRAME_HEADERS, flags, stream_id, first);
        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_none() {
                FLAG_END_HEADERS
            } else {
                0
            };
            write_frame(&mut self.outbound, FRAME_CONTINUATION, flags, stream_id, chunk);
        }
    }

    fn flush_bodies(&mut self) {
        for (stream_id, stream) in self.streams.iter_mut() {
            while !stream.end_sent {
                let window = self.send_window.min(stream.send_window).max(0) as usize;
                let remaining = stream.pending_body.len();
                if window == 0 {
                    break;
                }
                let n = remaining.min(window).min(self.max_frame_size);
                let chunk = stream.pending_body.split_to(n);
                let end = stream.pending_body.is_empty();
                let flags = if end { FLAG_END_STREAM } else { 0 };
                write_frame(&mut self.outbound, FRAME_DATA, flags, *stream_id, &chunk);
                self.send_window -= n as i64;
                stream.send_window -= n as i64;
                stream.end_sent = end;
            }
        }
    }

    fn fail(&mut self, code: H2ErrorCode) {
        #[cfg(feature = "logging")]
        tracing::error!("h2 connection error {code:?}");
        let last = self.pushed.keys().max().copied().unwrap_or(0);
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(last);
        payload.put_u32(code.into());
        write_frame(&mut self.outbound, FRAME_GOAWAY, 0, 0, &payload);
        self.closing = true;
        self.finished = true;
        self.continuation = None;
        self.inbound.clear();
        self.events
            .push_back(DriverEvent::ConnectionError(TransportError::H2(code)));
    }

    fn parse(&mut self) {
        while !self.finished && self.inbound.len() >= FRAME_HEADER_LEN {
            let len = ((self.inbound[0] as usize) << 16)
                | ((self.inbound[1] as usize) << 8)
                | self.inbound[2] as usize;
            if len > DEFAULT_MAX_FRAME_SIZE {
                return self.fail(H2ErrorCode::FrameSizeError);
            }
            if self.inbound.len() < FRAME_HEADER_LEN + len {
                return;
            }
            let mut header = self.inbound.split_to(FRAME_HEADER_LEN);
            let payload = self.inbound.split_to(len).freeze();
            header.advance(3);
            let typ = header.get_u8();
            let flags = header.get_u8();
            let stream_id = header.get_u32() & MAX_STREAM_ID;

            if self.continuation.is_some() && typ != FRAME_CONTINUATION {
                return self.fail(H2ErrorCode::ProtocolError);
            }
            if let Err(code) = self.on_frame(typ, flags, stream_id, payload) {
                return self.fail(code);
            }
        }
    }

    fn on_frame(
        &mut self,
        typ: u8,
        flags: u8,
        stream_id: u32,
        payload: Bytes,
    ) -> Result<(), H2ErrorCode> {
        match typ {
            FRAME_DATA => self.on_data(flags, stream_id, payload),
            FRAME_HEADERS => {
                let mut payload = unpad(flags, payload)?;
                if flags & FLAG_PRIORITY != 0 {
                    if payload.len() < 5 {
                        return Err(H2ErrorCode::ProtocolError);
                    }
                    payload.advance(5);
                }
                self.on_header_fragment(HeaderBlock {
                    stream_id,
                    promised: None,
                    end_stream: flags & FLAG_END_STREAM != 0,
                    block: BytesMut::from(&payload[..]),
                }, flags & FLAG_END_HEADERS != 0)
            }
            FRAME_CONTINUATION => {
                let Some(mut pending) = self.continuation.take() else {
                    return Err(H2ErrorCode::ProtocolError);
                };
                if pending.stream_id != stream_id {
                    return Err(H2ErrorCode::ProtocolError);
                }
                pending.block.extend_from_slice(&payload);
                self.on_header_fragment(pending, flags & FLAG_END_HEADERS != 0)
            }
            FRAME_RST_STREAM => {
                if payload.len() != 4 {
                    return Err(H2ErrorCode::FrameSizeError);
                }
                let code = H2ErrorCode::from((&payload[..]).get_u32());
                self.on_reset(stream_id, code);
                Ok(())
            }
            FRAME_SETTINGS => self.on_settings(flags, payload),
            FRAME_PUSH_PROMISE => {
                if !self.push {
                    return Err(H2ErrorCode::ProtocolError);
                }
                let mut payload = unpad(flags, payload)?;
                if payload.len() < 4 {
                    return Err(H2ErrorCode::ProtocolError);
                }
                let promised = payload.get_u32() & MAX_STREAM_ID;
                self.on_header_fragment(HeaderBlock {
                    stream_id,
                    promised: Some(promised),
                    end_stream: false,
                    block: BytesMut::from(&payload[..]),
                }, flags & FLAG_END_HEADERS != 0)
            }
            FRAME_PING => {
                if payload.len() != 8 {
                    return Err(H2ErrorCode::FrameSizeError);
                }
                if flags & FLAG_ACK == 0 {
                    write_frame(&mut self.outbound, FRAME_PING, FLAG_ACK, 0, &payload);
                }
                Ok(())
            }
            FRAME_GOAWAY => {
                if payload.len() < 8 {
                    return Err(H2ErrorCode::FrameSizeError);
                }
                let mut payload = payload;
                let last_stream_id = payload.get_u32() & MAX_STREAM_ID;
                let code = H2ErrorCode::from(payload.get_u32());
                self.on_goaway(last_stream_id, code);
                Ok(())
            }
            FRAME_WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(H2ErrorCode::FrameSizeError);
                }
                let increment = ((&payload[..]).get_u32() & MAX_STREAM_ID) as i64;
                if stream_id == 0 {
                    self.send_window += increment;
                    if self.send_window > MAX_WINDOW {
                        return Err(H2ErrorCode::FlowControlError);
                    }
                } else if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.send_window += increment;
                }
                self.flush_bodies();
                Ok(())
            }
            FRAME_ORIGIN => {
                if stream_id == 0 && flags == 0 {
                    self.on_origin(payload);
                }
                Ok(())
            }
            // PRIORITY and unknown extension frames
            _ => Ok(()),
        }
    }

    fn on_data(&mut self, flags: u8, stream_id: u32, payload: Bytes) -> Result<(), H2ErrorCode> {
        let consumed = payload.len() as u32;
        let data = unpad(flags, payload)?;
        let end_stream = flags & FLAG_END_STREAM != 0;

        if consumed > 0 {
            let mut increment = BytesMut::with_capacity(4);
            increment.put_u32(consumed);
            write_frame(&mut self.outbound, FRAME_WINDOW_UPDATE, 0, 0, &increment);
            if !end_stream
                && (self.streams.contains_key(&stream_id) || self.pushed.contains_key(&stream_id))
            {
                write_frame(&mut self.outbound, FRAME_WINDOW_UPDATE, 0, stream_id, &increment);
            }
        }

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.head.is_none() {
                return Err(H2ErrorCode::ProtocolError);
            }
            stream.body.extend_from_slice(&data);
        } else if let Some(pushed) = self.pushed.get_mut(&stream_id) {
            pushed.body.extend_from_slice(&data);
        }
        if end_stream {
            self.finish_stream(stream_id);
        }
        Ok(())
    }

    fn on_header_fragment(&mut self, block: HeaderBlock, end_headers: bool) -> Result<(), H2ErrorCode> {
        if !end_headers {
            self.continuation = Some(block);
            return Ok(());
        }
        let fields = self
            .decoder
            .decode(&block.block)
            .map_err(|_| H2ErrorCode::CompressionError)?;
        match block.promised {
            Some(promised) => self.on_promise(block.stream_id, promised, fields),
            None => self.on_headers(block.stream_id, fields, block.end_stream),
        }
    }

    fn on_headers(
        &mut self,
        stream_id: u32,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        end_stream: bool,
    ) -> Result<(), H2ErrorCode> {
        let head = match self.streams.get_mut(&stream_id) {
            Some(stream) => &mut stream.head,
            None => match self.pushed.get_mut(&stream_id) {
                Some(pushed) => &mut pushed.head,
                None => return Ok(()),
            },
        };
        if head.is_none() {
            let (status, headers) = decode_head(fields)?;
            if status.is_informational() {
                return Ok(());
            }
            *head = Some((status, headers));
        }
        // a second block is trailers, which are dropped
        if end_stream {
            self.finish_stream(stream_id);
        }
        Ok(())
    }

    fn on_promise(
        &mut self,
        stream_id: u32,
        promised: u32,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<(), H2ErrorCode> {
        let Some(parent) = self.streams.get(&stream_id).map(|s| s.request.clone()) else {
            return Ok(());
        };
        let mut method = None;
        let mut scheme = None;
        let mut authority = None;
        let mut path = None;
        let mut builder = Request::builder().version(Version::HTTP_2);
        for (name, value) in fields.iter() {
            let value_str = std::str::from_utf8(value).map_err(|_| H2ErrorCode::ProtocolError)?;
            match name.as_slice() {
                b":method" => method = Some(value_str),
                b":scheme" => scheme = Some(value_str),
                b":authority" => authority = Some(value_str),
                b":path" => path = Some(value_str),
                n if n.starts_with(b":") => return Err(H2ErrorCode::ProtocolError),
                n => builder = builder.header(n, value.as_slice()),
            }
        }
        let (Some(method), Some(scheme), Some(authority), Some(path)) =
            (method, scheme, authority, path)
        else {
            return Err(H2ErrorCode::ProtocolError);
        };
        let request = builder
            .method(method)
            .uri(format!("{scheme}://{authority}{path}"))
            .body(Bytes::new())
            .map_err(|_| H2ErrorCode::ProtocolError)?;
        self.pushed.insert(
            promised,
            Pushed {
                parent,
                request,
                head: None,
                body: BytesMut::new(),
            },
        );
        Ok(())
    }

    fn finish_stream(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.remove(&stream_id) {
            let response = match stream.head {
                Some((status, headers)) => build_response(status, headers, stream.body.freeze()),
                None => {
                    self.events.push_back(DriverEvent::Error(
                        stream.request,
                        TransportError::H2(H2ErrorCode::ProtocolError),
                    ));
                    self.pump();
                    return;
                }
            };
            self.events
                .push_back(DriverEvent::Response(stream.request, response));
            self.pump();
        } else if let Some(pushed) = self.pushed.remove(&stream_id) {
            if let Some((status, headers)) = pushed.head {
                self.events.push_back(DriverEvent::Promise {
                    parent: pushed.parent,
                    request: pushed.request,
                    response: build_response(status, headers, pushed.body.freeze()),
                });
            }
        }
    }

    fn on_reset(&mut self, stream_id: u32, code: H2ErrorCode) {
        self.pushed.remove(&stream_id);
        let Some(stream) = self.streams.remove(&stream_id) else {
            return;
        };
        #[cfg(feature = "logging")]
        tracing::debug!("h2 stream {stream_id} reset with {code:?}");
        if code == H2ErrorCode::RefusedStream {
            self.queued.push_front(stream.request);
        } else {
            self.events.push_back(DriverEvent::Error(
                stream.request,
                TransportError::StreamReset(code),
            ));
        }
        self.pump();
    }

    fn on_settings(&mut self, flags: u8, payload: Bytes) -> Result<(), H2ErrorCode> {
        if flags & FLAG_ACK != 0 {
            return Ok(());
        }
        if payload.len() % 6 != 0 {
            return Err(H2ErrorCode::FrameSizeError);
        }
        let mut payload = payload;
        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            match id {
                SETTINGS_HEADER_TABLE_SIZE => {}
                SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent = value as usize,
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    let value = value as i64;
                    if value > MAX_WINDOW {
                        return Err(H2ErrorCode::FlowControlError);
                    }
                    let delta = value - self.initial_send_window;
                    self.initial_send_window = value;
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE as u32..=(1 << 24) - 1).contains(&value) {
                        return Err(H2ErrorCode::ProtocolError);
                    }
                    self.max_frame_size = value as usize;
                }
                _ => {}
            }
        }
        write_frame(&mut self.outbound, FRAME_SETTINGS, FLAG_ACK, 0, &[]);
        self.pump();
        Ok(())
    }

    fn on_goaway(&mut self, last_stream_id: u32, code: H2ErrorCode) {
        #[cfg(feature = "logging")]
        tracing::info!("h2 goaway, last stream {last_stream_id}, {code:?}");
        let _ = code;
        self.closing = true;
        // streams the peer never processed go back to the queue in order
        let unprocessed = self.streams.split_off(&(last_stream_id + 1));
        for (_, stream) in unprocessed.into_iter().rev() {
            self.queued.push_front(stream.request);
        }
        self.settle();
    }

    fn on_origin(&mut self, mut payload: Bytes) {
        while payload.len() >= 2 {
            let len = payload.get_u16() as usize;
            if len > payload.len() {
                return;
            }
            let entry = payload.split_to(len);
            let origin = std::str::from_utf8(&entry)
                .ok()
                .and_then(|s| s.parse::<Uri>().ok())
                .and_then(|uri| Origin::try_from(&uri).ok());
            if let Some(origin) = origin {
                self.events.push_back(DriverEvent::Origin(origin));
            }
        }
    }
}

fn decode_head(fields: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(StatusCode, HeaderMap), H2ErrorCode> {
    let mut status = None;
    let mut headers = HeaderMap::with_capacity(fields.len());
    for (name, value) in fields {
        if name.as_slice() == b":status" {
            status = StatusCode::from_bytes(&value).ok();
            continue;
        }
        if name.starts_with(b":") {
            return Err(H2ErrorCode::ProtocolError);
        }
        let name = HeaderName::from_bytes(&name).map_err(|_| H2ErrorCode::ProtocolError)?;
        let value = HeaderValue::from_bytes(&value).map_err(|_| H2ErrorCode::ProtocolError)?;
        headers.append(name, value);
    }
    let status = status.ok_or(H2ErrorCode::ProtocolError)?;
    Ok((status, headers))
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.version_mut() = Version::HTTP_2;
    *response.headers_mut() = headers;
    response
}

impl ProtocolDriver for Http2Driver {
    #[inline]
    fn protocol(&self) -> &'static str {
        "h2"
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
        self.closing = true;
        self.pushed.clear();
        let streams = std::mem::take(&mut self.streams);
        for (_, stream) in streams {
            self.events
                .push_back(DriverEvent::Error(stream.request, TransportError::Eof));
        }
        self.settle();
    }

    #[inline]
    fn poll_event(&mut self) -> Option<DriverEvent> {
        self.events.pop_front()
    }

    fn take_pending(&mut self) -> Vec<PendingRequest> {
        self.inbound.clear();
        self.outbound.clear();
        self.continuation = None;
        self.pushed.clear();
        let streams = std::mem::take(&mut self.streams);
        streams
            .into_values()
            .map(|s| s.request)
            .chain(self.queued.drain(..))
            .collect()
    }

    fn release(&mut self, origin: &Origin) -> Vec<PendingRequest> {
        let ids: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| &s.request.origin == origin)
            .map(|(id, _)| *id)
            .collect();
        let mut released = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(stream) = self.streams.remove(&id) {
                let mut code = BytesMut::with_capacity(4);
                code.put_u32(H2ErrorCode::Cancel.into());
                write_frame(&mut self.outbound, FRAME_RST_STREAM, 0, id, &code);
                released.push(stream.request);
            }
        }
        let (matching, kept): (VecDeque<_>, VecDeque<_>) =
            self.queued.drain(..).partition(|r| &r.origin == origin);
        self.queued = kept;
        released.extend(matching);
        self.pump();
        released
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.streams.is_empty() && self.queued.is_empty()
    }

    #[inline]
    fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn close(&mut self) {
        if !self.closing {
            let mut payload = BytesMut::with_capacity(8);
            payload.put_u32(self.pushed.keys().max().copied().unwrap_or(0));
            payload.put_u32(H2ErrorCode::NoError.into());
            write_frame(&mut self.outbound, FRAME_GOAWAY, 0, 0, &payload);
        }
        self.closing = true;
        self.settle();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::Method;

    use super::*;
    use crate::{origin::Scheme, RequestId};

    fn origin() -> Origin {
        Origin::new(Scheme::Https, "example.com", 443)
    }

    fn pending(id: u64, body: &'static [u8]) -> PendingRequest {
        let request = Request::builder()
            .method(if body.is_empty() { Method::GET } else { Method::POST })
            .uri(format!("https://example.com/{id}"))
            .header("x-id", id.to_string())
            .body(Bytes::from_static(body))
            .unwrap();
        PendingRequest::new(RequestId(id), origin(), Arc::new(request))
    }

    /// Frames the client wrote, without the preface.
    fn frames(driver: &mut Http2Driver) -> Vec<(u8, u8, u32, Bytes)> {
        let mut buf = ByteBuffer::new(1 << 20);
        driver.consume(&mut buf);
        let mut data = Bytes::copy_from_slice(buf.as_slice());
        if data.starts_with(PREFACE) {
            data.advance(PREFACE.len());
        }
        let mut out = Vec::new();
        while data.len() >= FRAME_HEADER_LEN {
            let len = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | data[2] as usize;
            data.advance(3);
            let typ = data.get_u8();
            let flags = data.get_u8();
            let sid = data.get_u32();
            out.push((typ, flags, sid, data.split_to(len)));
        }
        out
    }

    fn server_frame(typ: u8, flags: u8, sid: u32, payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::new();
        write_frame(&mut out, typ, flags, sid, payload);
        out
    }

    fn settings(entries: &[(u16, u32)]) -> BytesMut {
        let mut payload = BytesMut::new();
        for (id, value) in entries {
            payload.put_u16(*id);
            payload.put_u32(*value);
        }
        server_frame(FRAME_SETTINGS, 0, 0, &payload)
    }

    fn response_headers(encoder: &mut hpack::Encoder<'static>, sid: u32, status: &str, end: bool) -> BytesMut {
        let block = encoder.encode(vec![
            (&b":status"[..], status.as_bytes()),
            (&b"alt-svc"[..], &b"h2=\":8443\""[..]),
        ]);
        let flags = FLAG_END_HEADERS | if end { FLAG_END_STREAM } else { 0 };
        server_frame(FRAME_HEADERS, flags, sid, &block)
    }

    fn events(driver: &mut Http2Driver) -> Vec<DriverEvent> {
        std::iter::from_fn(|| driver.poll_event()).collect()
    }

    #[test]
    fn test_preface_and_request_round_trip() {
        let mut driver = Http2Driver::new(&Options::default());
        let mut buf = ByteBuffer::new(1 << 16);
        driver.consume(&mut buf);
        assert!(buf.as_slice().starts_with(PREFACE));

        driver.send(pending(1, b""));
        let written = frames(&mut driver);
        let (typ, flags, sid, block) = &written[0];
        assert_eq!((*typ, *sid), (FRAME_HEADERS, 1));
        assert_eq!(*flags, FLAG_END_HEADERS | FLAG_END_STREAM);
        let fields = hpack::Decoder::new().decode(block).unwrap();
        assert!(fields.contains(&(b":authority".to_vec(), b"example.com".to_vec())));
        assert!(fields.contains(&(b":path".to_vec(), b"/1".to_vec())));

        let mut encoder = hpack::Encoder::new();
        driver.feed(&settings(&[]));
        driver.feed(&response_headers(&mut encoder, 1, "200", false));
        driver.feed(&server_frame(FRAME_DATA, FLAG_END_STREAM, 1, b"hello"));

        let evs = events(&mut driver);
        let [DriverEvent::Response(req, resp)] = evs.as_slice() else {
            panic!("unexpected {evs:?}");
        };
        assert_eq!(req.id, RequestId(1));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.version(), Version::HTTP_2);
        assert_eq!(resp.body().as_ref(), b"hello");
        assert!(resp.headers().contains_key("alt-svc"));
        assert!(driver.is_empty());

        let written = frames(&mut driver);
        assert!(written
            .iter()
            .any(|(t, f, _, _)| *t == FRAME_SETTINGS && *f == FLAG_ACK));
        assert!(written.iter().any(|(t, _, _, _)| *t == FRAME_WINDOW_UPDATE));
    }

    #[test]
    fn test_max_concurrent_streams_queues() {
        let mut driver = Http2Driver::new(&Options::default());
        frames(&mut driver);
        driver.feed(&settings(&[(SETTINGS_MAX_CONCURRENT_STREAMS, 1)]));
        driver.send(pending(1, b""));
        driver.send(pending(2, b""));
        let opened: Vec<u32> = frames(&mut driver)
            .into_iter()
            .filter(|f| f.0 == FRAME_HEADERS)
            .map(|f| f.2)
            .collect();
        assert_eq!(opened, vec![1]);

        let mut encoder = hpack::Encoder::new();
        driver.feed(&response_headers(&mut encoder, 1, "204", true));
        let opened: Vec<u32> = frames(&mut driver)
            .into_iter()
            .filter(|f| f.0 == FRAME_HEADERS)
            .map(|f| f.2)
            .collect();
        assert_eq!(opened, vec![3]);
    }

    #[test]
    fn test_refused_stream_is_retried_other_reset_fails() {
        let mut driver = Http2Driver::new(&Options::default());
        driver.send(pending(1, b""));
        driver.send(pending(2, b""));
        frames(&mut driver);

        let mut code = BytesMut::new();
        code.put_u32(H2ErrorCode::RefusedStream.into());
        driver.feed(&server_frame(FRAME_RST_STREAM, 0, 1, &code));
        let reopened: Vec<u32> = frames(&mut driver)
            .into_iter()
            .filter(|f| f.0 == FRAME_HEADERS)
            .map(|f| f.2)
            .collect();
        assert_eq!(reopened, vec![5]);
        assert!(events(&mut driver).is_empty());

        let mut code = BytesMut::new();
        code.put_u32(H2ErrorCode::Cancel.into());
        driver.feed(&server_frame(FRAME_RST_STREAM, 0, 3, &code));
        let evs = events(&mut driver);
        let [DriverEvent::Error(req, TransportError::StreamReset(H2ErrorCode::Cancel))] =
            evs.as_slice()
        else {
            panic!("unexpected {evs:?}");
        };
        assert_eq!(req.id, RequestId(2));
    }

    #[test]
    fn test_goaway_requeues_unprocessed_then_resets() {
        let mut driver = Http2Driver::new(&Options::default());
        driver.send(pending(1, b""));
        driver.send(pending(2, b""));
        driver.send(pending(3, b""));
        frames(&mut driver);

        let mut payload = BytesMut::new();
        payload.put_u32(1);
        payload.put_u32(0);
        driver.feed(&server_frame(FRAME_GOAWAY, 0, 0, &payload));
        assert!(events(&mut driver).is_empty());

        let mut encoder = hpack::Encoder::new();
        driver.feed(&response_headers(&mut encoder, 1, "200", true));
        let evs = events(&mut driver);
        assert!(matches!(
            evs.as_slice(),
            [DriverEvent::Response(..), DriverEvent::Reset]
        ));
        let ids: Vec<_> = driver.take_pending().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RequestId(2), RequestId(3)]);
    }

    #[test]
    fn test_ping_is_acked() {
        let mut driver = Http2Driver::new(&Options::default());
        frames(&mut driver);
        driver.feed(&server_frame(FRAME_PING, 0, 0, b"12345678"));
        let written = frames(&mut driver);
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, FRAME_PING);
        assert_eq!(written[0].1, FLAG_ACK);
        assert_eq!(written[0].3.as_ref(), b"12345678");
    }

    #[test]
    fn test_continuation_joins_header_block() {
        let mut driver = Http2Driver::new(&Options::default());
        driver.send(pending(1, b""));
        let mut encoder = hpack::Encoder::new();
        let block = encoder.encode(vec![
            (&b":status"[..], &b"200"[..]),
            (&b"x-long"[..], &b"abcdefghijklmnop"[..]),
        ]);
        let (a, b) = block.split_at(block.len() / 2);
        driver.feed(&server_frame(FRAME_HEADERS, FLAG_END_STREAM, 1, a));
        assert!(events(&mut driver).is_empty());
        driver.feed(&server_frame(FRAME_CONTINUATION, FLAG_END_HEADERS, 1, b));
        let evs = events(&mut driver);
        let [DriverEvent::Response(_, resp)] = evs.as_slice() else {
            panic!("unexpected {evs:?}");
        };
        assert_eq!(resp.headers()["x-long"], "abcdefghijklmnop");
    }

    #[test]
    fn test_interleaved_frame_during_continuation_is_error() {
        let mut driver = Http2Driver::new(&Options::default());
        driver.send(pending(1, b""));
        driver.feed(&server_frame(FRAME_HEADERS, 0, 1, b"\x88"));
        driver.feed(&server_frame(FRAME_PING, 0, 0, b"12345678"));
        assert!(matches!(
            events(&mut driver).as_slice(),
            [DriverEvent::ConnectionError(TransportError::H2(H2ErrorCode::ProtocolError))]
        ));
    }

    #[test]
    fn test_origin_frame() {
        let mut driver = Http2Driver::new(&Options::default());
        let mut payload = BytesMut::new();
        for origin in ["https://other.example", "https://third.example:8443"] {
            payload.put_u16(origin.len() as u16);
            payload.extend_from_slice(origin.as_bytes());
        }
        driver.feed(&server_frame(FRAME_ORIGIN, 0, 0, &payload));
        let origins: Vec<_> = events(&mut driver)
            .into_iter()
            .map(|e| match e {
                DriverEvent::Origin(o) => o,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(origins[0].host, "other.example");
        assert_eq!(origins[1].port, 8443);
    }

    #[test]
    fn test_push_promise_when_enabled() {
        let options = Options {
            push_promise: true,
            ..Default::default()
        };
        let mut driver = Http2Driver::new(&options);
        driver.send(pending(1, b""));
        let mut encoder = hpack::Encoder::new();
        let block = encoder.encode(vec![
            (&b":method"[..], &b"GET"[..]),
            (&b":scheme"[..], &b"https"[..]),
            (&b":authority"[..], &b"example.com"[..]),
            (&b":path"[..], &b"/style.css"[..]),
        ]);
        let mut payload = BytesMut::new();
        payload.put_u32(2);
        payload.extend_from_slice(&block);
        driver.feed(&server_frame(FRAME_PUSH_PROMISE, FLAG_END_HEADERS, 1, &payload));
        driver.feed(&response_headers(&mut encoder, 2, "200", false));
        driver.feed(&server_frame(FRAME_DATA, FLAG_END_STREAM, 2, b"body{}"));

        let evs = events(&mut driver);
        let [DriverEvent::Promise {
            parent,
            request,
            response,
        }] = evs.as_slice()
        else {
            panic!("unexpected {evs:?}");
        };
        assert_eq!(parent.id, RequestId(1));
        assert_eq!(request.uri().path(), "/style.css");
        assert_eq!(response.body().as_ref(), b"body{}");
        assert!(!driver.is_empty());
    }

    #[test]
    fn test_push_promise_rejected_when_disabled() {
        let mut driver = Http2Driver::new(&Options::default());
        driver.send(pending(1, b""));
        let mut payload = BytesMut::new();
        payload.put_u32(2);
        driver.feed(&server_frame(FRAME_PUSH_PROMISE, FLAG_END_HEADERS, 1, &payload));
        assert!(matches!(
            events(&mut driver).as_slice(),
            [DriverEvent::ConnectionError(_)]
        ));
    }

    #[test]
    fn test_body_respects_flow_control() {
        static BODY: [u8; 70_000] = [7; 70_000];
        let mut driver = Http2Driver::new(&Options::default());
        frames(&mut driver);
        driver.send(pending(1, &BODY));
        let sent: usize = frames(&mut driver)
            .iter()
            .filter(|f| f.0 == FRAME_DATA)
            .map(|f| {
                assert!(f.3.len() <= DEFAULT_MAX_FRAME_SIZE);
                f.3.len()
            })
            .sum();
        assert_eq!(sent, DEFAULT_WINDOW as usize);

        let mut increment = BytesMut::new();
        increment.put_u32(10_000);
        driver.feed(&server_frame(FRAME_WINDOW_UPDATE, 0, 0, &increment));
        driver.feed(&server_frame(FRAME_WINDOW_UPDATE, 0, 1, &increment));
        let data: Vec<_> = frames(&mut driver)
            .into_iter()
            .filter(|f| f.0 == FRAME_DATA)
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].3.len(), 70_000 - DEFAULT_WINDOW as usize);
        assert_eq!(data[0].1, FLAG_END_STREAM);
    }

    #[test]
    fn test_release_cancels_streams_for_origin() {
        let mut driver = Http2Driver::new(&Options::default());
        driver.send(pending(1, b""));
        let mut other = pending(2, b"");
        other.origin = Origin::new(Scheme::Https, "other.example", 443);
        driver.send(other);
        frames(&mut driver);

        let released = driver.release(&origin());
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, RequestId(1));
        let written = frames(&mut driver);
        assert!(written
            .iter()
            .any(|(t, _, sid, _)| *t == FRAME_RST_STREAM && *sid == 1));
        assert!(!driver.is_empty());
    }

    #[test]
    fn test_eof_fails_open_streams() {
        let mut driver = Http2Driver::new(&Options::default());
        driver.send(pending(1, b""));
        driver.on_eof();
        assert!(matches!(
            events(&mut driver).as_slice(),
            [DriverEvent::Error(_, TransportError::Eof), DriverEvent::Close]
        ));
    }
}
