//! HTTP/1.x codec built on `httparse`.
//!
//! `ServerCodec` decodes requests and encodes responses on downstream
//! connections; `ClientCodec` does the reverse for pooled upstream
//! connections. Both are sans-io: they only see `BytesMut` buffers.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};

use super::framing::{self, content_length, is_chunked};
use super::{Codec, ProtocolError, RequestHead, ResponseHead, StreamEvent};

/// Maximum number of header fields accepted in one message.
const MAX_HEADERS: usize = 128;

/// Longest chunk-size line accepted, extensions included.
const MAX_CHUNK_LINE: usize = 1024;

/// Methods recognised on the request line.
const KNOWN_METHODS: &[&[u8]] = &[
    b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"CONNECT", b"OPTIONS", b"TRACE", b"PATCH",
];

/// Listener-level knobs for the request parser.
#[derive(Debug, Clone)]
pub struct Http1Settings {
    pub max_header_bytes: usize,
    pub allow_absolute_url: bool,
    pub accept_http_10: bool,
    pub default_host_for_http_10: Option<String>,
}

impl Default for Http1Settings {
    fn default() -> Self {
        Self {
            max_header_bytes: 60 * 1024,
            allow_absolute_url: false,
            accept_http_10: false,
            default_host_for_http_10: None,
        }
    }
}

// ============================================================================
// Body framing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataCrlf,
    Trailers,
}

/// Incoming body framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyDecoder {
    Length(u64),
    Chunked(ChunkState),
    /// Ends when the peer closes.
    CloseDelimited,
    /// Raw bytes after a CONNECT.
    Tunnel,
}

impl BodyDecoder {
    fn for_length(n: u64) -> Option<Self> {
        (n > 0).then_some(BodyDecoder::Length(n))
    }

    /// Next body chunk and whether it ends the body.
    fn decode(
        &mut self,
        src: &mut BytesMut,
        max_trailer_bytes: usize,
    ) -> Result<Option<(Bytes, bool)>, ProtocolError> {
        loop {
            match self {
                BodyDecoder::Length(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = (*remaining).min(src.len() as u64) as usize;
                    *remaining -= take as u64;
                    let bytes = src.split_to(take).freeze();
                    return Ok(Some((bytes, *remaining == 0)));
                }
                BodyDecoder::CloseDelimited | BodyDecoder::Tunnel => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let bytes = src.split().freeze();
                    return Ok(Some((bytes, false)));
                }
                BodyDecoder::Chunked(state) => match *state {
                    ChunkState::Size => {
                        let Some(line_end) = find_crlf(&src[..]) else {
                            if src.len() > MAX_CHUNK_LINE {
                                return Err(ProtocolError::InvalidChunk);
                            }
                            return Ok(None);
                        };
                        let size = parse_chunk_size(&src[..line_end])?;
                        src.advance(line_end + 2);
                        *state = if size == 0 {
                            ChunkState::Trailers
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                    ChunkState::Data(remaining) => {
                        if src.is_empty() {
                            return Ok(None);
                        }
                        let take = remaining.min(src.len() as u64) as usize;
                        let left = remaining - take as u64;
                        *state = if left == 0 {
                            ChunkState::DataCrlf
                        } else {
                            ChunkState::Data(left)
                        };
                        return Ok(Some((src.split_to(take).freeze(), false)));
                    }
                    ChunkState::DataCrlf => {
                        if src.len() < 2 {
                            return Ok(None);
                        }
                        if &src[..2] != b"\r\n" {
                            return Err(ProtocolError::InvalidChunk);
                        }
                        src.advance(2);
                        *state = ChunkState::Size;
                    }
                    ChunkState::Trailers => {
                        // Trailer fields have no HTTP/1 consumer and are dropped.
                        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                        match httparse::parse_headers(&src[..], &mut headers) {
                            Ok(httparse::Status::Complete((n, _))) => {
                                src.advance(n);
                                return Ok(Some((Bytes::new(), true)));
                            }
                            Ok(httparse::Status::Partial) => {
                                if src.len() > max_trailer_bytes {
                                    return Err(ProtocolError::HeadersTooLarge {
                                        limit: max_trailer_bytes,
                                    });
                                }
                                return Ok(None);
                            }
                            Err(_) => return Err(ProtocolError::Malformed("trailer section")),
                        }
                    }
                },
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<(Bytes, bool)>, ProtocolError> {
        match self {
            BodyDecoder::CloseDelimited | BodyDecoder::Tunnel => {
                let bytes = src.split().freeze();
                Ok(Some((bytes, true)))
            }
            _ => Err(ProtocolError::UnexpectedEof),
        }
    }
}

/// Outgoing body framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyEncoder {
    Length,
    Chunked,
    /// Written as-is; the connection close ends it.
    Raw,
    /// HEAD responses and bodiless statuses.
    Empty,
}

impl BodyEncoder {
    fn data(&self, bytes: &[u8], end_stream: bool, dst: &mut BytesMut) {
        match self {
            BodyEncoder::Length | BodyEncoder::Raw => dst.extend_from_slice(bytes),
            BodyEncoder::Chunked => {
                if !bytes.is_empty() {
                    dst.extend_from_slice(format!("{:x}\r\n", bytes.len()).as_bytes());
                    dst.extend_from_slice(bytes);
                    dst.extend_from_slice(b"\r\n");
                }
                if end_stream {
                    dst.extend_from_slice(b"0\r\n\r\n");
                }
            }
            BodyEncoder::Empty => {}
        }
    }

    fn finish(&self, dst: &mut BytesMut) {
        if *self == BodyEncoder::Chunked {
            dst.extend_from_slice(b"0\r\n\r\n");
        }
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ProtocolError> {
    let size = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or_default();
    let size = std::str::from_utf8(size)
        .map_err(|_| ProtocolError::InvalidChunk)?
        .trim();
    if size.is_empty() {
        return Err(ProtocolError::InvalidChunk);
    }
    u64::from_str_radix(size, 16).map_err(|_| ProtocolError::InvalidChunk)
}

/// Reject a request line as soon as its method cannot be a known one.
fn check_method_prefix(src: &[u8]) -> Result<(), ProtocolError> {
    let token_end = src.iter().position(|&b| b == b' ');
    let token = &src[..token_end.unwrap_or(src.len())];
    let plausible = match token_end {
        Some(_) => KNOWN_METHODS.iter().any(|m| *m == token),
        None => KNOWN_METHODS.iter().any(|m| m.starts_with(token)),
    };
    if plausible {
        Ok(())
    } else {
        Err(ProtocolError::Malformed("request method"))
    }
}

fn owned_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, ProtocolError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| ProtocolError::Malformed("header name"))?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|_| ProtocolError::Malformed("header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn map_parse_error(err: httparse::Error, limit: usize) -> ProtocolError {
    match err {
        httparse::Error::TooManyHeaders => ProtocolError::HeadersTooLarge { limit },
        httparse::Error::Version => ProtocolError::Malformed("protocol version"),
        httparse::Error::HeaderName | httparse::Error::HeaderValue => {
            ProtocolError::Malformed("header line")
        }
        _ => ProtocolError::Malformed("start line"),
    }
}

fn write_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

fn skip_empty_lines(src: &mut BytesMut) {
    let n = src.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
    src.advance(n);
}

// ============================================================================
// Downstream side
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Head,
    Body(BodyDecoder),
    /// Request fully read; waiting for the response to finish.
    Done,
}

/// Decodes requests and encodes responses for one downstream connection.
#[derive(Debug)]
pub struct ServerCodec {
    settings: Http1Settings,
    read: ReadState,
    /// Framing of the response being written, once its head is out.
    write: Option<BodyEncoder>,
    request_version: Version,
    request_is_head: bool,
    request_is_connect: bool,
    close_after_response: bool,
    response_done: bool,
}

impl ServerCodec {
    pub fn new(settings: Http1Settings) -> Self {
        Self {
            settings,
            read: ReadState::Head,
            write: None,
            request_version: Version::HTTP_11,
            request_is_head: false,
            request_is_connect: false,
            close_after_response: false,
            response_done: false,
        }
    }

    /// Make the next response carry `connection: close`.
    pub fn force_close(&mut self) {
        self.close_after_response = true;
    }

    /// True once the connection must be closed after pending writes.
    pub fn is_closing(&self) -> bool {
        self.close_after_response && self.response_done
    }

    /// True while the request body is still being read.
    pub fn request_in_progress(&self) -> bool {
        matches!(self.read, ReadState::Body(_))
    }

    /// True between exchanges, with no request bytes consumed yet.
    pub fn is_idle(&self) -> bool {
        self.read == ReadState::Head && self.write.is_none()
    }

    /// True once a response head has been encoded for the current exchange.
    pub fn response_started(&self) -> bool {
        self.write.is_some()
    }

    /// True while a CONNECT tunnel is relaying raw bytes.
    pub fn is_tunnel(&self) -> bool {
        self.request_is_connect && self.write == Some(BodyEncoder::Raw)
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<RequestHead>, ProtocolError> {
        skip_empty_lines(src);
        if src.is_empty() {
            return Ok(None);
        }
        check_method_prefix(&src[..])?;

        let limit = self.settings.max_header_bytes;
        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut raw);
        let consumed = match req.parse(&src[..]) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                if src.len() > limit {
                    return Err(ProtocolError::HeadersTooLarge { limit });
                }
                return Ok(None);
            }
            Err(e) => return Err(map_parse_error(e, limit)),
        };
        if consumed > limit {
            return Err(ProtocolError::HeadersTooLarge { limit });
        }

        let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())
            .map_err(|_| ProtocolError::Malformed("request method"))?;
        let version = match req.version {
            Some(1) => Version::HTTP_11,
            Some(0) => Version::HTTP_10,
            _ => return Err(ProtocolError::Malformed("protocol version")),
        };
        let target = req.path.unwrap_or_default().to_string();
        let mut headers = owned_headers(req.headers)?;
        src.advance(consumed);

        if version == Version::HTTP_10 && !self.settings.accept_http_10 {
            return Err(ProtocolError::UpgradeRequired);
        }

        let mut head = RequestHead {
            method,
            scheme: None,
            authority: None,
            path: target.clone(),
            version,
            headers: HeaderMap::new(),
        };
        let mut authority_from_target = false;

        if head.is_connect() {
            // authority-form
            head.authority = Some(target);
            head.path = String::new();
            authority_from_target = true;
        } else if !target.starts_with('/') && target != "*" {
            let uri: http::Uri = target
                .parse()
                .map_err(|_| ProtocolError::Malformed("request target"))?;
            match (uri.scheme_str(), uri.authority()) {
                (Some(scheme), Some(authority)) if self.settings.allow_absolute_url => {
                    let authority = authority.as_str().to_string();
                    let value = HeaderValue::from_str(&authority)
                        .map_err(|_| ProtocolError::Malformed("request target"))?;
                    headers.insert(header::HOST, value);
                    head.scheme = Some(scheme.to_string());
                    head.path = uri
                        .path_and_query()
                        .map(|p| p.as_str().to_string())
                        .unwrap_or_else(|| "/".to_string());
                    head.authority = Some(authority);
                    authority_from_target = true;
                }
                // Left as-is so it can only match a route explicitly written for it.
                (Some(_), Some(_)) => {}
                _ => return Err(ProtocolError::Malformed("request target")),
            }
        }

        if !authority_from_target {
            match headers.get(header::HOST) {
                Some(host) => {
                    let host = host
                        .to_str()
                        .map_err(|_| ProtocolError::Malformed("host header"))?;
                    head.authority = Some(host.to_string());
                }
                None if version == Version::HTTP_11 => return Err(ProtocolError::MissingHost),
                None => {
                    if let Some(default) = &self.settings.default_host_for_http_10 {
                        let value = HeaderValue::from_str(default)
                            .map_err(|_| ProtocolError::Malformed("host header"))?;
                        headers.insert(header::HOST, value);
                        head.authority = Some(default.clone());
                    }
                }
            }
        }

        let body = if head.is_connect() {
            Some(BodyDecoder::Tunnel)
        } else if is_chunked(&headers)? {
            headers.remove(header::CONTENT_LENGTH);
            Some(BodyDecoder::Chunked(ChunkState::Size))
        } else {
            content_length(&headers)?.and_then(BodyDecoder::for_length)
        };

        self.request_version = version;
        self.request_is_head = head.method == Method::HEAD;
        self.request_is_connect = head.is_connect();
        self.close_after_response |= framing::wants_close(version, &headers);
        self.response_done = false;
        self.read = match body {
            Some(decoder) => ReadState::Body(decoder),
            None => ReadState::Done,
        };
        head.headers = headers;
        Ok(Some(head))
    }

    fn start_response(&mut self, mut head: ResponseHead, end_stream: bool, dst: &mut BytesMut) {
        let status = head.status;
        let bodiless = self.request_is_head
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let tunnel = self.request_is_connect && status.is_success();
        let declared = content_length(&head.headers).ok().flatten();
        framing::strip_hop_by_hop(&mut head.headers);

        let encoder = if tunnel {
            head.headers.remove(header::CONTENT_LENGTH);
            self.close_after_response = true;
            BodyEncoder::Raw
        } else if bodiless {
            BodyEncoder::Empty
        } else if end_stream {
            head.headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            BodyEncoder::Length
        } else if declared.is_some() {
            BodyEncoder::Length
        } else if self.request_version == Version::HTTP_10 {
            self.close_after_response = true;
            BodyEncoder::Raw
        } else {
            head.headers.insert(
                header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            );
            BodyEncoder::Chunked
        };

        // A response that finishes before its request leaves unread bytes behind.
        if end_stream && self.request_in_progress() {
            self.close_after_response = true;
        }

        dst.extend_from_slice(b"HTTP/1.1 ");
        dst.extend_from_slice(status.as_str().as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        dst.extend_from_slice(b"\r\n");
        write_headers(&head.headers, dst);
        if self.close_after_response && !tunnel {
            dst.extend_from_slice(b"connection: close\r\n");
        } else if self.request_version == Version::HTTP_10 && !tunnel {
            dst.extend_from_slice(b"connection: keep-alive\r\n");
        }
        dst.extend_from_slice(b"\r\n");

        if status.is_informational() {
            return;
        }
        self.write = Some(encoder);
        if end_stream {
            self.finish_response();
        }
    }

    fn finish_response(&mut self) {
        self.response_done = true;
        if self.read != ReadState::Done {
            self.close_after_response = true;
        }
        if !self.close_after_response {
            self.read = ReadState::Head;
            self.write = None;
            self.request_is_head = false;
            self.request_is_connect = false;
            self.response_done = false;
        }
    }
}

impl Codec for ServerCodec {
    type Inbound = RequestHead;
    type Outbound = ResponseHead;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<StreamEvent<RequestHead>>, ProtocolError> {
        match self.read {
            ReadState::Head => {
                if self.write.is_some() {
                    return Ok(None);
                }
                let Some(head) = self.decode_head(src)? else {
                    return Ok(None);
                };
                let end_stream = self.read == ReadState::Done;
                Ok(Some(StreamEvent::Headers { head, end_stream }))
            }
            ReadState::Body(mut decoder) => {
                let chunk = decoder.decode(src, self.settings.max_header_bytes)?;
                self.read = ReadState::Body(decoder);
                Ok(chunk.map(|(bytes, end_stream)| {
                    if end_stream {
                        self.read = ReadState::Done;
                    }
                    StreamEvent::Data { bytes, end_stream }
                }))
            }
            ReadState::Done => Ok(None),
        }
    }

    fn decode_eof(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<StreamEvent<RequestHead>>, ProtocolError> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        match self.read {
            ReadState::Done => Ok(None),
            ReadState::Head => {
                skip_empty_lines(src);
                if src.is_empty() {
                    Ok(None)
                } else {
                    Err(ProtocolError::UnexpectedEof)
                }
            }
            ReadState::Body(mut decoder) => {
                let event = decoder.decode_eof(src)?;
                self.read = ReadState::Done;
                Ok(event.map(|(bytes, end_stream)| StreamEvent::Data { bytes, end_stream }))
            }
        }
    }

    fn encode(
        &mut self,
        event: StreamEvent<ResponseHead>,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        match event {
            StreamEvent::Headers { head, end_stream } => {
                if self.write.is_some() {
                    return Err(ProtocolError::AfterEndStream);
                }
                self.start_response(head, end_stream, dst);
            }
            StreamEvent::Data { bytes, end_stream } => {
                let encoder = self.write.ok_or(ProtocolError::Malformed("data before headers"))?;
                if self.response_done {
                    return Err(ProtocolError::AfterEndStream);
                }
                encoder.data(&bytes, end_stream, dst);
                if end_stream {
                    self.finish_response();
                }
            }
            StreamEvent::Trailers(_) => {
                let encoder = self.write.ok_or(ProtocolError::Malformed("trailers before headers"))?;
                encoder.finish(dst);
                self.finish_response();
            }
            StreamEvent::Reset(_) => {
                self.close_after_response = true;
                self.response_done = true;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Upstream side
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseRead {
    /// Nothing expected until a request head is written.
    Idle,
    Head,
    Body(BodyDecoder),
    Done,
}

/// Encodes requests and decodes responses for one pooled upstream connection.
#[derive(Debug)]
pub struct ClientCodec {
    max_header_bytes: usize,
    read: ResponseRead,
    write: Option<BodyEncoder>,
    request_done: bool,
    request_is_head: bool,
    keep_alive: bool,
}

impl ClientCodec {
    pub fn new(max_header_bytes: usize) -> Self {
        Self {
            max_header_bytes,
            read: ResponseRead::Idle,
            write: None,
            request_done: false,
            request_is_head: false,
            keep_alive: true,
        }
    }

    /// True when the last exchange finished cleanly and may be followed by another.
    pub fn is_reusable(&self) -> bool {
        self.keep_alive && self.read == ResponseRead::Idle && self.write.is_none()
    }

    /// True once a response has been fully read.
    pub fn response_complete(&self) -> bool {
        self.read == ResponseRead::Done || self.read == ResponseRead::Idle
    }

    /// Mark the connection as unusable for further exchanges.
    pub fn poison(&mut self) {
        self.keep_alive = false;
    }

    fn maybe_recycle(&mut self) {
        if self.request_done && self.read == ResponseRead::Done {
            self.read = ResponseRead::Idle;
            self.write = None;
            self.request_done = false;
        }
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<ResponseHead>, ProtocolError> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }
            let limit = self.max_header_bytes;
            let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut res = httparse::Response::new(&mut raw);
            let consumed = match res.parse(&src[..]) {
                Ok(httparse::Status::Complete(n)) => n,
                Ok(httparse::Status::Partial) => {
                    if src.len() > limit {
                        return Err(ProtocolError::HeadersTooLarge { limit });
                    }
                    return Ok(None);
                }
                Err(e) => return Err(map_parse_error(e, limit)),
            };
            let status = StatusCode::from_u16(res.code.unwrap_or_default())
                .map_err(|_| ProtocolError::Malformed("status code"))?;
            let version = match res.version {
                Some(0) => Version::HTTP_10,
                _ => Version::HTTP_11,
            };
            let headers = owned_headers(res.headers)?;
            src.advance(consumed);

            // Interim responses are not forwarded.
            if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                continue;
            }

            if framing::wants_close(version, &headers) {
                self.keep_alive = false;
            }
            let bodiless = self.request_is_head
                || status == StatusCode::NO_CONTENT
                || status == StatusCode::NOT_MODIFIED;
            let body = if bodiless {
                None
            } else if is_chunked(&headers)? {
                Some(BodyDecoder::Chunked(ChunkState::Size))
            } else {
                match content_length(&headers)? {
                    Some(n) => BodyDecoder::for_length(n),
                    None => {
                        self.keep_alive = false;
                        Some(BodyDecoder::CloseDelimited)
                    }
                }
            };
            self.read = match body {
                Some(decoder) => ResponseRead::Body(decoder),
                None => ResponseRead::Done,
            };
            return Ok(Some(ResponseHead { status, headers }));
        }
    }
}

impl Codec for ClientCodec {
    type Inbound = ResponseHead;
    type Outbound = RequestHead;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<StreamEvent<ResponseHead>>, ProtocolError> {
        match self.read {
            ResponseRead::Idle => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    Err(ProtocolError::Malformed("unsolicited response"))
                }
            }
            ResponseRead::Head => {
                let Some(head) = self.decode_head(src)? else {
                    return Ok(None);
                };
                let end_stream = self.read == ResponseRead::Done;
                if end_stream {
                    self.maybe_recycle();
                }
                Ok(Some(StreamEvent::Headers { head, end_stream }))
            }
            ResponseRead::Body(mut decoder) => {
                let chunk = decoder.decode(src, self.max_header_bytes)?;
                self.read = ResponseRead::Body(decoder);
                match chunk {
                    Some((bytes, end_stream)) => {
                        if end_stream {
                            self.read = ResponseRead::Done;
                            self.maybe_recycle();
                        }
                        Ok(Some(StreamEvent::Data { bytes, end_stream }))
                    }
                    None => Ok(None),
                }
            }
            ResponseRead::Done => Ok(None),
        }
    }

    fn decode_eof(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<StreamEvent<ResponseHead>>, ProtocolError> {
        self.keep_alive = false;
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        match self.read {
            ResponseRead::Body(mut decoder) => {
                let event = decoder.decode_eof(src)?;
                self.read = ResponseRead::Done;
                Ok(event.map(|(bytes, end_stream)| StreamEvent::Data { bytes, end_stream }))
            }
            ResponseRead::Head => Err(ProtocolError::UnexpectedEof),
            _ => Ok(None),
        }
    }

    fn encode(
        &mut self,
        event: StreamEvent<RequestHead>,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        match event {
            StreamEvent::Headers { mut head, end_stream } => {
                if self.read != ResponseRead::Idle {
                    return Err(ProtocolError::AfterEndStream);
                }
                let declared = content_length(&head.headers)?;
                framing::strip_hop_by_hop(&mut head.headers);
                head.headers.remove(header::HOST);

                let encoder = if end_stream {
                    if declared.is_none()
                        && matches!(head.method, Method::POST | Method::PUT | Method::PATCH)
                    {
                        head.headers
                            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                    }
                    BodyEncoder::Length
                } else if declared.is_some() {
                    BodyEncoder::Length
                } else {
                    head.headers.insert(
                        header::TRANSFER_ENCODING,
                        HeaderValue::from_static("chunked"),
                    );
                    BodyEncoder::Chunked
                };

                dst.extend_from_slice(head.method.as_str().as_bytes());
                dst.extend_from_slice(b" ");
                dst.extend_from_slice(if head.path.is_empty() { "/" } else { &head.path }.as_bytes());
                dst.extend_from_slice(b" HTTP/1.1\r\n");
                if let Some(authority) = &head.authority {
                    dst.extend_from_slice(b"host: ");
                    dst.extend_from_slice(authority.as_bytes());
                    dst.extend_from_slice(b"\r\n");
                }
                write_headers(&head.headers, dst);
                dst.extend_from_slice(b"\r\n");

                self.request_is_head = head.method == Method::HEAD;
                self.read = ResponseRead::Head;
                self.write = Some(encoder);
                self.request_done = end_stream;
            }
            StreamEvent::Data { bytes, end_stream } => {
                let encoder = self.write.ok_or(ProtocolError::Malformed("data before headers"))?;
                if self.request_done {
                    return Err(ProtocolError::AfterEndStream);
                }
                encoder.data(&bytes, end_stream, dst);
                if end_stream {
                    self.request_done = true;
                    self.maybe_recycle();
                }
            }
            StreamEvent::Trailers(_) => {
                let encoder = self.write.ok_or(ProtocolError::Malformed("trailers before headers"))?;
                encoder.finish(dst);
                self.request_done = true;
                self.maybe_recycle();
            }
            StreamEvent::Reset(_) => {
                self.keep_alive = false;
            }
        }
        Ok(())
    }
}
