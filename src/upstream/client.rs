//! One request/response exchange on an upstream connection.
//!
//! Exchanges speak `StreamEvent`s in both directions. `recv` only commits
//! state after an event is complete, so it can sit in a `select!` next to
//! the downstream side and be cancelled without losing bytes.

use std::fmt;

use bytes::{Bytes, BytesMut};
use h2::client::{ResponseFuture, SendRequest};
use h2::SendStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::codec::http2::{self, RecvBody};
use crate::codec::{Codec, Protocol, ProtocolError, RequestHead, ResetReason, ResponseHead, StreamEvent};
use crate::upstream::pool::{ConnectionPool, Http1Connection};
use crate::upstream::UpstreamError;

/// A stream to an upstream host, returned to its pool on drop.
#[derive(Debug)]
pub enum UpstreamStream {
    Http1(Http1Exchange),
    Http2(Http2Exchange),
}

impl UpstreamStream {
    pub fn protocol(&self) -> Protocol {
        match self {
            UpstreamStream::Http1(_) => Protocol::Http1,
            UpstreamStream::Http2(_) => Protocol::Http2,
        }
    }

    /// True when the stream runs on a connection that served earlier requests.
    pub fn is_reused(&self) -> bool {
        match self {
            UpstreamStream::Http1(x) => x.reused,
            UpstreamStream::Http2(x) => x.reused,
        }
    }

    /// True once any response byte (HTTP/1) or response headers (HTTP/2)
    /// arrived.
    pub fn response_seen(&self) -> bool {
        match self {
            UpstreamStream::Http1(x) => x.response_bytes,
            UpstreamStream::Http2(x) => x.response_started,
        }
    }

    pub async fn send(&mut self, event: StreamEvent<RequestHead>) -> Result<(), UpstreamError> {
        match self {
            UpstreamStream::Http1(x) => x.send(event).await,
            UpstreamStream::Http2(x) => x.send(event).await,
        }
    }

    /// Next response event. Failures arrive as a `Reset` event; `None`
    /// follows the end of the response.
    pub async fn recv(&mut self) -> Option<StreamEvent<ResponseHead>> {
        match self {
            UpstreamStream::Http1(x) => x.recv().await,
            UpstreamStream::Http2(x) => x.recv().await,
        }
    }

    /// Abandon the exchange. An HTTP/1 connection is closed; an HTTP/2
    /// stream is reset.
    pub fn reset(&mut self, reason: ResetReason) {
        match self {
            UpstreamStream::Http1(x) => x.reset(),
            UpstreamStream::Http2(x) => x.reset(reason),
        }
    }
}

/// Exchange on an exclusively owned HTTP/1 connection.
pub struct Http1Exchange {
    pool: ConnectionPool,
    conn: Option<Http1Connection>,
    write_buf: BytesMut,
    reused: bool,
    response_bytes: bool,
    finished: bool,
}

impl Http1Exchange {
    pub(crate) fn new(pool: ConnectionPool, conn: Http1Connection, reused: bool) -> Self {
        Self {
            pool,
            conn: Some(conn),
            write_buf: BytesMut::new(),
            reused,
            response_bytes: false,
            finished: false,
        }
    }

    async fn send(&mut self, event: StreamEvent<RequestHead>) -> Result<(), UpstreamError> {
        if matches!(event, StreamEvent::Reset(_)) {
            self.reset();
            return Ok(());
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or(UpstreamError::Reset(ResetReason::LocalReset))?;
        conn.codec.encode(event, &mut self.write_buf)?;
        if !self.write_buf.is_empty() {
            let written = conn.io.write_all(&self.write_buf).await;
            self.write_buf.clear();
            written?;
            conn.io.flush().await?;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<StreamEvent<ResponseHead>> {
        if self.finished {
            return None;
        }
        let conn = self.conn.as_mut()?;
        loop {
            match conn.codec.decode(&mut conn.read_buf) {
                Ok(Some(event)) => {
                    self.finished = event.is_end_stream();
                    return Some(event);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(connection = conn.id, error = %e, "Malformed upstream response");
                    return Some(self.fail(ResetReason::ProtocolError));
                }
            }

            match conn.io.read_buf(&mut conn.read_buf).await {
                Ok(0) => {
                    return match conn.codec.decode_eof(&mut conn.read_buf) {
                        Ok(Some(event)) => {
                            self.finished = event.is_end_stream();
                            Some(event)
                        }
                        Ok(None) | Err(ProtocolError::UnexpectedEof) => {
                            Some(self.fail(ResetReason::ConnectionTermination))
                        }
                        Err(_) => Some(self.fail(ResetReason::ProtocolError)),
                    };
                }
                Ok(_) => self.response_bytes = true,
                Err(e) => {
                    debug!(connection = conn.id, error = %e, "Upstream read failed");
                    return Some(self.fail(ResetReason::ConnectionTermination));
                }
            }
        }
    }

    fn fail(&mut self, reason: ResetReason) -> StreamEvent<ResponseHead> {
        self.finished = true;
        if let Some(conn) = self.conn.as_mut() {
            conn.codec.poison();
        }
        StreamEvent::Reset(reason)
    }

    fn reset(&mut self) {
        self.finished = true;
        if let Some(conn) = self.conn.take() {
            self.pool.release_http1(conn, false);
        }
    }
}

impl Drop for Http1Exchange {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let reusable = self.finished && conn.codec.is_reusable();
            self.pool.release_http1(conn, reusable);
        }
    }
}

impl fmt::Debug for Http1Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Exchange")
            .field("conn", &self.conn)
            .field("reused", &self.reused)
            .field("finished", &self.finished)
            .finish()
    }
}

/// One stream on a multiplexed HTTP/2 connection.
pub struct Http2Exchange {
    pool: ConnectionPool,
    conn_id: u64,
    sender: Option<SendRequest<Bytes>>,
    request_body: Option<SendStream<Bytes>>,
    response: Option<ResponseFuture>,
    body: Option<RecvBody>,
    reused: bool,
    response_started: bool,
    finished: bool,
}

impl Http2Exchange {
    pub(crate) fn new(
        pool: ConnectionPool,
        conn_id: u64,
        sender: SendRequest<Bytes>,
        reused: bool,
    ) -> Self {
        Self {
            pool,
            conn_id,
            sender: Some(sender),
            request_body: None,
            response: None,
            body: None,
            reused,
            response_started: false,
            finished: false,
        }
    }

    async fn send(&mut self, event: StreamEvent<RequestHead>) -> Result<(), UpstreamError> {
        match event {
            StreamEvent::Headers { head, end_stream } => {
                let mut sender = self
                    .sender
                    .take()
                    .ok_or(UpstreamError::Protocol(ProtocolError::AfterEndStream))?;
                let authority = self.pool.addr().to_string();
                let request = http2::build_request(head, &authority)?;
                let (response, stream) = sender
                    .send_request(request, end_stream)
                    .map_err(|e| UpstreamError::Reset(http2::reset_reason(&e)))?;
                self.response = Some(response);
                self.request_body = Some(stream);
                Ok(())
            }
            event => {
                let stream = self
                    .request_body
                    .as_mut()
                    .ok_or(UpstreamError::Protocol(ProtocolError::Malformed("data before headers")))?;
                http2::send_event(stream, event)
                    .await
                    .map_err(|e| UpstreamError::Reset(http2::reset_reason(&e)))
            }
        }
    }

    async fn recv(&mut self) -> Option<StreamEvent<ResponseHead>> {
        if self.finished {
            return None;
        }
        if let Some(response) = self.response.as_mut() {
            let result = response.await;
            self.response = None;
            return match result {
                Ok(response) => {
                    self.response_started = true;
                    let (parts, recv) = response.into_parts();
                    let end_stream = recv.is_end_stream();
                    let mut body = RecvBody::new(recv);
                    if end_stream {
                        body.mark_finished();
                        self.finished = true;
                    }
                    self.body = Some(body);
                    Some(StreamEvent::Headers {
                        head: http2::response_head(parts),
                        end_stream,
                    })
                }
                Err(e) => {
                    self.finished = true;
                    Some(StreamEvent::Reset(http2::reset_reason(&e)))
                }
            };
        }
        let Some(body) = self.body.as_mut() else {
            // Nothing requested yet.
            return std::future::pending().await;
        };
        let event = body.next_event().await;
        match &event {
            Some(StreamEvent::Data { bytes, end_stream }) => {
                body.release(bytes.len());
                self.finished = *end_stream;
            }
            _ => self.finished = true,
        }
        event
    }

    fn reset(&mut self, reason: ResetReason) {
        self.finished = true;
        if let Some(stream) = self.request_body.as_mut() {
            stream.send_reset(http2::h2_reason(reason));
        }
        self.response = None;
        self.body = None;
    }
}

impl Drop for Http2Exchange {
    fn drop(&mut self) {
        self.pool.finish_stream(self.conn_id, false);
    }
}

impl fmt::Debug for Http2Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Exchange")
            .field("conn_id", &self.conn_id)
            .field("reused", &self.reused)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::pool::PoolSettings;
    use crate::upstream::{BoxedIo, Connector};
    use futures_util::future::BoxFuture;
    use http::{Method, Response, StatusCode};
    use std::io;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;

    #[derive(Debug)]
    struct OneShot(Mutex<Option<DuplexStream>>);

    impl Connector for OneShot {
        fn connect(&self, _addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedIo>> {
            let io = self.0.lock().unwrap().take();
            Box::pin(async move {
                io.map(|io| Box::new(io) as BoxedIo)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
            })
        }
    }

    fn pool(protocol: Protocol) -> (ConnectionPool, DuplexStream) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let settings = PoolSettings {
            protocol,
            ..PoolSettings::default()
        };
        let pool = ConnectionPool::new(
            "test",
            "127.0.0.1:9000".parse().unwrap(),
            settings,
            Arc::new(OneShot(Mutex::new(Some(near)))),
        );
        (pool, far)
    }

    fn post(end_stream: bool) -> StreamEvent<RequestHead> {
        StreamEvent::Headers {
            head: RequestHead::new(Method::POST, Some("backend".into()), "/upload"),
            end_stream,
        }
    }

    #[tokio::test]
    async fn http1_streams_request_and_response() {
        let (pool, mut peer) = pool(Protocol::Http1);
        let mut stream = pool.acquire().await.unwrap();
        let mut head = RequestHead::new(Method::POST, Some("backend".into()), "/upload");
        head.headers.insert(http::header::CONTENT_LENGTH, "5".parse().unwrap());
        stream
            .send(StreamEvent::Headers { head, end_stream: false })
            .await
            .unwrap();
        stream
            .send(StreamEvent::Data { bytes: Bytes::from_static(b"hello"), end_stream: true })
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let mut got = Vec::new();
        while !got.ends_with(b"hello") {
            let n = peer.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8(got).unwrap();
        assert!(text.starts_with("POST /upload HTTP/1.1\r\nhost: backend\r\n"));

        peer.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await.unwrap();
        match stream.recv().await {
            Some(StreamEvent::Headers { head, end_stream: false }) => {
                assert_eq!(head.status, StatusCode::OK)
            }
            other => panic!("unexpected {other:?}"),
        }
        match stream.recv().await {
            Some(StreamEvent::Data { bytes, end_stream: true }) => assert_eq!(&bytes[..], b"ok"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(stream.recv().await.is_none());
        assert!(stream.response_seen());
        drop(stream);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn http1_disconnect_before_headers_is_reset() {
        let (pool, peer) = pool(Protocol::Http1);
        let mut stream = pool.acquire().await.unwrap();
        stream.send(post(true)).await.unwrap();
        drop(peer);
        assert!(matches!(
            stream.recv().await,
            Some(StreamEvent::Reset(ResetReason::ConnectionTermination))
        ));
        assert!(!stream.response_seen());
        drop(stream);
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn http2_exchange_round_trip() {
        let (pool, peer) = pool(Protocol::Http2);
        let server = tokio::spawn(async move {
            let mut conn = h2::server::handshake(peer).await.unwrap();
            let (request, mut respond) = conn.accept().await.unwrap().unwrap();
            assert_eq!(request.uri().path(), "/upload");
            assert_eq!(request.uri().authority().unwrap().as_str(), "backend");
            let mut body = request.into_body();
            let chunk = body.data().await.unwrap().unwrap();
            assert_eq!(&chunk[..], b"abc");
            let mut send = respond
                .send_response(Response::builder().status(201).body(()).unwrap(), false)
                .unwrap();
            send.send_data(Bytes::from_static(b"done"), true).unwrap();
            // Keep the connection alive until the client hangs up.
            while conn.accept().await.is_some() {}
        });

        let mut stream = pool.acquire().await.unwrap();
        assert_eq!(stream.protocol(), Protocol::Http2);
        stream.send(post(false)).await.unwrap();
        stream
            .send(StreamEvent::Data { bytes: Bytes::from_static(b"abc"), end_stream: true })
            .await
            .unwrap();

        match stream.recv().await {
            Some(StreamEvent::Headers { head, end_stream: false }) => {
                assert_eq!(head.status, StatusCode::CREATED)
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut body = Vec::new();
        while let Some(event) = stream.recv().await {
            match event {
                StreamEvent::Data { bytes, .. } => body.extend_from_slice(&bytes),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(body, b"done");
        assert_eq!(pool.stats().multiplexed, 1);
        drop(stream);
        pool.drain_connections();
        server.await.unwrap();
    }
}
