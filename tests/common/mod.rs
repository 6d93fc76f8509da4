//! Shared test utilities.
//!
//! Fake upstreams listen on ephemeral ports and record what they receive.
//! The proxy is started from a `ProxyConfig` built in the test.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use edge_proxy::codec::Protocol;
use edge_proxy::config::{ClusterConfig, ListenerConfig, RouteConfig};
use edge_proxy::net::ConnectionTracker;
use edge_proxy::proxy::ProxyContext;
use edge_proxy::upstream::TcpConnector;
use edge_proxy::{HttpServer, ProxyConfig, Shutdown};
use http::HeaderMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const LISTENER: &str = "test";
pub const CLUSTER: &str = "backend";

/// A running proxy bound to an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub ctx: Arc<ProxyContext>,
    pub connections: ConnectionTracker,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<()>,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn drain(&self) {
        self.ctx.start_draining();
    }
}

pub fn listener(protocol: Protocol) -> ListenerConfig {
    ListenerConfig {
        name: LISTENER.to_string(),
        bind_address: "127.0.0.1:0".to_string(),
        protocol,
        ..ListenerConfig::default()
    }
}

pub fn cluster(protocol: Protocol, hosts: &[SocketAddr]) -> ClusterConfig {
    ClusterConfig {
        name: CLUSTER.to_string(),
        protocol,
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        connect_timeout_ms: 1000,
        ..ClusterConfig::default()
    }
}

pub fn route(prefix: &str) -> RouteConfig {
    RouteConfig {
        name: "default".to_string(),
        host: None,
        path_prefix: Some(prefix.to_string()),
        cluster: CLUSTER.to_string(),
        priority: 0,
        require_host: false,
        allow_connect: false,
        https_redirect: false,
        retry: None,
    }
}

/// One listener, one cluster, one catch-all route.
pub fn single_route_config(
    downstream: Protocol,
    upstream: Protocol,
    hosts: &[SocketAddr],
) -> ProxyConfig {
    ProxyConfig {
        listeners: vec![listener(downstream)],
        clusters: vec![cluster(upstream, hosts)],
        routes: vec![route("/")],
        ..ProxyConfig::default()
    }
}

pub async fn start_proxy(mut config: ProxyConfig) -> TestProxy {
    config.drain.timeout_secs = 2;
    let server = HttpServer::bind(&config, Arc::new(TcpConnector))
        .await
        .expect("bind proxy");
    let addr = server.local_addr(LISTENER).expect("listener address");
    let ctx = server.context();
    let connections = server.connections();
    let shutdown = Shutdown::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            server.run(shutdown).await.expect("proxy run");
        })
    };
    TestProxy {
        addr,
        ctx,
        connections,
        shutdown,
        handle,
    }
}

/// An address nothing is listening on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

// ---------------------------------------------------------------------------
// HTTP/1 upstream
// ---------------------------------------------------------------------------

/// A request as seen by a fake upstream.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub head: String,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

/// What a fake HTTP/1 upstream does with a request.
pub enum Action {
    /// Write the bytes and keep the connection open.
    Respond(Vec<u8>),
    /// Write the bytes and close the connection.
    RespondAndClose(Vec<u8>),
}

pub fn response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\ncontent-length: {}\r\n\r\n{}",
        status,
        body.len(),
        body
    )
    .into_bytes()
}

pub struct Http1Backend {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Http1Backend {
    pub fn recorded(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

/// Start a backend that always answers with the same bytes.
pub async fn start_mock_backend(response: Vec<u8>) -> Http1Backend {
    start_programmable_backend(move |_, _| Action::Respond(response.clone())).await
}

/// Start a backend whose answer depends on the request index and content.
pub async fn start_programmable_backend<F>(handler: F) -> Http1Backend
where
    F: Fn(usize, &Recorded) -> Action + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);
    {
        let requests = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let requests = Arc::clone(&requests);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    serve_http1(socket, requests, handler).await;
                });
            }
        });
    }
    Http1Backend { addr, requests }
}

async fn serve_http1<F>(
    mut socket: TcpStream,
    requests: Arc<Mutex<Vec<Recorded>>>,
    handler: Arc<F>,
) where
    F: Fn(usize, &Recorded) -> Action + Send + Sync + 'static,
{
    let mut buf = Vec::new();
    loop {
        let Some(recorded) = read_request(&mut socket, &mut buf).await else {
            return;
        };
        let index = {
            let mut requests = requests.lock().unwrap();
            requests.push(recorded.clone());
            requests.len() - 1
        };
        match handler(index, &recorded) {
            Action::Respond(bytes) => {
                if socket.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Action::RespondAndClose(bytes) => {
                let _ = socket.write_all(&bytes).await;
                let _ = socket.shutdown().await;
                return;
            }
        }
    }
}

/// Read one request with a content-length or chunked body.
async fn read_request(socket: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Recorded> {
    let head_end = loop {
        if let Some(pos) = find(buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if !fill(socket, buf).await {
            return None;
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    buf.drain(..head_end);
    let recorded = Recorded {
        head,
        body: Vec::new(),
    };

    let body = if recorded
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        read_chunked(socket, buf).await?
    } else {
        let len: usize = recorded
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        while buf.len() < len {
            if !fill(socket, buf).await {
                return None;
            }
        }
        buf.drain(..len).collect()
    };
    Some(Recorded { body, ..recorded })
}

async fn read_chunked(socket: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(pos) = find(buf, b"\r\n") {
                break pos;
            }
            if !fill(socket, buf).await {
                return None;
            }
        };
        let line = String::from_utf8_lossy(&buf[..line_end]).to_string();
        let size = usize::from_str_radix(line.split(';').next()?.trim(), 16).ok()?;
        buf.drain(..line_end + 2);
        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                if let Some(pos) = find(buf, b"\r\n") {
                    let empty = pos == 0;
                    buf.drain(..pos + 2);
                    if empty {
                        return Some(body);
                    }
                    continue;
                }
                if !fill(socket, buf).await {
                    return None;
                }
            }
        }
        while buf.len() < size + 2 {
            if !fill(socket, buf).await {
                return None;
            }
        }
        body.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
    }
}

async fn fill(socket: &mut TcpStream, buf: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 4096];
    match socket.read(&mut chunk).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            true
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Plain TCP echo server for tunnel tests.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// What a [`start_partial_backend`] upstream does after its partial answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterPartial {
    /// Keep the connection open until the proxy closes it.
    Hold,
    /// Hang up straight away.
    Close,
}

/// HTTP/1 backend that never finishes its response.
pub struct PartialBackend {
    pub addr: SocketAddr,
    /// Signalled when the proxy closes a held connection.
    pub torn_down: tokio::sync::mpsc::UnboundedReceiver<()>,
}

/// Answer every request with `partial`, then hold or close the connection.
pub async fn start_partial_backend(partial: Vec<u8>, after: AfterPartial) -> PartialBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, torn_down) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let partial = partial.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if read_request(&mut socket, &mut buf).await.is_none() {
                    return;
                }
                if socket.write_all(&partial).await.is_err() || after == AfterPartial::Close {
                    return;
                }
                let mut chunk = [0u8; 1024];
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                let _ = tx.send(());
            });
        }
    });
    PartialBackend { addr, torn_down }
}

/// Response head announcing `length` body bytes followed by `sent` of them.
pub fn partial_response(length: usize, sent: usize) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 200 OK\r\ncontent-length: {length}\r\n\r\n").into_bytes();
    out.extend(std::iter::repeat(b'x').take(sent));
    out
}

// ---------------------------------------------------------------------------
// HTTP/2 upstream
// ---------------------------------------------------------------------------

/// A stream as seen by the fake HTTP/2 upstream.
#[derive(Debug, Clone)]
pub struct H2Recorded {
    pub path: String,
    pub body: Vec<u8>,
    pub trailers: Option<HeaderMap>,
}

/// Start an HTTP/2 backend that echoes the body and trailers back with a 200.
pub async fn start_h2_echo_backend() -> (SocketAddr, Arc<Mutex<Vec<H2Recorded>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded = Arc::new(Mutex::new(Vec::new()));
    {
        let recorded = Arc::clone(&recorded);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let Ok(mut conn) = h2::server::handshake(socket).await else {
                        return;
                    };
                    while let Some(Ok((request, respond))) = conn.accept().await {
                        let recorded = Arc::clone(&recorded);
                        tokio::spawn(echo_h2_stream(request, respond, recorded));
                    }
                });
            }
        });
    }
    (addr, recorded)
}

async fn echo_h2_stream(
    request: http::Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
    recorded: Arc<Mutex<Vec<H2Recorded>>>,
) {
    let path = request.uri().path().to_string();
    let mut recv = request.into_body();
    let mut body = Vec::new();
    while let Some(chunk) = recv.data().await {
        let Ok(chunk) = chunk else { return };
        let _ = recv.flow_control().release_capacity(chunk.len());
        body.extend_from_slice(&chunk);
    }
    let trailers = recv.trailers().await.ok().flatten();
    recorded.lock().unwrap().push(H2Recorded {
        path,
        body: body.clone(),
        trailers: trailers.clone(),
    });

    let response = http::Response::builder().status(200).body(()).unwrap();
    let Ok(mut send) = respond.send_response(response, false) else {
        return;
    };
    let _ = send.send_data(Bytes::from(body), trailers.is_none());
    if let Some(trailers) = trailers {
        let _ = send.send_trailers(trailers);
    }
}

// ---------------------------------------------------------------------------
// Raw HTTP/1 client
// ---------------------------------------------------------------------------

/// Write `request` and read until the proxy closes the connection.
pub async fn send_raw(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    read_to_close(&mut stream).await
}

pub async fn read_to_close(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("proxy did not close the connection")
        .ok();
    String::from_utf8_lossy(&out).to_string()
}

/// Read one content-length delimited response from a kept-alive connection.
pub async fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        let head_end = loop {
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos + 4;
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-response");
            buf.extend_from_slice(&chunk[..n]);
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
        let len: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .map(|v| v.trim().parse().unwrap())
            .unwrap_or(0);
        while buf.len() < head_end + len {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-body");
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await;
    result.expect("timed out waiting for response");
    String::from_utf8_lossy(&buf).to_string()
}

/// Open an HTTP/2 client connection to the proxy.
pub async fn h2_client(addr: SocketAddr) -> h2::client::SendRequest<Bytes> {
    let socket = TcpStream::connect(addr).await.unwrap();
    let (client, connection) = h2::client::handshake(socket).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client.ready().await.unwrap()
}
