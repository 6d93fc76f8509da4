//! Per-request router and retry state machine.
//!
//! # Responsibilities
//! - Match the request to a route and answer locally when none fits
//! - Acquire an upstream stream and replay the request onto it
//! - Retry connect failures, early resets and retriable responses while
//!   no response byte has gone downstream
//! - Propagate resets in both directions once the window has closed
//!
//! # Design Decisions
//! - Request events not yet accepted by the current attempt wait in a
//!   queue bounded by the listener buffer limit
//! - The replay buffer lives in `RetryState`; overflowing it ends retries
//!   but not the request
//! - A reused connection that dies before any response byte counts as a
//!   connect failure

use std::collections::VecDeque;
use std::sync::Arc;

use http::HeaderValue;
use tracing::{debug, info, trace, warn};

use crate::codec::{LocalReply, RequestHead, ResetReason, ResponseHead, StreamEvent};
use crate::http::request::prepare_upstream_headers;
use crate::observability::metrics;
use crate::proxy::state::RouterState;
use crate::proxy::{tunnel, Downstream, ProxyContext};
use crate::resilience::{AttemptFailure, RetryPolicy, RetryState};
use crate::upstream::host::HostGuard;
use crate::upstream::{Cluster, UpstreamStream};

/// Forward one downstream stream. Returns the terminal state.
pub async fn forward(ctx: Arc<ProxyContext>, mut downstream: Downstream) -> RouterState {
    let (mut head, end_stream) = match downstream.requests.recv().await {
        Some(StreamEvent::Headers { head, end_stream }) => (head, end_stream),
        _ => return RouterState::Reset,
    };

    let Some(route) = ctx.routes.find(&head) else {
        debug!(
            method = %head.method,
            authority = ?head.authority,
            path = %head.path,
            "No route matched"
        );
        downstream.reply(LocalReply::not_found()).await;
        return RouterState::Failed;
    };

    if route.require_host && head.authority.is_none() {
        debug!(route = %route.name, "Route requires a host");
        downstream.reply(LocalReply::bad_request()).await;
        return RouterState::Failed;
    }

    if route.https_redirect && !head.is_connect() {
        let Some(location) = https_location(&head) else {
            downstream.reply(LocalReply::bad_request()).await;
            return RouterState::Failed;
        };
        debug!(route = %route.name, location = ?location, "Redirecting to https");
        downstream.reply(LocalReply::redirect(location)).await;
        return RouterState::Complete;
    }

    let cluster = match ctx.clusters.get(&route.cluster) {
        Ok(cluster) => cluster,
        Err(e) => {
            warn!(route = %route.name, error = %e, "Route points at a missing cluster");
            downstream.reply(LocalReply::upstream_unavailable()).await;
            return RouterState::Failed;
        }
    };

    if head.is_connect() {
        return tunnel::run(&cluster, head, downstream).await;
    }

    let mut policy = route.retry.clone();
    policy.apply_request_headers(&mut head.headers);
    let request_id = prepare_upstream_headers(&mut head.headers);
    debug!(
        request_id = %request_id,
        route = %route.name,
        cluster = %route.cluster,
        method = %head.method,
        path = %head.path,
        "Proxying request"
    );

    let router = Router::new(cluster, policy, downstream, request_id);
    router.run(StreamEvent::Headers { head, end_stream }).await
}

/// How an attempt ended when it did not finish the request.
enum Attempt {
    /// Failed inside the retry window.
    Failed(AttemptFailure),
    /// The response head asked for a retry.
    Retry,
    /// Nothing more to do; the stream is over.
    Abort(RouterState),
}

struct Router {
    cluster: Arc<Cluster>,
    retry: RetryState,
    downstream: Downstream,
    request_id: String,
    /// Request events the current attempt has not seen yet.
    pending: VecDeque<StreamEvent<RequestHead>>,
    pending_bytes: usize,
    /// Downstream request has ended.
    request_done: bool,
    /// Request events are consumed but no longer forwarded.
    discard_request: bool,
    state: RouterState,
}

impl Router {
    fn new(cluster: Arc<Cluster>, policy: RetryPolicy, downstream: Downstream, request_id: String) -> Self {
        let buffer_limit = downstream.buffer_limit;
        Self {
            cluster,
            retry: RetryState::new(policy, buffer_limit),
            downstream,
            request_id,
            pending: VecDeque::new(),
            pending_bytes: 0,
            request_done: false,
            discard_request: false,
            state: RouterState::Idle,
        }
    }

    async fn run(mut self, head: StreamEvent<RequestHead>) -> RouterState {
        if let Err(Attempt::Abort(state)) = self.buffer(Some(head)) {
            return state;
        }

        loop {
            self.transition(RouterState::AwaitingUpstream);
            let attempt = self.retry.begin_attempt();
            if attempt > 1 {
                self.pending = self.retry.replay().into();
                self.pending_bytes = self.retry.buffered_body_len();
            }

            self.transition(RouterState::UpstreamConnecting);
            let outcome = match self.connect().await {
                Ok((upstream, host)) => {
                    debug!(
                        request_id = %self.request_id,
                        cluster = %self.cluster.name(),
                        host = %host.addr,
                        attempt,
                        reused = upstream.is_reused(),
                        "Upstream stream acquired"
                    );
                    self.exchange(upstream).await
                }
                Err(attempt) => Err(attempt),
            };

            let failure = match outcome {
                Ok(state) | Err(Attempt::Abort(state)) => return self.finish(state),
                Err(Attempt::Retry) => None,
                Err(Attempt::Failed(failure)) => Some(failure),
            };

            let eligible = self.retry.can_retry()
                && failure.map_or(true, |f| self.retry.policy().should_retry_failure(f));
            if !eligible {
                debug!(
                    request_id = %self.request_id,
                    attempt,
                    failure = ?failure,
                    "Upstream unavailable"
                );
                self.downstream.reply(unavailable(failure)).await;
                return self.finish(RouterState::Failed);
            }

            self.transition(RouterState::RetryPending);
            metrics::record_retry(self.cluster.name());
            let delay = self.retry.next_delay();
            info!(
                request_id = %self.request_id,
                attempt,
                delay = ?delay,
                failure = ?failure,
                "Retrying request"
            );
            if let Err(Attempt::Abort(state)) = self.backoff(delay).await {
                return self.finish(state);
            }
            if !self.retry.can_retry() {
                self.downstream.reply(unavailable(failure)).await;
                return self.finish(RouterState::Failed);
            }
        }
    }

    async fn connect(&mut self) -> Result<(UpstreamStream, HostGuard), Attempt> {
        let cluster = self.cluster.clone();
        let acquire = cluster.acquire();
        tokio::pin!(acquire);
        loop {
            tokio::select! {
                result = &mut acquire => {
                    return result.map_err(|e| {
                        debug!(request_id = %self.request_id, error = %e, "Upstream acquire failed");
                        Attempt::Failed(e.attempt_failure())
                    });
                }
                event = self.downstream.requests.recv(), if self.can_buffer() => {
                    self.buffer(event)?;
                }
            }
        }
    }

    async fn backoff(&mut self, delay: std::time::Duration) -> Result<(), Attempt> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                event = self.downstream.requests.recv(), if self.can_buffer() => {
                    self.buffer(event)?;
                }
            }
        }
    }

    /// Drive one attempt from request replay to the end of the response.
    async fn exchange(&mut self, mut upstream: UpstreamStream) -> Result<RouterState, Attempt> {
        while let Some(event) = self.pending.pop_front() {
            if let Err(e) = upstream.send(event).await {
                debug!(request_id = %self.request_id, error = %e, "Upstream send failed");
                return Err(Attempt::Failed(classify(&upstream, e.attempt_failure())));
            }
        }
        self.pending_bytes = 0;
        self.transition(RouterState::RequestSent);

        loop {
            tokio::select! {
                event = upstream.recv() => {
                    let Some(event) = event else {
                        return Ok(self.complete(&mut upstream));
                    };
                    if let Some(state) = self.on_upstream(&mut upstream, event).await? {
                        return Ok(state);
                    }
                }
                // Still polled after the request ends so a client reset is seen.
                event = self.downstream.requests.recv() => {
                    self.on_downstream(&mut upstream, event).await?;
                }
            }
        }
    }

    /// Handle a response event. `Some` ends the exchange.
    async fn on_upstream(
        &mut self,
        upstream: &mut UpstreamStream,
        event: StreamEvent<ResponseHead>,
    ) -> Result<Option<RouterState>, Attempt> {
        match event {
            StreamEvent::Reset(reason) => {
                if !self.retry.response_started() {
                    debug!(request_id = %self.request_id, reason = %reason, "Upstream reset before headers");
                    return Err(Attempt::Failed(classify(upstream, AttemptFailure::Reset(reason))));
                }
                warn!(request_id = %self.request_id, reason = %reason, "Upstream reset mid-response");
                self.downstream.send(StreamEvent::Reset(reason)).await;
                Ok(Some(RouterState::Reset))
            }
            StreamEvent::Headers { head, end_stream } => {
                if self.retry.can_retry() && self.retry.policy().should_retry_response(&head) {
                    debug!(request_id = %self.request_id, status = %head.status, "Retriable response");
                    upstream.reset(ResetReason::LocalReset);
                    return Err(Attempt::Retry);
                }
                self.retry.mark_response_started();
                self.transition(RouterState::ResponseHeadersReceived);
                let status = head.status;
                if !self.downstream.send(StreamEvent::Headers { head, end_stream }).await {
                    upstream.reset(ResetReason::LocalReset);
                    return Ok(Some(RouterState::Reset));
                }
                trace!(request_id = %self.request_id, status = %status, "Response headers forwarded");
                if end_stream {
                    return Ok(Some(self.complete(upstream)));
                }
                self.transition(RouterState::Streaming);
                Ok(None)
            }
            event => {
                let end_stream = event.is_end_stream();
                if !self.downstream.send(event).await {
                    upstream.reset(ResetReason::LocalReset);
                    return Ok(Some(RouterState::Reset));
                }
                if end_stream {
                    return Ok(Some(self.complete(upstream)));
                }
                Ok(None)
            }
        }
    }

    /// Handle a request event arriving while the attempt is live.
    async fn on_downstream(
        &mut self,
        upstream: &mut UpstreamStream,
        event: Option<StreamEvent<RequestHead>>,
    ) -> Result<(), Attempt> {
        let event = match event {
            Some(StreamEvent::Reset(reason)) => {
                debug!(request_id = %self.request_id, reason = %reason, "Downstream reset; cancelling upstream stream");
                upstream.reset(reason);
                return Err(Attempt::Abort(RouterState::Reset));
            }
            None => {
                debug!(request_id = %self.request_id, "Downstream went away; cancelling upstream stream");
                upstream.reset(ResetReason::ConnectionTermination);
                return Err(Attempt::Abort(RouterState::Reset));
            }
            Some(_) if self.request_done => return Ok(()),
            Some(event) => event,
        };

        self.retry.record(&event);
        if event.is_end_stream() {
            self.request_done = true;
        }
        if self.discard_request {
            return Ok(());
        }
        if let Err(e) = upstream.send(event).await {
            debug!(request_id = %self.request_id, error = %e, "Upstream send failed");
            if !self.retry.response_started() {
                return Err(Attempt::Failed(classify(upstream, e.attempt_failure())));
            }
            // The response may still finish; keep draining the request.
            self.discard_request = true;
        }
        Ok(())
    }

    fn complete(&mut self, upstream: &mut UpstreamStream) -> RouterState {
        if !self.request_done {
            // Response finished first; the rest of the request has nowhere to go.
            upstream.reset(ResetReason::LocalReset);
        }
        RouterState::Complete
    }

    fn can_buffer(&self) -> bool {
        !self.request_done && self.pending_bytes < self.downstream.buffer_limit
    }

    /// Take a request event while no attempt is live.
    fn buffer(&mut self, event: Option<StreamEvent<RequestHead>>) -> Result<(), Attempt> {
        let event = match event {
            Some(StreamEvent::Reset(_)) | None => {
                debug!(request_id = %self.request_id, "Downstream reset before upstream was ready");
                return Err(Attempt::Abort(RouterState::Reset));
            }
            Some(event) => event,
        };
        self.retry.record(&event);
        if event.is_end_stream() {
            self.request_done = true;
        }
        if let StreamEvent::Data { bytes, .. } = &event {
            self.pending_bytes += bytes.len();
        }
        self.pending.push_back(event);
        Ok(())
    }

    fn transition(&mut self, next: RouterState) {
        trace!(request_id = %self.request_id, from = %self.state, to = %next, "Router transition");
        self.state = next;
    }

    fn finish(mut self, state: RouterState) -> RouterState {
        self.transition(state);
        debug!(
            request_id = %self.request_id,
            attempts = self.retry.attempts(),
            state = %state,
            "Request finished"
        );
        state
    }
}

fn https_location(head: &RequestHead) -> Option<HeaderValue> {
    let authority = head.authority.as_deref()?;
    HeaderValue::from_str(&format!("https://{authority}{}", head.path)).ok()
}

/// The `503` for a request no attempt could serve. An upstream that spoke
/// garbage also costs the client its connection.
fn unavailable(failure: Option<AttemptFailure>) -> LocalReply {
    let reply = LocalReply::upstream_unavailable();
    match failure {
        Some(AttemptFailure::Reset(ResetReason::ProtocolError)) => reply.close_after(),
        _ => reply,
    }
}

/// A reused connection that failed before any response byte was read never
/// saw the request; treat it like a failed connect.
fn classify(upstream: &UpstreamStream, failure: AttemptFailure) -> AttemptFailure {
    match failure {
        AttemptFailure::Reset(ResetReason::ConnectionTermination)
            if upstream.is_reused() && !upstream.response_seen() =>
        {
            AttemptFailure::ConnectFailure
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, ProxyConfig, RetryConfig, RouteConfig};
    use crate::lifecycle::DrainCoordinator;
    use crate::proxy::{downstream_channel, DownstreamHandle, Reply};
    use crate::upstream::{BoxedIo, Connector};
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use http::{Method, StatusCode};
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// What the fake upstream does on its next connection.
    #[derive(Debug, Clone, Copy)]
    enum Script {
        Refuse,
        /// Read the request, answer with these bytes and keep the connection.
        Respond(&'static [u8]),
        /// Read the request, answer with these bytes and hang up.
        RespondAndClose(&'static [u8]),
        /// Never answer.
        Silent,
    }

    #[derive(Debug, Default)]
    struct Recorded {
        bodies: Vec<Vec<u8>>,
    }

    #[derive(Debug)]
    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Script>>,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl Connector for ScriptedConnector {
        fn connect(&self, _addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedIo>> {
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Script::Refuse);
            let recorded = self.recorded.clone();
            Box::pin(async move {
                let (near, far) = tokio::io::duplex(64 * 1024);
                match script {
                    Script::Refuse => return Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
                    Script::Respond(bytes) => {
                        tokio::spawn(serve(far, bytes, false, recorded));
                    }
                    Script::RespondAndClose(bytes) => {
                        tokio::spawn(serve(far, bytes, true, recorded));
                    }
                    Script::Silent => {
                        tokio::spawn(async move {
                            let mut far = far;
                            let mut sink = Vec::new();
                            let _ = far.read_to_end(&mut sink).await;
                        });
                    }
                }
                Ok(Box::new(near) as BoxedIo)
            })
        }
    }

    /// Minimal HTTP/1 upstream: reads one content-length framed request.
    async fn serve(mut io: DuplexStream, response: &'static [u8], close: bool, recorded: Arc<Mutex<Recorded>>) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            match io.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
        let length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length: "))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < head_end + length {
            match io.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        recorded.lock().unwrap().bodies.push(buf[head_end..head_end + length].to_vec());
        let _ = io.write_all(response).await;
        if !close {
            let mut rest = Vec::new();
            let _ = io.read_to_end(&mut rest).await;
        }
    }

    fn context(scripts: &[Script], retry: Option<RetryConfig>) -> (Arc<ProxyContext>, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let connector = Arc::new(ScriptedConnector {
            scripts: Mutex::new(scripts.iter().copied().collect()),
            recorded: recorded.clone(),
        });
        let config = ProxyConfig {
            clusters: vec![ClusterConfig {
                name: "backend".into(),
                hosts: vec!["127.0.0.1:9001".into(), "127.0.0.1:9002".into()],
                connect_timeout_ms: 200,
                ..ClusterConfig::default()
            }],
            routes: vec![
                RouteConfig {
                    name: "api".into(),
                    host: None,
                    path_prefix: Some("/api".into()),
                    cluster: "backend".into(),
                    priority: 0,
                    require_host: false,
                    allow_connect: false,
                    https_redirect: false,
                    retry,
                },
                RouteConfig {
                    name: "secure".into(),
                    host: None,
                    path_prefix: Some("/secure".into()),
                    cluster: "backend".into(),
                    priority: 0,
                    require_host: false,
                    allow_connect: false,
                    https_redirect: true,
                    retry: None,
                },
            ],
            ..ProxyConfig::default()
        };
        let ctx = ProxyContext::new(&config, connector, DrainCoordinator::new());
        (Arc::new(ctx), recorded)
    }

    fn post(path: &str, body: &'static str) -> Vec<StreamEvent<RequestHead>> {
        let mut head = RequestHead::new(Method::POST, Some("example.com".into()), path);
        head.headers
            .insert(http::header::CONTENT_LENGTH, body.len().into());
        vec![
            StreamEvent::Headers { head, end_stream: false },
            StreamEvent::Data { bytes: Bytes::from_static(body.as_bytes()), end_stream: true },
        ]
    }

    async fn run(
        ctx: Arc<ProxyContext>,
        events: Vec<StreamEvent<RequestHead>>,
    ) -> (RouterState, Vec<Reply>) {
        let (handle, downstream) = downstream_channel(1024);
        let DownstreamHandle { requests, mut replies } = handle;
        let router = tokio::spawn(forward(ctx, downstream));
        for event in events {
            let _ = requests.send(event).await;
        }
        let mut out = Vec::new();
        while let Some(reply) = replies.recv().await {
            out.push(reply);
        }
        drop(requests);
        (router.await.unwrap(), out)
    }

    fn status_of(replies: &[Reply]) -> StatusCode {
        match &replies[0] {
            Reply::Event(StreamEvent::Headers { head, .. }) => head.status,
            Reply::Local(reply) => reply.status,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_route_is_404() {
        let (ctx, _) = context(&[], None);
        let (state, replies) = run(ctx, post("/other", "x")).await;
        assert_eq!(state, RouterState::Failed);
        assert_eq!(status_of(&replies), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn forwards_request_and_response() {
        let (ctx, recorded) = context(
            &[Script::Respond(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")],
            None,
        );
        let (state, replies) = run(ctx, post("/api/x", "ping")).await;
        assert_eq!(state, RouterState::Complete);
        assert_eq!(status_of(&replies), StatusCode::OK);
        let body: Vec<u8> = replies
            .iter()
            .filter_map(|r| match r {
                Reply::Event(StreamEvent::Data { bytes, .. }) => Some(bytes.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"hello");
        assert_eq!(recorded.lock().unwrap().bodies, vec![b"ping".to_vec()]);
    }

    #[tokio::test]
    async fn retries_503_with_full_body() {
        let retry = RetryConfig {
            retry_on: vec!["5xx".into()],
            num_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..RetryConfig::default()
        };
        let (ctx, recorded) = context(
            &[
                Script::Respond(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n"),
                Script::Respond(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n"),
            ],
            Some(retry),
        );
        let (state, replies) = run(ctx, post("/api/x", "0123456789")).await;
        assert_eq!(state, RouterState::Complete);
        assert_eq!(status_of(&replies), StatusCode::OK);
        let bodies = &recorded.lock().unwrap().bodies;
        assert_eq!(bodies.len(), 2);
        assert!(bodies.iter().all(|b| b == b"0123456789"));
    }

    #[tokio::test]
    async fn connect_failures_end_in_503() {
        let (ctx, _) = context(&[Script::Refuse, Script::Refuse], None);
        let (state, replies) = run(ctx, post("/api/x", "x")).await;
        assert_eq!(state, RouterState::Failed);
        match &replies[0] {
            Reply::Local(reply) => {
                assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(&reply.body[..], crate::codec::reply::UPSTREAM_UNAVAILABLE_BODY.as_bytes());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_before_headers_retries_on_connect_failure_only_when_allowed() {
        // Default policy retries connect failures, not resets of fresh connections.
        let (ctx, recorded) = context(
            &[
                Script::RespondAndClose(b""),
                Script::Respond(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n"),
            ],
            None,
        );
        let (state, replies) = run(ctx, post("/api/x", "abc")).await;
        assert_eq!(state, RouterState::Failed);
        assert_eq!(status_of(&replies), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(recorded.lock().unwrap().bodies.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_after_headers_resets_downstream() {
        let (ctx, _) = context(
            &[Script::RespondAndClose(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nabc")],
            Some(RetryConfig {
                retry_on: vec!["reset".into()],
                ..RetryConfig::default()
            }),
        );
        let (state, replies) = run(ctx, post("/api/x", "q")).await;
        assert_eq!(state, RouterState::Reset);
        assert_eq!(status_of(&replies), StatusCode::OK);
        assert!(matches!(
            replies.last(),
            Some(Reply::Event(StreamEvent::Reset(ResetReason::ConnectionTermination)))
        ));
    }

    #[tokio::test]
    async fn downstream_reset_cancels_pending_upstream() {
        let (ctx, _) = context(&[Script::Silent], None);
        let (handle, downstream) = downstream_channel(1024);
        let router = tokio::spawn(forward(ctx, downstream));
        let mut events = post("/api/x", "abc");
        handle.requests.send(events.remove(0)).await.unwrap();
        handle.requests.send(events.remove(0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle
            .requests
            .send(StreamEvent::Reset(ResetReason::RemoteReset))
            .await
            .unwrap();
        assert_eq!(router.await.unwrap(), RouterState::Reset);
    }

    #[tokio::test]
    async fn redirect_route_answers_301() {
        let (ctx, recorded) = context(&[], None);
        let head = RequestHead::new(Method::GET, Some("www.redirect.com".into()), "/secure/foo?a=1");
        let (state, replies) = run(ctx, vec![StreamEvent::Headers { head, end_stream: true }]).await;
        assert_eq!(state, RouterState::Complete);
        match &replies[0] {
            Reply::Local(reply) => {
                assert_eq!(reply.status, StatusCode::MOVED_PERMANENTLY);
                assert_eq!(
                    reply.location.as_ref().unwrap(),
                    "https://www.redirect.com/secure/foo?a=1"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(recorded.lock().unwrap().bodies.is_empty());
    }

    #[tokio::test]
    async fn redirect_without_host_is_400() {
        let (ctx, _) = context(&[], None);
        let head = RequestHead::new(Method::GET, None, "/secure/foo");
        let (state, replies) = run(ctx, vec![StreamEvent::Headers { head, end_stream: true }]).await;
        assert_eq!(state, RouterState::Failed);
        assert_eq!(status_of(&replies), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn garbage_response_closes_downstream() {
        let (ctx, _) = context(&[Script::Respond(b"garbage\r\n\r\n")], None);
        let (state, replies) = run(ctx, post("/api/x", "x")).await;
        assert_eq!(state, RouterState::Failed);
        match &replies[0] {
            Reply::Local(reply) => {
                assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
                assert!(reply.close);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_failure_503_keeps_connection() {
        let (ctx, _) = context(&[Script::Refuse, Script::Refuse], None);
        let (_, replies) = run(ctx, post("/api/x", "x")).await;
        assert!(matches!(&replies[0], Reply::Local(reply) if !reply.close));
    }
}
