//! Retry policy and per-request retry state.
//!
//! # Responsibilities
//! - Decide whether a failed or unwanted attempt may be retried
//! - Keep a replayable copy of the request received so far
//! - Enforce the attempt budget
//!
//! # Design Decisions
//! - Policy is the route's config, overridden per request by headers
//! - A reused pooled connection that fails before any response byte counts
//!   as a connect failure, not a reset
//! - Overflowing the replay buffer disables retries rather than failing

use std::collections::HashSet;
use std::time::Duration;

use http::{HeaderMap, HeaderName, StatusCode};

use crate::codec::{RequestHead, ResetReason, ResponseHead, StreamEvent};
use crate::config::RetryConfig;
use crate::stream::BodyBuffer;

use super::backoff::Backoff;

pub const RETRY_ON_HEADER: HeaderName = HeaderName::from_static("x-edge-retry-on");
pub const RETRY_GRPC_ON_HEADER: HeaderName = HeaderName::from_static("x-edge-retry-grpc-on");
pub const MAX_RETRIES_HEADER: HeaderName = HeaderName::from_static("x-edge-max-retries");

/// Trigger categories for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryOn {
    /// Any 5xx response, connect failure, or reset before headers.
    FiveXx,
    /// 502, 503 or 504, plus connect failures and resets.
    GatewayError,
    ConnectFailure,
    /// Upstream reset or disconnect before response headers.
    Reset,
    RefusedStream,
    /// 409 Conflict.
    Retriable4xx,
}

impl RetryOn {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "5xx" => Some(RetryOn::FiveXx),
            "gateway-error" => Some(RetryOn::GatewayError),
            "connect-failure" => Some(RetryOn::ConnectFailure),
            "reset" => Some(RetryOn::Reset),
            "refused-stream" => Some(RetryOn::RefusedStream),
            "retriable-4xx" => Some(RetryOn::Retriable4xx),
            _ => None,
        }
    }
}

/// gRPC status codes that may trigger a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrpcCode {
    Cancelled,
    DeadlineExceeded,
    ResourceExhausted,
    Internal,
    Unavailable,
}

impl GrpcCode {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "cancelled" => Some(GrpcCode::Cancelled),
            "deadline-exceeded" => Some(GrpcCode::DeadlineExceeded),
            "resource-exhausted" => Some(GrpcCode::ResourceExhausted),
            "internal" => Some(GrpcCode::Internal),
            "unavailable" => Some(GrpcCode::Unavailable),
            _ => None,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(GrpcCode::Cancelled),
            4 => Some(GrpcCode::DeadlineExceeded),
            8 => Some(GrpcCode::ResourceExhausted),
            13 => Some(GrpcCode::Internal),
            14 => Some(GrpcCode::Unavailable),
            _ => None,
        }
    }
}

/// Why an upstream attempt ended without usable response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    /// No connection could be obtained, or a reused one died unused.
    ConnectFailure,
    /// The pool was at its ceiling until the connect timeout.
    Overflow,
    /// The attempt's stream was reset before response headers.
    Reset(ResetReason),
}

/// Which outcomes of an attempt may be retried, and how often.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retry_on: HashSet<RetryOn>,
    grpc_on: HashSet<GrpcCode>,
    num_retries: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            retry_on: config.retry_on.iter().filter_map(|s| RetryOn::parse(s)).collect(),
            grpc_on: config
                .retry_grpc_on
                .iter()
                .filter_map(|s| GrpcCode::parse(s))
                .collect(),
            num_retries: config.num_retries,
            backoff: Backoff::new(config.base_delay_ms, config.max_delay_ms),
        }
    }

    /// Merge per-request retry headers into the policy and strip them.
    pub fn apply_request_headers(&mut self, headers: &mut HeaderMap) {
        for value in headers.get_all(&RETRY_ON_HEADER) {
            if let Ok(list) = value.to_str() {
                self.retry_on.extend(list.split(',').filter_map(RetryOn::parse));
            }
        }
        for value in headers.get_all(&RETRY_GRPC_ON_HEADER) {
            if let Ok(list) = value.to_str() {
                self.grpc_on.extend(list.split(',').filter_map(GrpcCode::parse));
            }
        }
        if let Some(n) = headers
            .get(&MAX_RETRIES_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok())
        {
            self.num_retries = n;
        }
        headers.remove(&RETRY_ON_HEADER);
        headers.remove(&RETRY_GRPC_ON_HEADER);
        headers.remove(&MAX_RETRIES_HEADER);
    }

    /// Total attempts allowed, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.num_retries.saturating_add(1)
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Whether a response head should be discarded in favor of a retry.
    pub fn should_retry_response(&self, head: &ResponseHead) -> bool {
        let status = head.status;
        let by_status = self.retry_on.iter().any(|on| match on {
            RetryOn::FiveXx => status.is_server_error(),
            RetryOn::GatewayError => matches!(
                status,
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
            ),
            RetryOn::Retriable4xx => status == StatusCode::CONFLICT,
            _ => false,
        });
        by_status || self.grpc_status_matches(&head.headers)
    }

    /// Whether a failed attempt qualifies for a retry.
    pub fn should_retry_failure(&self, failure: AttemptFailure) -> bool {
        self.retry_on.iter().any(|on| match (on, failure) {
            (
                RetryOn::FiveXx | RetryOn::GatewayError,
                AttemptFailure::ConnectFailure | AttemptFailure::Reset(_),
            ) => true,
            (RetryOn::ConnectFailure, AttemptFailure::ConnectFailure) => true,
            (RetryOn::Reset, AttemptFailure::Reset(_)) => true,
            (RetryOn::RefusedStream, AttemptFailure::Reset(ResetReason::RefusedStream)) => true,
            _ => false,
        })
    }

    fn grpc_status_matches(&self, headers: &HeaderMap) -> bool {
        if self.grpc_on.is_empty() {
            return false;
        }
        headers
            .get("grpc-status")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok())
            .and_then(GrpcCode::from_code)
            .is_some_and(|code| self.grpc_on.contains(&code))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Per-request retry bookkeeping.
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
    head: Option<RequestHead>,
    body: BodyBuffer,
    trailers: Option<HeaderMap>,
    request_complete: bool,
    response_started: bool,
}

impl RetryState {
    pub fn new(policy: RetryPolicy, buffer_limit: usize) -> Self {
        Self {
            policy,
            attempts: 0,
            head: None,
            body: BodyBuffer::new(buffer_limit),
            trailers: None,
            request_complete: false,
            response_started: false,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Copy a request event into the replay buffer.
    ///
    /// No-op once the response has started, since no replay can follow.
    pub fn record(&mut self, event: &StreamEvent<RequestHead>) {
        if self.response_started {
            if event.is_end_stream() {
                self.request_complete = true;
            }
            return;
        }
        match event {
            StreamEvent::Headers { head, end_stream } => {
                self.head = Some(head.clone());
                self.request_complete = *end_stream;
            }
            StreamEvent::Data { bytes, end_stream } => {
                let overflowed = self.body.overflowed();
                if !self.body.push(bytes.clone()) && !overflowed {
                    tracing::debug!(
                        buffered_bytes = self.body.len(),
                        "Request exceeds retry buffer; retries disabled"
                    );
                }
                self.request_complete = *end_stream;
            }
            StreamEvent::Trailers(trailers) => {
                self.trailers = Some(trailers.clone());
                self.request_complete = true;
            }
            StreamEvent::Reset(_) => {}
        }
    }

    /// Count a new attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Called once any response byte has been forwarded downstream.
    pub fn mark_response_started(&mut self) {
        self.response_started = true;
        self.body.clear();
    }

    pub fn response_started(&self) -> bool {
        self.response_started
    }

    pub fn request_complete(&self) -> bool {
        self.request_complete
    }

    /// Budget left and the request can still be replayed.
    pub fn can_retry(&self) -> bool {
        !self.response_started
            && !self.body.overflowed()
            && self.head.is_some()
            && self.attempts < self.policy.max_attempts()
    }

    pub fn next_delay(&self) -> Duration {
        self.policy.backoff().delay(self.attempts)
    }

    /// Events that recreate, on a fresh attempt, everything received so far.
    pub fn replay(&self) -> Vec<StreamEvent<RequestHead>> {
        let Some(head) = &self.head else {
            return Vec::new();
        };
        let has_body = !self.body.is_empty();
        let has_trailers = self.trailers.is_some();
        let mut events = vec![StreamEvent::Headers {
            head: head.clone(),
            end_stream: self.request_complete && !has_body && !has_trailers,
        }];
        if has_body {
            events.push(StreamEvent::Data {
                bytes: self.body.to_bytes(),
                end_stream: self.request_complete && !has_trailers,
            });
        }
        if let Some(trailers) = &self.trailers {
            events.push(StreamEvent::Trailers(trailers.clone()));
        }
        events
    }

    /// Total request body bytes held for replay.
    pub fn buffered_body_len(&self) -> usize {
        self.body.len()
    }
}
