//! Router states.

use std::fmt;

/// Where a router is in forwarding one request.
///
/// ```text
/// Idle → AwaitingUpstream → UpstreamConnecting → RequestSent
///     → ResponseHeadersReceived → Streaming → Complete
///     → RetryPending → AwaitingUpstream
///     → Reset | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Idle,
    AwaitingUpstream,
    UpstreamConnecting,
    RequestSent,
    ResponseHeadersReceived,
    Streaming,
    RetryPending,
    /// Response fully forwarded.
    Complete,
    /// Either side reset the stream.
    Reset,
    /// Answered locally without an upstream response.
    Failed,
}

impl RouterState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RouterState::Complete | RouterState::Reset | RouterState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouterState::Idle => "idle",
            RouterState::AwaitingUpstream => "awaiting_upstream",
            RouterState::UpstreamConnecting => "upstream_connecting",
            RouterState::RequestSent => "request_sent",
            RouterState::ResponseHeadersReceived => "response_headers_received",
            RouterState::Streaming => "streaming",
            RouterState::RetryPending => "retry_pending",
            RouterState::Complete => "complete",
            RouterState::Reset => "reset",
            RouterState::Failed => "failed",
        }
    }
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
