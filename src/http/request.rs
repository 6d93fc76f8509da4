//! Request handling and transformation.
//!
//! # Responsibilities
//! - Generate unique request ID (UUID)
//! - Prepare request headers for forwarding to an upstream
//!
//! # Design Decisions
//! - A client-supplied request ID is kept so traces line up end to end
//! - Connection-scoped headers never cross the proxy

use http::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use crate::codec::framing;

/// Header carrying the request ID.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Strip hop-by-hop fields, merge cookies and make sure a request ID is set.
///
/// Returns the request ID for logging.
pub fn prepare_upstream_headers(headers: &mut HeaderMap) -> String {
    framing::strip_hop_by_hop(headers);
    framing::merge_cookies(headers);

    if let Some(id) = headers.get(&X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        return id.to_string();
    }
    let id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(X_REQUEST_ID, value);
    }
    id
}
