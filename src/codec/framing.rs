//! Header rules shared by the HTTP/1 and HTTP/2 codecs.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};

use super::ProtocolError;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Check if a header is hop-by-hop.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Parse the declared body length.
///
/// Repeated fields and comma lists are accepted as long as every element is
/// the same non-negative decimal. Anything else is a framing error.
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ProtocolError> {
    let mut found: Option<u64> = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let text = value
            .to_str()
            .map_err(|_| ProtocolError::InvalidContentLength)?;
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ProtocolError::InvalidContentLength);
            }
            let n: u64 = part
                .parse()
                .map_err(|_| ProtocolError::InvalidContentLength)?;
            match found {
                Some(prev) if prev != n => return Err(ProtocolError::ConflictingContentLength),
                _ => found = Some(n),
            }
        }
    }
    Ok(found)
}

/// True when the final transfer coding is `chunked`.
///
/// Any other final coding cannot be framed by a request parser.
pub fn is_chunked(headers: &HeaderMap) -> Result<bool, ProtocolError> {
    let mut last: Option<String> = None;
    let mut any = false;
    for value in headers.get_all(header::TRANSFER_ENCODING) {
        any = true;
        let text = value
            .to_str()
            .map_err(|_| ProtocolError::UnsupportedTransferEncoding)?;
        if let Some(coding) = text.split(',').map(str::trim).filter(|s| !s.is_empty()).last() {
            last = Some(coding.to_ascii_lowercase());
        }
    }
    match last.as_deref() {
        Some("chunked") => Ok(true),
        None if !any => Ok(false),
        _ => Err(ProtocolError::UnsupportedTransferEncoding),
    }
}

/// True when any `connection` field carries the given token.
pub fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Whether the peer asked for the connection to end after this message.
pub fn wants_close(version: http::Version, headers: &HeaderMap) -> bool {
    if version == http::Version::HTTP_10 {
        !connection_has(headers, "keep-alive")
    } else {
        connection_has(headers, "close")
    }
}

/// Remove hop-by-hop fields, including every field named by `connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Join repeated `cookie` fields into one, separated by `; `.
pub fn merge_cookies(headers: &mut HeaderMap) {
    let count = headers.get_all(header::COOKIE).iter().count();
    if count < 2 {
        return;
    }
    let joined = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join("; ");
    if let Ok(value) = HeaderValue::from_str(&joined) {
        headers.insert(header::COOKIE, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn content_length_single() {
        assert_eq!(content_length(&headers(&[("content-length", "42")])), Ok(Some(42)));
        assert_eq!(content_length(&HeaderMap::new()), Ok(None));
    }

    #[test]
    fn content_length_duplicates_agree() {
        let h = headers(&[("content-length", "3"), ("content-length", "3")]);
        assert_eq!(content_length(&h), Ok(Some(3)));
        assert_eq!(content_length(&headers(&[("content-length", "3, 3")])), Ok(Some(3)));
    }

    #[test]
    fn content_length_rejects_bad_values() {
        assert_eq!(
            content_length(&headers(&[("content-length", "-1")])),
            Err(ProtocolError::InvalidContentLength)
        );
        assert_eq!(
            content_length(&headers(&[("content-length", "3,2")])),
            Err(ProtocolError::ConflictingContentLength)
        );
        assert_eq!(
            content_length(&headers(&[("content-length", "")])),
            Err(ProtocolError::InvalidContentLength)
        );
        assert_eq!(
            content_length(&headers(&[("content-length", "+5")])),
            Err(ProtocolError::InvalidContentLength)
        );
    }

    #[test]
    fn chunked_detection() {
        assert_eq!(is_chunked(&headers(&[("transfer-encoding", "chunked")])), Ok(true));
        assert_eq!(is_chunked(&headers(&[("transfer-encoding", "gzip, Chunked")])), Ok(true));
        assert_eq!(is_chunked(&HeaderMap::new()), Ok(false));
        assert!(is_chunked(&headers(&[("transfer-encoding", "gzip")])).is_err());
    }

    #[test]
    fn strips_connection_named_fields() {
        let mut h = headers(&[
            ("connection", "keep-alive, x-private"),
            ("x-private", "1"),
            ("keep-alive", "timeout=5"),
            ("x-public", "2"),
        ]);
        strip_hop_by_hop(&mut h);
        assert!(h.get("x-private").is_none());
        assert!(h.get("connection").is_none());
        assert!(h.get("keep-alive").is_none());
        assert_eq!(h.get("x-public").unwrap(), "2");
    }

    #[test]
    fn cookies_are_joined() {
        let mut h = headers(&[("cookie", "a=b"), ("cookie", "c=d")]);
        merge_cookies(&mut h);
        assert_eq!(h.get_all("cookie").iter().count(), 1);
        assert_eq!(h.get("cookie").unwrap(), "a=b; c=d");
    }

    #[test]
    fn close_semantics() {
        assert!(wants_close(http::Version::HTTP_10, &HeaderMap::new()));
        assert!(!wants_close(
            http::Version::HTTP_10,
            &headers(&[("connection", "Keep-Alive")])
        ));
        assert!(!wants_close(http::Version::HTTP_11, &HeaderMap::new()));
        assert!(wants_close(http::Version::HTTP_11, &headers(&[("connection", "close")])));
    }
}
