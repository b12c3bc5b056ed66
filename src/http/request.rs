//! Request classification and preparation for the upstream.
//!
//! # Responsibilities
//! - Decide whether a request takes the upgrade path
//! - Turn the client's request head into the upstream request head
//!
//! # Design Decisions
//! - Headers are forwarded as received apart from the forwarding set
//! - The upstream always gets an origin-form target over HTTP/1.1

use std::net::SocketAddr;

use hyper::header::{HeaderMap, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::http::request::Parts;
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Uri, Version};

use crate::security::apply_forwarding_headers;

/// True if the request asks to switch protocols (e.g. to WebSocket).
///
/// Requires HTTP/1.1, an `Upgrade` header, and an `upgrade` token in
/// `Connection`.
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.version() == Version::HTTP_11
        && req.headers().contains_key(UPGRADE)
        && connection_has_upgrade(req.headers())
}

/// `Connection` may repeat and may list several comma-separated tokens.
fn connection_has_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Protocol named in the `Upgrade` header, lowercased, for logging.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase())
}

/// Rewrite a client request head in place for the upstream.
///
/// Applies the forwarding header set, falls back to the upstream authority
/// when the client sent no `Host`, and reduces the target to origin form.
pub fn prepare_upstream_head(parts: &mut Parts, peer: SocketAddr, upstream_authority: &str) {
    apply_forwarding_headers(&mut parts.headers, peer);

    if !parts.headers.contains_key(HOST) {
        if let Ok(host) = HeaderValue::from_str(upstream_authority) {
            parts.headers.insert(HOST, host);
        }
    }

    parts.uri = origin_form(&parts.uri);
    parts.version = Version::HTTP_11;
    parts.extensions.clear();
}

fn origin_form(uri: &Uri) -> Uri {
    let path_and_query = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::from(path_and_query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::headers::{X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO};

    fn upgrade_request(connection: &str) -> Request<()> {
        Request::builder()
            .uri("/chat")
            .header(UPGRADE, "websocket")
            .header(CONNECTION, connection)
            .body(())
            .unwrap()
    }

    fn peer() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    #[test]
    fn websocket_handshake_is_upgrade() {
        assert!(is_upgrade_request(&upgrade_request("Upgrade")));
        assert!(is_upgrade_request(&upgrade_request("keep-alive, Upgrade")));
        assert!(is_upgrade_request(&upgrade_request("UPGRADE")));
    }

    #[test]
    fn upgrade_header_alone_is_not_enough() {
        let req = Request::builder()
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
        assert!(!is_upgrade_request(&upgrade_request("keep-alive")));
    }

    #[test]
    fn http10_cannot_upgrade() {
        let mut req = upgrade_request("Upgrade");
        *req.version_mut() = Version::HTTP_10;
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn plain_request_is_not_upgrade() {
        let req = Request::builder().uri("/health").body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn protocol_is_normalized() {
        let req = Request::builder()
            .header(UPGRADE, " WebSocket ")
            .body(())
            .unwrap();
        assert_eq!(upgrade_protocol(req.headers()).as_deref(), Some("websocket"));
    }

    #[test]
    fn head_keeps_host_and_path() {
        let req = Request::builder()
            .method("POST")
            .uri("https://example.com/api/items?page=2")
            .header(HOST, "example.com")
            .header("x-trace", "abc")
            .body(())
            .unwrap();
        let (mut parts, _) = req.into_parts();

        prepare_upstream_head(&mut parts, peer(), "localhost:18789");

        assert_eq!(parts.method, "POST");
        assert_eq!(parts.uri, "/api/items?page=2");
        assert_eq!(parts.version, Version::HTTP_11);
        assert_eq!(parts.headers[HOST], "example.com");
        assert_eq!(parts.headers["x-trace"], "abc");
        assert_eq!(parts.headers[&X_FORWARDED_HOST], "example.com");
        assert_eq!(parts.headers[&X_FORWARDED_FOR], "192.0.2.10");
        assert_eq!(parts.headers[&X_FORWARDED_PROTO], "https");
    }

    #[test]
    fn missing_host_falls_back_to_upstream() {
        let req = Request::builder()
            .version(Version::HTTP_10)
            .uri("/")
            .body(())
            .unwrap();
        let (mut parts, _) = req.into_parts();

        prepare_upstream_head(&mut parts, peer(), "localhost:18789");

        assert_eq!(parts.headers[HOST], "localhost:18789");
        assert!(parts.headers.get(&X_FORWARDED_HOST).is_none());
    }
}
