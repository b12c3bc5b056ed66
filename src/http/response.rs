//! Responses the proxy writes itself.
//!
//! Relayed responses pass through untouched; the only response the proxy
//! builds is the `101 Switching Protocols` reply to an accepted upgrade,
//! mirrored from what the backend actually negotiated.

use axum::body::Body;
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE,
};
use hyper::{Response, StatusCode};

/// Build the client's 101 reply from the backend's 101 headers.
///
/// Subprotocol, extension and accept-key headers are carried over. Framing
/// headers are dropped since the connection stops being HTTP. `Upgrade` and
/// `Connection` are filled in if the backend left them out.
pub fn switching_protocols(
    upstream_headers: &HeaderMap,
    requested_protocol: Option<&HeaderValue>,
) -> Response<Body> {
    let mut headers = HeaderMap::with_capacity(upstream_headers.len());
    for (name, value) in upstream_headers {
        if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if !headers.contains_key(UPGRADE) {
        let protocol = requested_protocol
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("websocket"));
        headers.insert(UPGRADE, protocol);
    }
    let connection_upgrades = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("upgrade"));
    if !connection_upgrades {
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = headers;
    response
}
