//! Forwarding header set.
//!
//! # Responsibilities
//! - Add X-Forwarded-For, X-Real-IP, X-Forwarded-Proto, X-Forwarded-Host
//! - Leave every other header exactly as the client sent it
//!
//! # Design Decisions
//! - The four forwarding headers are overwritten, never appended: this
//!   proxy is the first trusted hop, so client-supplied values are replaced
//! - TLS always terminates here, so the forwarded proto is always `https`

use std::net::{IpAddr, SocketAddr};

use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Rewrite `headers` into the forwarding header set for a client at `peer`.
///
/// `insert` replaces all existing values of a name, so repeated client
/// values are shadowed by a single override.
pub fn apply_forwarding_headers(headers: &mut HeaderMap, peer: SocketAddr) {
    let client_ip = client_ip(peer);
    // An IP address always renders to visible ASCII.
    if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
        headers.insert(X_FORWARDED_FOR, value.clone());
        headers.insert(X_REAL_IP, value);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

    match headers.get(HOST).cloned() {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
        }
    }
}

/// IPv4 clients on a dual-stack socket show up as `::ffff:a.b.c.d`.
fn client_ip(peer: SocketAddr) -> IpAddr {
    peer.ip().to_canonical()
}
