//! Relay errors and their client-facing form.

use std::time::Duration;

use axum::response::{IntoResponse, Response};
use hyper::header::CONTENT_TYPE;
use hyper::StatusCode;
use thiserror::Error;

/// Why a single exchange with the upstream failed.
///
/// Scoped to one client connection; never retried.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to upstream {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("upstream HTTP error: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("upstream sent no response within {0:?}")]
    ResponseTimeout(Duration),

    #[error("upstream refused upgrade with status {0}")]
    UpgradeRefused(StatusCode),

    #[error("request could not be rebuilt for upstream: {0}")]
    InvalidRequest(#[from] hyper::http::Error),
}

impl ProxyError {
    /// Status sent to the client when no response headers went out yet.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Connect { .. }
            | ProxyError::Upstream(_)
            | ProxyError::UpgradeRefused(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ConnectTimeout { .. } | ProxyError::ResponseTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Connect { .. } => "connect",
            ProxyError::ConnectTimeout { .. } => "connect_timeout",
            ProxyError::Upstream(_) => "upstream",
            ProxyError::ResponseTimeout(_) => "response_timeout",
            ProxyError::UpgradeRefused(_) => "upgrade_refused",
            ProxyError::InvalidRequest(_) => "invalid_request",
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            ProxyError::Connect { .. } => "Bad Gateway: upstream unreachable",
            ProxyError::Upstream(_) => "Bad Gateway: upstream request failed",
            ProxyError::UpgradeRefused(_) => "Bad Gateway: upstream refused upgrade",
            ProxyError::ConnectTimeout { .. } | ProxyError::ResponseTimeout(_) => {
                "Gateway Timeout: upstream did not respond"
            }
            ProxyError::InvalidRequest(_) => "Bad Request",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.public_message(),
        )
            .into_response()
    }
}
