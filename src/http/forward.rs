//! Forwarding engine: request/response path.
//!
//! # Responsibilities
//! - Dispatch each request to the relay or the upgrade bridge
//! - Stream the request body up and the response body back
//! - Turn failures before response headers into 502/504
//!
//! # Data Flow
//! ```text
//! client request ──► forwarding headers ──► fresh upstream connection
//!                                                 │
//! client response ◄── status/headers/body ◄───────┘  (verbatim)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::IntoResponse;
use axum::BoxError;
use hyper::body::Bytes;
use hyper::{Request, Response};
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::http::error::ProxyError;
use crate::http::request::{is_upgrade_request, prepare_upstream_head};
use crate::http::upstream::Upstream;
use crate::net::ConnectionTracker;
use crate::observability::metrics;
use crate::resilience::IdleTimeoutBody;

/// Relays requests and upgrades to the fixed upstream.
///
/// Cheap to clone; one clone is handed to each connection's service.
#[derive(Debug, Clone)]
pub struct Forwarder {
    pub(crate) upstream: Arc<Upstream>,
    pub(crate) response_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) bridges: ConnectionTracker,
}

impl Forwarder {
    /// `bridges` counts live upgrade bridges so shutdown can wait for them.
    pub fn new(config: &ProxyConfig, bridges: ConnectionTracker) -> Self {
        let timeouts = &config.timeouts;
        Self {
            upstream: Arc::new(Upstream::new(&config.upstream, timeouts.connect())),
            response_timeout: timeouts.response(),
            idle_timeout: timeouts.idle(),
            bridges,
        }
    }

    /// Handle one client request.
    ///
    /// Relay failures become error responses. Upgrade failures are returned
    /// as `Err` so the connection is dropped without writing anything.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        peer: SocketAddr,
    ) -> Result<Response<Body>, ProxyError>
    where
        B: hyper::body::Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        if is_upgrade_request(&req) {
            return self.upgrade(req, peer).await;
        }

        let response = self
            .forward(req, peer)
            .await
            .unwrap_or_else(IntoResponse::into_response);
        Ok(response)
    }

    /// One-shot relay of a plain request.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        peer: SocketAddr,
    ) -> Result<Response<Body>, ProxyError>
    where
        B: hyper::body::Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        let start = Instant::now();
        let method = req.method().clone();

        let (mut parts, body) = req.into_parts();
        prepare_upstream_head(&mut parts, peer, self.upstream.authority());
        let body = Body::new(IdleTimeoutBody::new(body, self.idle_timeout));
        let upstream_req = Request::from_parts(parts, body);

        tracing::debug!(
            method = %method,
            uri = %upstream_req.uri(),
            upstream = %self.upstream.authority(),
            "Forwarding request"
        );

        let result = self.exchange(upstream_req).await;
        match result {
            Ok(response) => {
                metrics::record_request(method.as_str(), response.status().as_u16(), start);
                let idle = self.idle_timeout;
                Ok(response.map(|body| Body::new(IdleTimeoutBody::new(body, idle))))
            }
            Err(e) => {
                tracing::warn!(method = %method, kind = e.kind(), error = %e, "Upstream request failed");
                metrics::record_upstream_error(e.kind());
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        req: Request<Body>,
    ) -> Result<Response<hyper::body::Incoming>, ProxyError> {
        let (mut sender, conn) = self.upstream.open().await?;
        tokio::spawn(
            async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "Upstream connection closed with error");
                }
            }
            .in_current_span(),
        );

        tokio::time::timeout(self.response_timeout, sender.send_request(req))
            .await
            .map_err(|_| ProxyError::ResponseTimeout(self.response_timeout))?
            .map_err(ProxyError::from)
    }
}
