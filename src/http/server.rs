//! TLS connection server.
//!
//! # Responsibilities
//! - Accept TCP connections under the connection limit
//! - Complete the TLS handshake within its deadline
//! - Serve HTTP/1.1 with upgrades on each connection
//! - Wire up middleware (request ID, tracing)
//! - Stop accepting on shutdown and drain in-flight work

use std::net::SocketAddr;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::{ProxyConfig, TimeoutConfig};
use crate::http::forward::Forwarder;
use crate::lifecycle::ShutdownSignal;
use crate::net::{ConnectionLease, ConnectionTracker, Listener, ListenerError, SharedLease};

/// Back-off after a failed accept so a persistent error does not spin.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(200);

/// HTTPS front of the proxy.
pub struct ProxyServer {
    tls: TlsAcceptor,
    forwarder: Forwarder,
    timeouts: TimeoutConfig,
    connections: ConnectionTracker,
    bridges: ConnectionTracker,
}

impl ProxyServer {
    pub fn new(config: &ProxyConfig, tls: TlsAcceptor) -> Self {
        let bridges = ConnectionTracker::new();
        Self {
            tls,
            forwarder: Forwarder::new(config, bridges.clone()),
            timeouts: config.timeouts.clone(),
            connections: ConnectionTracker::new(),
            bridges,
        }
    }

    /// Tracker of open client connections, upgraded ones included.
    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    /// Tracker of live upgrade bridges.
    pub fn bridges(&self) -> &ConnectionTracker {
        &self.bridges
    }

    /// Accept and serve connections until `shutdown` fires, then drain.
    ///
    /// Open connections get the grace period to finish; bridges that are
    /// still running after it are abandoned with the runtime.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), ListenerError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(address = %addr, upstream = %self.forwarder.upstream.authority(), "Proxy server starting");
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer, permit) = match accepted {
                Ok(conn) => conn,
                Err(ListenerError::Closed) => return Err(ListenerError::Closed),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    continue;
                }
            };

            let lease = ConnectionLease::new(permit, self.connections.track());
            let span = tracing::info_span!("connection", id = %lease.id(), peer = %peer);
            let lease = SharedLease::new(lease);
            let conn = Connection {
                tls: self.tls.clone(),
                forwarder: self.forwarder.clone(),
                timeouts: self.timeouts.clone(),
                shutdown: shutdown.clone(),
            };
            tokio::spawn(
                async move {
                    conn.serve(stream, peer, lease.clone()).await;
                    // Still here unless an upgrade moved it into a bridge.
                    drop(lease.take());
                }
                .instrument(span),
            );
        }
        drop(listener);

        tracing::info!(
            connections = self.connections.active_count(),
            bridges = self.bridges.active_count(),
            "Shutdown requested, draining"
        );
        let grace = self.timeouts.shutdown_grace();
        let drained = self.connections.wait_idle(grace).await && self.bridges.wait_idle(grace).await;
        if drained {
            tracing::info!("Proxy server stopped");
        } else {
            tracing::warn!(
                connections = self.connections.active_count(),
                bridges = self.bridges.active_count(),
                "Grace period elapsed with work still in flight"
            );
        }
        Ok(())
    }
}

/// Everything one spawned connection task needs.
struct Connection {
    tls: TlsAcceptor,
    forwarder: Forwarder,
    timeouts: TimeoutConfig,
    shutdown: ShutdownSignal,
}

impl Connection {
    async fn serve(mut self, stream: TcpStream, peer: SocketAddr, lease: SharedLease) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on client socket");
        }

        let tls = match tokio::time::timeout(self.timeouts.tls_handshake(), self.tls.accept(stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                tracing::debug!("TLS handshake timed out");
                return;
            }
        };

        lease.establish();
        tracing::debug!("TLS session established");

        let forwarder = self.forwarder;
        let svc = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .service_fn(move |mut req: Request<Incoming>| {
                let forwarder = forwarder.clone();
                req.extensions_mut().insert(lease.clone());
                async move { forwarder.handle(req, peer).await }
            });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.timeouts.header_read());
        let conn = builder
            .serve_connection(TokioIo::new(tls), TowerToHyperService::new(svc))
            .with_upgrades();
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = self.shutdown.recv() => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "Connection closed with error");
        }

        tracing::debug!("Connection closed");
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("upstream", &self.forwarder.upstream.authority())
            .field("connections", &self.connections.active_count())
            .field("bridges", &self.bridges.active_count())
            .finish()
    }
}
