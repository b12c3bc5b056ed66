//! Startup orchestration.
//!
//! # Responsibilities
//! - Load TLS material
//! - Bind the listener
//! - Install the metrics exporter when enabled
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Nothing is accepted until `Proxy::run`, so traffic only flows when ready

use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;
use thiserror::Error;

use crate::config::ProxyConfig;
use crate::http::ProxyServer;
use crate::lifecycle::ShutdownSignal;
use crate::net::{load_tls_acceptor, Listener, ListenerError, TlsError};
use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("invalid metrics address {0:?}")]
    MetricsAddress(String),

    #[error("failed to install metrics exporter: {0}")]
    Metrics(#[from] BuildError),
}

/// A bound, not yet running proxy.
#[derive(Debug)]
pub struct Proxy {
    server: ProxyServer,
    listener: Listener,
}

impl Proxy {
    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn server(&self) -> &ProxyServer {
        &self.server
    }

    /// Serve until `shutdown` fires, then drain.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), ListenerError> {
        self.server.run(self.listener, shutdown).await
    }
}

/// Bring up every subsystem for an already validated config.
pub async fn launch(config: &ProxyConfig) -> Result<Proxy, StartupError> {
    let tls = load_tls_acceptor(&config.listener.tls.cert_path, &config.listener.tls.key_path)?;
    tracing::info!(
        cert = %config.listener.tls.cert_path.display(),
        "TLS certificate loaded"
    );

    let server = ProxyServer::new(config, tls);
    let listener = Listener::bind(&config.listener).await?;

    if config.observability.metrics_enabled {
        let addr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::MetricsAddress(config.observability.metrics_address.clone()))?;
        metrics::init_metrics(addr)?;
    }

    Ok(Proxy { server, listener })
}
