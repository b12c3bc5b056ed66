//! Upstream connections.
//!
//! Every exchange gets its own TCP connection and HTTP/1.1 handshake; there
//! is no pool. The connection lives exactly as long as the exchange that
//! opened it.

use std::time::Duration;

use axum::body::Body;
use hyper::client::conn::http1::{self, Connection, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::config::UpstreamConfig;
use crate::http::error::ProxyError;

pub type UpstreamIo = TokioIo<TcpStream>;

/// The fixed backend.
#[derive(Debug, Clone)]
pub struct Upstream {
    host: String,
    port: u16,
    authority: String,
    connect_timeout: Duration,
}

impl Upstream {
    pub fn new(config: &UpstreamConfig, connect_timeout: Duration) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            authority: config.authority(),
            connect_timeout,
        }
    }

    /// `host:port` of the backend.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Open a fresh connection and complete the HTTP/1.1 client handshake.
    ///
    /// The caller must drive the returned `Connection` (usually on its own
    /// task) for the `SendRequest` half to make progress.
    pub async fn open(
        &self,
    ) -> Result<(SendRequest<Body>, Connection<UpstreamIo, Body>), ProxyError> {
        let stream = self.connect().await?;
        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        Ok((sender, conn))
    }

    async fn connect(&self) -> Result<TcpStream, ProxyError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| ProxyError::ConnectTimeout {
                addr: self.authority.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|source| ProxyError::Connect {
                addr: self.authority.clone(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on upstream socket");
        }
        tracing::trace!(upstream = %self.authority, "Upstream connection established");
        Ok(stream)
    }
}
