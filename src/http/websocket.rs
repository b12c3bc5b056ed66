//! Upgrade handling and byte bridging.
//!
//! # Responsibilities
//! - Replay the client's upgrade request on a fresh upstream connection
//! - Answer the client with the backend's own 101 once it accepts
//! - Shovel raw bytes both ways until either side closes or goes idle
//!
//! # Data Flow
//! ```text
//! Client ──upgrade──► Proxy ──upgrade──► Backend
//!        ◄───101───         ◄───101───
//! Client ◄════ raw bytes (TLS) ════► Proxy ◄════ raw bytes (TCP) ════► Backend
//! ```
//!
//! # Design Decisions
//! - Bytes are relayed as-is; WebSocket frames are never parsed
//! - No reply is written when the backend cannot be reached or refuses
//! - Closing either side closes the other

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Body;
use hyper::body::Incoming;
use hyper::header::UPGRADE;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::time::Instant;
use tracing::Instrument;

use crate::http::error::ProxyError;
use crate::http::forward::Forwarder;
use crate::http::request::{prepare_upstream_head, upgrade_protocol};
use crate::http::response::switching_protocols;
use crate::net::SharedLease;
use crate::observability::metrics;

const BUFFER_SIZE: usize = 16 * 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which way bytes were flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => f.write_str("client->upstream"),
            Direction::UpstreamToClient => f.write_str("upstream->client"),
        }
    }
}

/// What ended a bridge that closed cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    Client,
    Upstream,
    Idle,
}

/// Bytes moved by a finished bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub closed_by: BridgeEnd,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("protocol upgrade failed: {0}")]
    Upgrade(#[from] hyper::Error),

    #[error("upgraded streams not ready in time")]
    HandshakeTimeout,

    #[error("{direction} relay failed: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: std::io::Error,
        client_to_upstream: u64,
        upstream_to_client: u64,
    },
}

impl BridgeError {
    /// Bytes moved `(client_to_upstream, upstream_to_client)` before failing.
    pub fn transferred(&self) -> (u64, u64) {
        match self {
            BridgeError::Io {
                client_to_upstream,
                upstream_to_client,
                ..
            } => (*client_to_upstream, *upstream_to_client),
            _ => (0, 0),
        }
    }
}

impl Forwarder {
    /// Negotiate an upgrade with the backend and, on success, bridge.
    ///
    /// Returns the 101 to send to the client. The bridge itself runs on its
    /// own task once hyper hands over both upgraded streams.
    pub(crate) async fn upgrade<B>(
        &self,
        mut req: Request<B>,
        peer: SocketAddr,
    ) -> Result<Response<Body>, ProxyError> {
        let client_upgrade = hyper::upgrade::on(&mut req);
        let connection = req.extensions_mut().remove::<SharedLease>();
        let requested = req.headers().get(UPGRADE).cloned();
        let protocol = upgrade_protocol(req.headers()).unwrap_or_default();

        let (mut parts, _) = req.into_parts();
        prepare_upstream_head(&mut parts, peer, self.upstream.authority());
        parts.method = Method::GET;
        let upstream_req = Request::from_parts(parts, Body::empty());

        tracing::debug!(
            protocol = %protocol,
            uri = %upstream_req.uri(),
            upstream = %self.upstream.authority(),
            "Forwarding upgrade request"
        );

        let mut upstream_res = match self.upgrade_exchange(upstream_req).await {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(
                    protocol = %protocol,
                    kind = e.kind(),
                    error = %e,
                    "Upgrade failed, dropping client connection"
                );
                metrics::record_upstream_error(e.kind());
                return Err(e);
            }
        };

        let upstream_upgrade = hyper::upgrade::on(&mut upstream_res);
        let reply = switching_protocols(upstream_res.headers(), requested.as_ref());

        // The client socket now belongs to the bridge, slot included.
        let lease = connection.and_then(|shared| shared.take());
        let guard = self.bridges.track();
        let idle = self.idle_timeout;
        tokio::spawn(
            async move {
                let _lease = lease;
                let _guard = guard;
                metrics::bridge_opened();
                match open_bridge(client_upgrade, upstream_upgrade, idle).await {
                    Ok(stats) => {
                        tracing::info!(
                            client_to_upstream = stats.client_to_upstream,
                            upstream_to_client = stats.upstream_to_client,
                            closed_by = ?stats.closed_by,
                            "Bridge closed"
                        );
                        metrics::bridge_closed(stats.client_to_upstream, stats.upstream_to_client);
                    }
                    Err(e) => {
                        let (client_to_upstream, upstream_to_client) = e.transferred();
                        tracing::debug!(
                            client_to_upstream,
                            upstream_to_client,
                            error = %e,
                            "Bridge closed with error"
                        );
                        metrics::bridge_closed(client_to_upstream, upstream_to_client);
                    }
                }
            }
            .in_current_span(),
        );

        tracing::info!(protocol = %protocol, "Upgrade accepted by upstream");
        Ok(reply)
    }

    async fn upgrade_exchange(&self, req: Request<Body>) -> Result<Response<Incoming>, ProxyError> {
        let (mut sender, conn) = self.upstream.open().await?;
        tokio::spawn(
            async move {
                if let Err(e) = conn.with_upgrades().await {
                    tracing::debug!(error = %e, "Upstream upgrade connection closed with error");
                }
            }
            .in_current_span(),
        );

        let res = tokio::time::timeout(self.response_timeout, sender.send_request(req))
            .await
            .map_err(|_| ProxyError::ResponseTimeout(self.response_timeout))??;

        if res.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(ProxyError::UpgradeRefused(res.status()));
        }
        Ok(res)
    }
}

async fn open_bridge(
    client: OnUpgrade,
    upstream: OnUpgrade,
    idle: Duration,
) -> Result<BridgeStats, BridgeError> {
    let (client, upstream) = tokio::time::timeout(idle, async { tokio::try_join!(client, upstream) })
        .await
        .map_err(|_| BridgeError::HandshakeTimeout)??;

    bridge(TokioIo::new(client), TokioIo::new(upstream), idle).await
}

/// Copy bytes between two streams until one closes or both go quiet.
///
/// Each direction runs as its own pump, so a peer that stops reading only
/// holds up the bytes headed its way. Every chunk is written and flushed
/// before the next read on that side. The first pump to finish (or the idle
/// watchdog) ends the bridge, and both write halves are then shut down so
/// the surviving peer sees the close.
pub async fn bridge<C, U>(client: C, upstream: U, idle: Duration) -> Result<BridgeStats, BridgeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
    let client_to_upstream = AtomicU64::new(0);
    let upstream_to_client = AtomicU64::new(0);
    let activity = Activity::new();

    let outcome = tokio::select! {
        result = pump(&mut client_rd, &mut upstream_wr, &client_to_upstream, &activity, idle) => {
            result.map(|()| BridgeEnd::Client).map_err(|e| (Direction::ClientToUpstream, e))
        }
        result = pump(&mut upstream_rd, &mut client_wr, &upstream_to_client, &activity, idle) => {
            result.map(|()| BridgeEnd::Upstream).map_err(|e| (Direction::UpstreamToClient, e))
        }
        _ = watchdog(&activity, idle) => Ok(BridgeEnd::Idle),
    };

    close(&mut client_wr).await;
    close(&mut upstream_wr).await;

    let client_to_upstream = client_to_upstream.into_inner();
    let upstream_to_client = upstream_to_client.into_inner();
    match outcome {
        Ok(closed_by) => Ok(BridgeStats {
            client_to_upstream,
            upstream_to_client,
            closed_by,
        }),
        Err((direction, source)) => Err(BridgeError::Io {
            direction,
            source,
            client_to_upstream,
            upstream_to_client,
        }),
    }
}

/// Last time bytes moved in either direction, shared by both pumps.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn deadline(&self, idle: Duration) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed)) + idle
    }
}

/// Move bytes one way until the reader hits EOF.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    moved: &AtomicU64,
    activity: &Activity,
    idle: Duration,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        activity.touch();
        relay(writer, &buf[..n], idle).await?;
        moved.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

/// Resolves once neither direction has moved a byte for `idle`.
async fn watchdog(activity: &Activity, idle: Duration) {
    loop {
        let deadline = activity.deadline(idle);
        if deadline <= Instant::now() {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

async fn relay<W>(writer: &mut W, chunk: &[u8], idle: Duration) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(chunk).await?;
        writer.flush().await
    };
    tokio::time::timeout(idle, write)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "peer stopped reading"))?
}

async fn close<W: AsyncWrite>(writer: &mut WriteHalf<W>) {
    if let Ok(Err(e)) = tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
        tracing::trace!(error = %e, "Shutdown of bridged stream failed");
    }
}
