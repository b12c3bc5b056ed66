//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use tls_forward_proxy::config::ProxyConfig;
use tls_forward_proxy::lifecycle::{launch, Shutdown};

/// Key from RFC 6455 section 1.3 and the accept value it yields.
pub const WS_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const WS_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// A running proxy with its own self-signed certificate.
pub struct ProxyFixture {
    pub addr: SocketAddr,
    shutdown: Shutdown,
    cert: CertificateDer<'static>,
    _temp_dir: tempfile::TempDir,
}

impl Drop for ProxyFixture {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

impl ProxyFixture {
    /// Open a TLS session to the proxy as a client trusting its certificate.
    pub async fn connect(&self) -> TlsStream<TcpStream> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.cert.clone()).unwrap();

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let tcp = TcpStream::connect(self.addr).await.unwrap();
        let server_name = ServerName::try_from("localhost").unwrap();
        TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await
            .unwrap()
    }

    /// Send one request over a fresh TLS connection.
    pub async fn send<B>(&self, req: Request<B>) -> Response<Incoming>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let tls = self.connect().await;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .unwrap();
        tokio::spawn(async move {
            let _ = conn.await;
        });
        sender.send_request(req).await.unwrap()
    }
}

/// Start a proxy on an ephemeral port relaying to `127.0.0.1:upstream_port`.
pub async fn start_proxy(upstream_port: u16) -> ProxyFixture {
    start_proxy_with(upstream_port, |_| {}).await
}

pub async fn start_proxy_with(
    upstream_port: u16,
    customize: impl FnOnce(&mut ProxyConfig),
) -> ProxyFixture {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = temp_dir.path().join("cert.pem");
    let key_path = temp_dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.listener.tls.cert_path = cert_path;
    config.listener.tls.key_path = key_path;
    config.upstream.host = "127.0.0.1".into();
    config.upstream.port = upstream_port;
    config.timeouts.connect_secs = 2;
    config.timeouts.response_secs = 5;
    customize(&mut config);

    let proxy = launch(&config).await.unwrap();
    let addr = proxy.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();
    tokio::spawn(async move {
        proxy.run(signal).await.ok();
    });

    ProxyFixture {
        addr,
        shutdown,
        cert: cert.der().clone(),
        _temp_dir: temp_dir,
    }
}

/// A port nothing is listening on.
pub fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// What the mock backend saw.
#[derive(Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Start an HTTP/1.1 backend that records every request.
///
/// Routes: `/health` answers `ok`, `/status/{code}` answers that status,
/// `/echo` answers with the request body, anything else is 404.
pub async fn start_recording_backend() -> (SocketAddr, mpsc::UnboundedReceiver<RecordedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    async move { Ok::<_, Infallible>(backend_response(req, tx).await) }
                });
                let _ = server_http1::Builder::new()
                    .serve_connection(TokioIo::new(socket), svc)
                    .await;
            });
        }
    });

    (addr, rx)
}

async fn backend_response(
    req: Request<Incoming>,
    tx: mpsc::UnboundedSender<RecordedRequest>,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
    let path = parts.uri.path().to_string();

    let _ = tx.send(RecordedRequest {
        method: parts.method,
        uri: parts.uri.to_string(),
        headers: parts.headers,
        body: body.clone(),
    });

    let (status, body) = if path == "/health" {
        (StatusCode::OK, Bytes::from_static(b"ok"))
    } else if path == "/echo" {
        (StatusCode::OK, body)
    } else if let Some(code) = path.strip_prefix("/status/") {
        let status = code.parse().ok().and_then(|c| StatusCode::from_u16(c).ok());
        let status = status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Bytes::from(format!("status {}", status.as_u16())))
    } else {
        (StatusCode::NOT_FOUND, Bytes::from_static(b"not found"))
    };

    Response::builder()
        .status(status)
        .header("x-backend", "mock")
        .body(Full::new(body))
        .unwrap()
}

/// An upgraded connection handed over by the raw upgrade backend.
pub struct UpgradeSession {
    /// Request head as the backend received it.
    pub head: String,
    pub socket: TcpStream,
}

/// Start a raw TCP backend that accepts every upgrade with a 101.
///
/// After the 101 the socket is handed to the test untouched.
pub async fn start_upgrade_backend() -> (SocketAddr, mpsc::UnboundedReceiver<UpgradeSession>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let head = read_head(&mut socket).await;
            let reply = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {WS_ACCEPT}\r\n\
                 Sec-WebSocket-Protocol: chat\r\n\r\n"
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            let _ = tx.send(UpgradeSession { head, socket });
        }
    });

    (addr, rx)
}

/// Start a raw TCP backend that answers every request with `response`
/// written verbatim, then closes.
pub async fn start_raw_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = read_head(&mut socket).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Start a WebSocket backend that answers each JSON text message with an
/// `{"type": "echo", "payload": <message>}` envelope.
pub async fn start_json_echo_backend() -> SocketAddr {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                    let Ok(text) = msg.to_text() else { continue };
                    let Ok(payload) = serde_json::from_str::<serde_json::Value>(text) else {
                        continue;
                    };
                    let reply = serde_json::json!({ "type": "echo", "payload": payload });
                    if ws.send(Message::text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// Raw WebSocket handshake for `path`, as a client would send it.
pub fn upgrade_request(path: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {WS_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: chat\r\n\r\n"
    )
}

/// Read up to and including the blank line ending an HTTP head.
///
/// Reads byte by byte so nothing past the head is consumed.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("timed out reading head")
            .expect("read failed");
        assert!(n > 0, "stream closed mid-head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}
