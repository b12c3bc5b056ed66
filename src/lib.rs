//! TLS-terminating reverse proxy with WebSocket bridging.
//!
//! Clients speak HTTPS to the proxy; every request is relayed over a fresh
//! plaintext HTTP/1.1 connection to one fixed upstream. Upgrade requests are
//! negotiated with the upstream and, once it answers 101, turned into a raw
//! byte bridge between the TLS client and the TCP backend.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::ProxyConfig;
pub use http::{Forwarder, ProxyError, ProxyServer};
pub use lifecycle::{launch, Proxy, Shutdown, ShutdownSignal};
