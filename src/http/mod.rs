//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TLS connection
//!     → server.rs (hyper HTTP/1.1, request ID, tracing)
//!     → forward.rs (plain request or upgrade?)
//!         plain   → request.rs (forwarding headers) → upstream.rs → relay response
//!         upgrade → websocket.rs (backend handshake, 101, byte bridge)
//!     → error.rs (502/504 when the backend fails before answering)
//! ```

pub mod error;
pub mod forward;
pub mod request;
pub mod response;
pub mod server;
pub mod upstream;
pub mod websocket;

pub use error::ProxyError;
pub use forward::Forwarder;
pub use server::ProxyServer;
pub use websocket::{bridge, BridgeEnd, BridgeError, BridgeStats};
