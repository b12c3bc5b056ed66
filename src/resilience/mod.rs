//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Exchange with the backend:
//!     → connect timeout (upstream.rs)
//!     → response-head timeout (forward.rs, websocket.rs)
//!     → timeouts.rs (idle limit on streamed bodies)
//!     → bridge idle limit (websocket.rs)
//! ```
//!
//! # Design Decisions
//! - Every wait on a peer has a deadline
//! - No retries; every exchange is attempted once

pub mod timeouts;

pub use timeouts::{IdleTimeout, IdleTimeoutBody};
