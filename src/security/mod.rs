//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → headers.rs (replace X-Forwarded-*, X-Real-IP)
//!     → Forwarding engine
//! ```
//!
//! # Design Decisions
//! - No trust in client-supplied forwarding headers
//! - No policy enforcement: the proxy only augments headers

pub mod headers;

pub use headers::apply_forwarding_headers;
