//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → TLS material → Bind listener → Metrics exporter
//!
//! Shutdown (shutdown.rs):
//!     Trigger → Stop accepting → Drain connections and bridges → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Accepting starts only once every subsystem is up
//! - Shutdown has a grace period, after which in-flight work is abandoned

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use startup::{launch, Proxy, StartupError};
