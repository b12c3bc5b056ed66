//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses parse and value ranges (timeouts > 0, ports valid)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address `{0}` is not a socket address")]
    BindAddress(String),

    #[error("listener.max_connections must be greater than zero")]
    MaxConnections,

    #[error("listener.tls.{0} must not be empty")]
    TlsPath(&'static str),

    #[error("upstream.host must not be empty")]
    UpstreamHost,

    #[error("upstream.port must not be zero")]
    UpstreamPort,

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("observability.log_level `{0}` is not one of trace, debug, info, warn, error")]
    LogLevel(String),

    #[error("observability.metrics_address `{0}` is not a socket address")]
    MetricsAddress(String),
}

/// Validate a configuration, collecting every violation.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(listener.bind_address.clone()));
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::MaxConnections);
    }
    if listener.tls.cert_path.as_os_str().is_empty() {
        errors.push(ValidationError::TlsPath("cert_path"));
    }
    if listener.tls.key_path.as_os_str().is_empty() {
        errors.push(ValidationError::TlsPath("key_path"));
    }

    if config.upstream.host.trim().is_empty() {
        errors.push(ValidationError::UpstreamHost);
    }
    if config.upstream.port == 0 {
        errors.push(ValidationError::UpstreamPort);
    }

    let timeouts = &config.timeouts;
    for (name, value) in [
        ("tls_handshake_secs", timeouts.tls_handshake_secs),
        ("header_read_secs", timeouts.header_read_secs),
        ("connect_secs", timeouts.connect_secs),
        ("response_secs", timeouts.response_secs),
        ("idle_secs", timeouts.idle_secs),
        ("shutdown_grace_secs", timeouts.shutdown_grace_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroTimeout(name));
        }
    }

    let observability = &config.observability;
    if !LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::LogLevel(observability.log_level.clone()));
    }
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
