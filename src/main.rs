//! tls-forward-proxy
//!
//! Terminates TLS for clients and relays every request, including WebSocket
//! upgrades, to a single plaintext HTTP/1.1 backend.
//!
//! ```text
//!   Client ──HTTPS/WSS──► ┌──────────────────────────────┐ ──HTTP/WS──► Backend
//!                         │ net (listener, TLS)          │
//!                         │  → http (server, forwarder)  │
//!                         │    → relay  or  bridge       │
//!                         └──────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use tls_forward_proxy::config::{load_config, validate_config, ConfigError, ProxyConfig};
use tls_forward_proxy::lifecycle::{launch, signals, Shutdown};
use tls_forward_proxy::observability::logging;

#[derive(Parser, Debug)]
#[command(name = "tls-forward-proxy")]
#[command(about = "TLS-terminating reverse proxy with WebSocket bridging", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept TLS connections on, e.g. 0.0.0.0:18790
    #[arg(long)]
    listen: Option<String>,

    /// PEM certificate chain
    #[arg(long)]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    key: Option<PathBuf>,

    #[arg(long)]
    upstream_host: Option<String>,

    #[arg(long)]
    upstream_port: Option<u16>,

    /// trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(listen) = self.listen {
            config.listener.bind_address = listen;
        }
        if let Some(cert) = self.cert {
            config.listener.tls.cert_path = cert;
        }
        if let Some(key) = self.key {
            config.listener.tls.key_path = key;
        }
        if let Some(host) = self.upstream_host {
            config.upstream.host = host;
        }
        if let Some(port) = self.upstream_port {
            config.upstream.port = port;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
    }
}

fn resolve_config(cli: Cli) -> Result<ProxyConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(Cli::parse())?;

    logging::init(&config.observability.log_level);

    tracing::info!("tls-forward-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.authority(),
        max_connections = config.listener.max_connections,
        "Configuration loaded"
    );

    let proxy = launch(&config).await?;
    tracing::info!(address = %proxy.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    tokio::spawn(signals::trigger_on_signal(shutdown.clone()));

    proxy.run(shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
