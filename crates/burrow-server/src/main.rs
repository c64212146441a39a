//! Burrow - reverse tunnel ingress server
//!
//! Publishes services running behind NAT on public endpoints. Clients
//! connect one control connection, advertise tunnels, and open pipe
//! connections on demand; user traffic is multiplexed over the pipes.

mod server;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burrow_control::{EncryptMode, ServerConfig};
use server::IngressServer;

/// Burrow - reverse tunnel ingress server
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "Reverse tunnel ingress server")]
#[command(version)]
struct Cli {
    /// Path to a JSON config file; flags override its values
    #[arg(long, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// Address the control listener binds to (e.g. 0.0.0.0:4443)
    #[arg(long, env = "BURROW_BIND_ADDR")]
    bind_addr: Option<SocketAddr>,

    /// IP public tunnel listeners bind to
    #[arg(long, env = "BURROW_LISTEN_IP")]
    listen_ip: Option<IpAddr>,

    /// Domain advertised in tunnel hostnames
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: Option<String>,

    /// Shared port advertised for http tunnels
    #[arg(long)]
    http_port: Option<u16>,

    /// Shared port advertised for https tunnels
    #[arg(long)]
    https_port: Option<u16>,

    /// Run pipes without encryption
    #[arg(long)]
    plaintext: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&json).context("parsing config file")?
        }
        None => ServerConfig::default(),
    };

    if let Some(bind_addr) = cli.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(listen_ip) = cli.listen_ip {
        config.listen_ip = listen_ip;
    }
    if let Some(domain) = &cli.domain {
        config.server_domain = domain.clone();
    }
    if let Some(http_port) = cli.http_port {
        config.http_port = http_port;
    }
    if let Some(https_port) = cli.https_port {
        config.https_port = https_port;
    }
    if cli.plaintext {
        config.encrypt_mode = EncryptMode::None;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli)?;
    let server = IngressServer::new(config);
    server.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "burrow-server",
            "--bind-addr",
            "127.0.0.1:9000",
            "--domain",
            "tunnel.example.com",
            "--https-port",
            "8443",
            "--plaintext",
        ]);
        let config = load_config(&cli).unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.server_domain, "tunnel.example.com");
        assert_eq!(config.https_port, 8443);
        assert_eq!(config.encrypt_mode, EncryptMode::None);
        // Untouched fields keep their defaults
        assert_eq!(config.http_port, 80);
    }

    #[test]
    fn test_defaults_without_flags() {
        let cli = Cli::parse_from(["burrow-server"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.encrypt_mode, EncryptMode::Aead);
        assert_eq!(config.tuning.max_streams, 6);
    }
}
