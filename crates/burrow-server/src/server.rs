//! Accept loop for control and pipe connections

use anyhow::{Context, Result};
use burrow_control::{ControlPlane, ServerConfig};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// The server process: one control plane plus the listener feeding it
pub struct IngressServer {
    plane: ControlPlane,
}

impl IngressServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            plane: ControlPlane::new(config),
        }
    }

    /// Bind the control port and serve until ctrl-c.
    ///
    /// Every inbound connection runs the first-frame dispatch in its own
    /// task; a failed handshake costs only that connection.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = self.plane.config().bind_addr;
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("binding control listener on {bind_addr}"))?;
        info!(addr = %listener.local_addr()?, "burrow server listening");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested, closing live sessions");
                    for control in self.plane.registry().controls() {
                        control.close();
                    }
                    return Ok(());
                }
                result = listener.accept() => {
                    let (conn, peer_addr) = result.context("accepting connection")?;
                    debug!(peer = %peer_addr, "inbound connection");
                    let plane = self.plane.clone();
                    tokio::spawn(async move {
                        if let Err(err) = plane.handle_connection(conn).await {
                            warn!(peer = %peer_addr, error = %err, "handshake failed");
                        }
                    });
                }
            }
        }
    }
}
