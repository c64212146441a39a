//! Tunnel listeners and stream dispatch
//!
//! `AddTunnels` processing allocates public endpoints, starts per-tunnel
//! accept loops for TCP, and echoes the rewritten configs back. Each
//! accepted user connection is spliced onto a pipe stream.

use std::collections::HashMap;
use std::sync::Arc;

use burrow_mux::Conn;
use burrow_proto::{Message, Protocol, TunnelConfig};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::control::Control;
use crate::registry::TunnelEntry;

/// Per-tunnel setup errors; fatal to that tunnel only
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("binding {protocol} listener: {source}")]
    Bind {
        protocol: Protocol,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol {0} is not supported")]
    Unsupported(Protocol),
}

/// A tunnel owned by a control session
pub struct Tunnel {
    pub name: String,
    pub public_addr: String,
    /// Accept loop for L4 tunnels; aborted during teardown, which drops
    /// the listener. L7 tunnels have no listener of their own.
    pub(crate) accept_task: Option<JoinHandle<()>>,
}

impl Control {
    /// Handle an `AddTunnels` request: allocate endpoints, register, and
    /// echo the rewritten configs. A tunnel that fails setup is skipped
    /// and reported with an `Error` frame; the others proceed.
    pub(crate) async fn add_tunnels(self: &Arc<Self>, request: HashMap<String, TunnelConfig>) {
        let mut accepted: HashMap<String, TunnelConfig> = HashMap::new();

        for (name, mut config) in request {
            config.hostname = self.server_config().server_domain.clone();

            match self.open_tunnel(&name, &mut config).await {
                Ok(tunnel) => {
                    let public_addr = tunnel.public_addr.clone();
                    self.registry().insert_tunnel(
                        public_addr.clone(),
                        TunnelEntry {
                            name: name.clone(),
                            config: config.clone(),
                            control: Arc::downgrade(self),
                        },
                    );
                    if self.server_config().notify_enabled {
                        if let Err(err) = self
                            .notifier()
                            .add_member(&self.server_config().server_domain, &public_addr)
                            .await
                        {
                            error!(
                                error = %err,
                                public_addr = %public_addr,
                                "notify add member failed"
                            );
                        }
                    }
                    self.tunnels.lock().unwrap().push(tunnel);
                    accepted.insert(name, config);
                }
                Err(err) => {
                    warn!(
                        client_id = %self.client_id(),
                        tunnel = %name,
                        error = %err,
                        "tunnel setup failed"
                    );
                    self.send(Message::Error {
                        reason: format!("tunnel {name}: {err}"),
                    })
                    .await;
                }
            }
        }

        // Echo the allocation so the client learns its public endpoints
        self.send(Message::AddTunnels { tunnels: accepted }).await;
    }

    /// Allocate one tunnel's public endpoint and start its accept loop
    async fn open_tunnel(
        self: &Arc<Self>,
        name: &str,
        config: &mut TunnelConfig,
    ) -> Result<Tunnel, TunnelError> {
        let accept_task = match config.protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind((self.server_config().listen_ip, 0))
                    .await
                    .map_err(|source| TunnelError::Bind {
                        protocol: config.protocol,
                        source,
                    })?;
                let port = listener
                    .local_addr()
                    .map_err(|source| TunnelError::Bind {
                        protocol: config.protocol,
                        source,
                    })?
                    .port();
                config.remote_port = port;
                info!(
                    client_id = %self.client_id(),
                    tunnel = name,
                    port,
                    "tcp tunnel listening"
                );
                Some(tokio::spawn(accept_loop(
                    self.clone(),
                    listener,
                    name.to_string(),
                )))
            }
            // Real UDP proxying needs a connectionless relay, which this
            // server does not implement
            Protocol::Udp => return Err(TunnelError::Unsupported(Protocol::Udp)),
            Protocol::Http => {
                config.subdomain = Some(self.registry().next_subdomain());
                config.remote_port = self.server_config().http_port;
                None
            }
            Protocol::Https => {
                config.subdomain = Some(self.registry().next_subdomain());
                config.remote_port = self.server_config().https_port;
                None
            }
        };

        if accept_task.is_none() {
            info!(
                client_id = %self.client_id(),
                tunnel = name,
                subdomain = config.subdomain.as_deref().unwrap_or_default(),
                port = config.remote_port,
                "l7 tunnel registered"
            );
        }

        Ok(Tunnel {
            name: name.to_string(),
            public_addr: config.public_addr(),
            accept_task,
        })
    }
}

/// Accept loop for one L4 tunnel. An accept error ends only this
/// listener; the session keeps serving its other tunnels.
async fn accept_loop(control: Arc<Control>, listener: TcpListener, tunnel_name: String) {
    let mut die = control.subscribe_die();
    loop {
        tokio::select! {
            _ = die.wait_for(|dead| *dead) => return,
            result = listener.accept() => match result {
                Ok((conn, peer_addr)) => {
                    debug!(tunnel = %tunnel_name, peer = %peer_addr, "accepted user connection");
                    tokio::spawn(dispatch_stream(
                        control.clone(),
                        conn,
                        tunnel_name.clone(),
                    ));
                }
                Err(err) => {
                    warn!(tunnel = %tunnel_name, error = %err, "accept failed");
                    return;
                }
            },
        }
    }
}

/// Splice one user connection onto a pipe stream.
///
/// The pipe is returned to the pool right after the stream opens:
/// capacity, not exclusivity, gates sharing, so up to the stream cap of
/// dispatchers ride the same pipe. Either copy direction finishing
/// closes both ends; the opposite copy dies on read error.
pub async fn dispatch_stream<C>(control: Arc<Control>, user_conn: C, tunnel_name: String)
where
    C: Conn + 'static,
{
    let Some(pipe) = control.get_pipe().await else {
        // Session is dying; dropping the connection closes it
        return;
    };

    let stream = match pipe.open_stream(&tunnel_name) {
        Ok(stream) => stream,
        Err(err) => {
            debug!(tunnel = %tunnel_name, error = %err, "opening stream failed");
            control.put_pipe(pipe).await;
            return;
        }
    };
    control.put_pipe(pipe).await;

    let (mut user_read, mut user_write) = tokio::io::split(user_conn);
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);
    tokio::select! {
        _ = tokio::io::copy(&mut user_read, &mut stream_write) => {}
        _ = tokio::io::copy(&mut stream_read, &mut user_write) => {}
    }
    debug!(tunnel = %tunnel_name, "user connection finished");
}
