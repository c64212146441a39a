//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Tunnel protocol on the public side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
    Https,
}

impl Protocol {
    /// True for protocols that get a dedicated kernel listener
    pub fn is_l4(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Http => "http",
            Protocol::Https => "https",
        };
        f.write_str(s)
    }
}

/// Per-tunnel configuration, sent by the client in `AddTunnels` and
/// echoed back with the server-allocated endpoint filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub protocol: Protocol,
    /// Server domain; rewritten by the server before the echo
    pub hostname: String,
    /// Sub-domain label, allocated by the server for http/https tunnels
    pub subdomain: Option<String>,
    /// Address the client forwards to on its side
    pub local_addr: String,
    /// Public port; OS-chosen for tcp, the shared port for http/https
    pub remote_port: u16,
}

impl TunnelConfig {
    /// Public address this tunnel is reachable at, also the registry key:
    /// `host:port` for L4 tunnels, `subdomain.hostname` for L7 tunnels.
    pub fn public_addr(&self) -> String {
        match self.protocol {
            Protocol::Tcp | Protocol::Udp => format!("{}:{}", self.hostname, self.remote_port),
            Protocol::Http | Protocol::Https => format!(
                "{}.{}",
                self.subdomain.as_deref().unwrap_or_default(),
                self.hostname
            ),
        }
    }
}

/// The single wire enum for both control and pipe channels.
///
/// A connection identifies itself with its first frame: a
/// `ControlClientHello` starts a control session, a `PipeClientHello`
/// attaches the connection as a pipe to an existing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    ControlClientHello {
        auth_token: Option<String>,
        /// Client's ephemeral public key when encryption is on
        cipher_key: Option<Vec<u8>>,
    },
    ControlServerHello {
        client_id: Uuid,
        /// Server's ephemeral public key when encryption is on
        cipher_key: Option<Vec<u8>>,
    },
    /// Request (client → server) and echo-back (server → client) once
    /// public endpoints are allocated.
    AddTunnels {
        tunnels: HashMap<String, TunnelConfig>,
    },
    /// Server asks the client to open one more pipe connection
    PipeReq,
    Ping,
    Pong,
    PipeClientHello {
        client_id: Uuid,
        nonce: [u8; crate::PIPE_NONCE_LEN],
    },
    /// Server-side failure surfaced to the client (per-tunnel setup
    /// errors, protocol rejections)
    Error {
        reason: String,
    },
}
