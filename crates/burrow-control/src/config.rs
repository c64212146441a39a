//! Server and control-session configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// How pipe connections are protected on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptMode {
    /// Pipes carry plaintext mux frames
    None,
    /// Pipes are wrapped in an AEAD cipher keyed per pipe
    Aead,
}

/// Tunables for one control session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlTuning {
    /// Idle pipes kept parked before eviction kicks in
    pub max_idle_pipes: usize,
    /// Streams per pipe before it counts as busy
    pub max_streams: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub clean_interval: Duration,
    /// How long to wait for a pipe after asking the client for one
    pub pipe_req_timeout: Duration,
    pub write_chan_buffer: usize,
    /// Receive-buffer target handed to each pipe's mux session
    pub mux_receive_buffer: usize,
}

impl Default for ControlTuning {
    fn default() -> Self {
        Self {
            max_idle_pipes: 3,
            max_streams: 6,
            ping_interval: Duration::from_secs(8),
            ping_timeout: Duration::from_secs(17),
            clean_interval: Duration::from_secs(5),
            pipe_req_timeout: Duration::from_secs(12),
            write_chan_buffer: 128,
            mux_receive_buffer: 4 * 1024 * 1024,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the control/pipe listener binds to
    pub bind_addr: SocketAddr,
    /// IP public tunnel listeners bind to
    pub listen_ip: IpAddr,
    /// Domain advertised in tunnel hostnames
    pub server_domain: String,
    /// Shared port advertised for http tunnels
    pub http_port: u16,
    /// Shared port advertised for https tunnels
    pub https_port: u16,
    pub encrypt_mode: EncryptMode,
    pub auth_enabled: bool,
    pub notify_enabled: bool,
    pub tuning: ControlTuning,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4443),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_domain: "localhost".to_string(),
            http_port: 80,
            https_port: 443,
            encrypt_mode: EncryptMode::Aead,
            auth_enabled: false,
            notify_enabled: false,
            tuning: ControlTuning::default(),
        }
    }
}
