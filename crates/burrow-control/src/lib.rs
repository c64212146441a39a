//! Control plane for the burrow ingress server
//!
//! A control session owns one client's control connection, its tunnels,
//! and its pool of multiplexed pipe connections. Process-wide registries
//! index live sessions and public tunnel addresses for the pipe handshake
//! and the L7 router.

pub mod config;
pub mod control;
pub mod handshake;
pub mod hooks;
mod pool;
pub mod registry;
pub mod tunnel;

pub use config::{ControlTuning, EncryptMode, ServerConfig};
pub use control::Control;
pub use handshake::{ControlPlane, HandshakeError};
pub use hooks::{AllowAllAuth, AuthProvider, HookError, MemberNotifier, NoopNotifier};
pub use registry::{Registry, TunnelEntry};
pub use tunnel::{dispatch_stream, Tunnel, TunnelError};
