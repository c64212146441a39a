//! Wire protocol definitions for the burrow tunnel system
//!
//! Defines the control-channel and pipe-channel message types and the
//! length-prefixed codec that frames them on the wire.

pub mod codec;
pub mod messages;

pub use codec::{read_message, write_message, CodecError, MessageCodec};
pub use messages::{Message, Protocol, TunnelConfig};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Length of the nonce carried in a pipe hello
pub const PIPE_NONCE_LEN: usize = 16;
