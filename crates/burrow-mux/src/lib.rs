//! Stream multiplexer for burrow pipe connections
//!
//! A pipe is one transport connection carrying many logical streams. The
//! stream-initiating side opens streams by name; the other side accepts
//! them. Both directions carry opaque bytes once a stream is open.

pub mod frame;
pub mod session;
pub mod stream;

pub use frame::{Frame, FrameType, StreamId};
pub use session::{Conn, MuxConfig, MuxError, MuxSession};
pub use stream::MuxStream;
