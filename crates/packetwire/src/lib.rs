//! Delimiter-framed packet transport over TCP and IPC sockets.
//!
//! packetwire turns a raw duplex byte stream into addressable packets
//! (id, headers, payload), multiplexes concurrent requests over one
//! connection with 2-byte stream ids, and manages client and server
//! connection lifecycles.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP and Unix-domain socket endpoints, connect and listen
//! - [`frame`]: Packet model and the delimiter-framed codec
//! - [`session`]: Connections, sessions, builders and request correlation
//!   (behind the default `session` feature)

/// Re-export transport types.
pub mod transport {
    pub use packetwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use packetwire_frame::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use packetwire_session::*;
}
