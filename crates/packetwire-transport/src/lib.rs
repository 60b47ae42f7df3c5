//! Socket primitives for packetwire.
//!
//! Provides a unified interface over the two duplex byte transports the
//! framing layer runs on:
//! - TCP sockets
//! - Unix domain sockets (IPC, Linux/macOS)
//!
//! This is the lowest layer of packetwire. Everything else builds on top of
//! the [`SocketStream`] and [`SocketListener`] types provided here.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;

pub use endpoint::{ConnectOpts, Endpoint, ListenOpts};
pub use error::{Result, TransportError};
pub use listener::SocketListener;
pub use stream::{connect, SocketStream};
