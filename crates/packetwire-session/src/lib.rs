//! Transport sessions over packetwire frames.
//!
//! This is the layer client and server code hold on to:
//! - [`Connection`] owns a socket, its reader task and teardown
//! - [`TransportSession`] sends and receives [`Packet`](packetwire_frame::Packet)s
//! - [`ClientBuilder`] / [`ServerBuilder`] dial and accept sessions
//! - [`RequestCorrelator`] matches responses to requests by stream id

pub mod connection;
pub mod connector;
pub mod correlator;
pub mod error;
pub mod ids;
pub mod listener;
pub mod session;

pub use connection::{Connection, ErrorSubscription, Subscription};
pub use connector::{AttemptState, ClientBuilder};
pub use correlator::{RequestCorrelator, ResponseStream};
pub use error::{Result, SessionError};
pub use ids::StreamIdAllocator;
pub use listener::{Incoming, ServerBuilder, SessionListener};
pub use session::{Ack, ErrorStream, PacketStream, TransportSession};
