//! Multi-client TCP text relay.
//!
//! A server accepts any number of clients and forwards every piece of text one client
//! sends to all the others. The wire is a raw byte stream with no length prefix; see
//! [`framing`] for how reads are turned into messages. Each module has one job:
//!
//! - [`connection`] owns a single client connection behind a synchronous, thread-safe
//!   API: blocking connect, synchronous send, and a non-blocking inbound queue that a
//!   render loop drains once per tick.
//! - [`server`] accepts connections, tracks them in a [`server::ClientRegistry`], and
//!   fans each received unit out to every other member through per-client queues.
//! - [`framing`] chooses between best-effort chunk delivery and newline framing.
//! - [`error`] holds the connect, send and server error types.
//! - [`cli`] and [`client`] are the command-line server/client entry points.

pub mod cli;
pub mod client;
pub mod connection;
pub mod error;
pub mod framing;
pub mod server;

pub use connection::ConnectionManager;
pub use error::{ConnectError, SendError, ServerError};
pub use framing::Framing;
pub use server::{BroadcastServer, ClientRegistry, ServerConfig};
