//! Multi-client chat relay over TCP.
//!
//! A client connects, sends a join frame with its username, and from then
//! on every chat frame it sends is stamped, numbered, and pushed to every
//! other connected client. Frames are length-prefixed JSON (see [`codec`]).
//!
//! - [`server`] accepts connections and drives each session through
//!   handshake, relaying, and teardown.
//! - [`router`] fans messages out through the [`registry`] of active
//!   sessions without ever waiting on a slow recipient.
//! - [`connection`] wraps one transport with a bounded outbound queue.
//! - [`codec`] and [`message`] define the wire format and validation.
//! - [`history`] optionally persists routed messages.
//! - [`cli`] and [`client`] provide the command-line front end.

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;

pub use config::RelayConfig;
pub use message::Message;
pub use server::Server;
