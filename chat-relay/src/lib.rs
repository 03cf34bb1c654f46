//! Line-oriented TCP chat relay.
//!
//! Every client gets a short identifier on connect, picks a nickname, and from
//! then on each line it sends is relayed to every other connected client,
//! tagged with the sender's identifier and nickname. Each module owns one
//! concern:
//!
//! - [`id`] allocates identifiers unique among connected clients.
//! - [`command`] interprets client lines (`/nick`, `/quit`, `/id`, chat).
//! - [`message`] renders the wire lines and writes them.
//! - [`session`] drives one connection through negotiation and chat.
//! - [`registry`] tracks Active sessions and fans broadcasts out to them.
//! - [`server`] runs the accept loop and coordinates shutdown.
//! - [`console`] and [`client`] are the admin and user front ends used by the
//!   binary.
//!
//! Integration tests drive a real [`server::RelayServer`] over TCP.

pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod console;
pub mod error;
pub mod id;
pub mod input;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
