//! A multi-user line-oriented chat service over TCP.
//!
//! One binary runs either half. The server authenticates clients against an
//! in-memory user store and fans each message out to every other active
//! session, reporting the aggregate outcome to the sender. The client
//! connects, runs the auth dialogue, and then multiplexes user input with
//! server frames, reconnecting when the server goes away.
//!
//! Each module owns a concrete responsibility:
//!
//! - [`cli`] parses the `<port> <client|server>` command line.
//! - [`config`] holds the timeouts, backoff, and channel capacities.
//! - [`protocol`] is the wire codec: frame parsing and formatting plus the
//!   line read/write helpers.
//! - [`server`] accepts connections and drives one handler state machine
//!   per client over the shared hub.
//! - [`client`] supervises connect, authenticate, and chat loops for a
//!   terminal user.
//!
//! Integration tests exercise the server over real sockets and both halves
//! end to end through spawned processes.

pub mod cli;
pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
