use std::net::{Ipv4Addr, SocketAddr};

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TCP port the server listens on and the client dials. 0 binds an
    /// ephemeral port in server mode.
    pub port: u16,

    /// Which half of the system to run.
    #[arg(value_enum)]
    pub mode: Mode,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

/// Address the server binds: all IPv4 interfaces on the given port.
pub fn listen_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

/// Address the client dials: the local server on the given port.
pub fn dial_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}
