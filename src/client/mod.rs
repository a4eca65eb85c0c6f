//! The client half: a supervisor that keeps the user connected across
//! server logouts and restarts.
//!
//! Three nested loops: connect with backoff, authenticate with retry, then
//! run the logged-in session until something terminal happens. A server
//! logout drops back to the auth dialogue on the same stream; a dead
//! transport backs off and dials again; the end of the user's input exits
//! cleanly.

mod auth;
mod demux;
pub mod pending;
mod session;

use std::io;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::cli;
use crate::client::auth::AuthOutcome;
use crate::client::demux::Inbound;
use crate::client::pending::PendingTable;
use crate::client::session::SessionEnd;
use crate::config;

/// Terminal conditions of a client session.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server closed the connection")]
    ServerClosed,
    #[error("timed out writing to the server")]
    SendTimedOut,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One live connection: the demultiplexed read side plus the write half.
pub(crate) struct Connection {
    pub inbound: Inbound,
    pub writer: OwnedWriteHalf,
}

/// Connects, authenticates, and chats until the user's input ends or an
/// unrecoverable error surfaces.
pub async fn run(port: u16) -> Result<()> {
    let addr = cli::dial_addr(port);
    let mut input = spawn_user_input();

    'reconnect: loop {
        let stream = connect_with_retry(addr).await?;
        info!("connected to {addr}");
        let (read_half, write_half) = stream.into_split();
        let mut conn = Connection {
            inbound: demux::spawn(read_half),
            writer: write_half,
        };
        // One table per connection: it outlives relogs so responses that
        // straddle a logout still find their waiters.
        let pending = Arc::new(PendingTable::new());

        loop {
            let creds =
                match auth::authenticate_with_retry(&mut input, &mut conn, &pending).await? {
                    AuthOutcome::LoggedIn(creds) => creds,
                    AuthOutcome::UserQuit => {
                        shutdown_connection(&mut conn).await;
                        return Ok(());
                    }
                    AuthOutcome::ConnectionLost => continue 'reconnect,
                };

            write_stdout(&format!("Logged in as {}", creds.name)).await?;
            write_stdout("").await?;

            match session::run(&mut input, &mut conn, &pending).await? {
                SessionEnd::Relog => continue,
                SessionEnd::Quit => {
                    shutdown_connection(&mut conn).await;
                    return Ok(());
                }
                SessionEnd::Reconnect => {
                    write_stdout("Server closed, retrying in 5 seconds").await?;
                    sleep(config::RECONNECT_BACKOFF).await;
                    continue 'reconnect;
                }
            }
        }
    }
}

/// Dials until the server answers, sleeping out refused attempts. Any
/// other connect error is unrecoverable.
async fn connect_with_retry(addr: std::net::SocketAddr) -> Result<TcpStream> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                info!("connection refused, retrying in 5 seconds");
                sleep(config::RECONNECT_BACKOFF).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn shutdown_connection(conn: &mut Connection) {
    if let Err(error) = conn.writer.shutdown().await {
        debug!(?error, "failed to shut the connection down cleanly");
    }
}

/// Feeds the user's lines through a channel that survives reconnects.
/// Dropping the sender marks the end of input.
fn spawn_user_input() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(config::CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                return;
            }
        }
    });
    rx
}

/// True for I/O errors that mean the peer went away rather than that
/// something is wrong locally.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

pub(crate) async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
