//! Per-connection state machine: the authentication dialogue, the logged-in
//! dispatch loop, and the inbox forwarder.
//!
//! Each connection runs an outer loop so a user the server logged out can
//! authenticate again on the same stream. Inside a logged-in session two
//! activities run concurrently: the handler task itself reads and dispatches
//! client lines, and a spawned forwarder drains the session inbox onto the
//! stream. The first terminal condition wins and tears the session down;
//! logout runs exactly once per session on the way out.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::{self, AuthAction, CMD_PREFIX, Cmd, Credentials, Response};
use crate::server::hub::{ChatMessage, Hub};

/// Both the dispatcher and the forwarder write frames, so the write half is
/// shared behind a lock; each frame is written whole before the lock drops.
type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

type LineReader = BufReader<OwnedReadHalf>;

/// How a logged-in session ended.
enum SessionEnd {
    /// The server logged the user out; the stream is still good and goes
    /// back to the auth dialogue.
    Relog,
    /// The peer is gone for good.
    Disconnect,
}

#[derive(Debug, Error)]
enum SessionError {
    #[error("client hung up")]
    ClientQuit,
    #[error("malformed input line: {0:?}")]
    OddInput(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub(crate) async fn handle_connection(stream: TcpStream, hub: Arc<Hub>) {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let writer: SharedWriter = Arc::new(Mutex::new(write_half));

    loop {
        match serve_session(&mut reader, &writer, &hub).await {
            Ok(SessionEnd::Relog) => continue,
            Ok(SessionEnd::Disconnect) | Err(SessionError::ClientQuit) => break,
            Err(err) => {
                warn!(?peer, %err, "session ended with error");
                break;
            }
        }
    }

    debug!(?peer, "client disconnected");
}

/// One full pass through the state machine: authenticate, serve until a
/// terminal condition, log out.
async fn serve_session(
    reader: &mut LineReader,
    writer: &SharedWriter,
    hub: &Arc<Hub>,
) -> Result<SessionEnd, SessionError> {
    let Some((creds, inbox)) = accept_auth(reader, writer, hub).await? else {
        // EOF before the dialogue completed: the user hung up quietly.
        return Ok(SessionEnd::Disconnect);
    };

    let result = logged_in(reader, writer, hub, &creds, inbox).await;
    hub.logout(&creds.name).await;
    result
}

/// The AUTH state: read action, name, and password lines, try them against
/// the hub, and loop until a request is accepted or the client goes away.
async fn accept_auth(
    reader: &mut LineReader,
    writer: &SharedWriter,
    hub: &Arc<Hub>,
) -> Result<Option<(Credentials, mpsc::Receiver<ChatMessage>)>, SessionError> {
    loop {
        let Some(action_line) = protocol::read_line(reader).await? else {
            return Ok(None);
        };
        let Some(action) = AuthAction::parse(&action_line) else {
            return Err(SessionError::OddInput(action_line));
        };
        let Some(name) = protocol::read_line(reader).await? else {
            return Ok(None);
        };
        let Some(password) = protocol::read_line(reader).await? else {
            return Ok(None);
        };

        let creds = Credentials { name, password };
        let (session, inbox) = Hub::new_session();
        let response = hub.authenticate(action, &creds, session).await;
        send_line(writer, &protocol::response_line("", response)).await?;
        if response == Response::Ok {
            return Ok(Some((creds, inbox)));
        }
    }
}

/// The LOGGED_IN state. Dispatches client lines in this task while the
/// spawned forwarder drains the inbox; whichever hits a terminal condition
/// first decides the outcome, and the forwarder is stopped before returning
/// so a relog gets a quiet stream.
async fn logged_in(
    reader: &mut LineReader,
    writer: &SharedWriter,
    hub: &Arc<Hub>,
    creds: &Credentials,
    inbox: mpsc::Receiver<ChatMessage>,
) -> Result<SessionEnd, SessionError> {
    let (errs_tx, mut errs_rx) = mpsc::channel::<SessionError>(1);
    let (stop_tx, stop_rx) = oneshot::channel();

    let forwarder = tokio::spawn(forward_inbox(inbox, Arc::clone(writer), errs_tx, stop_rx));

    let dispatch = dispatch_lines(reader, writer, hub, &creds.name);
    tokio::pin!(dispatch);

    let result = tokio::select! {
        result = &mut dispatch => result,
        Some(err) = errs_rx.recv() => Err(err),
    };

    let _ = stop_tx.send(());
    match &result {
        // On a relog the stream lives on, so wait for the forwarder to park
        // between messages rather than cutting it off mid-frame.
        Ok(SessionEnd::Relog) => {
            let _ = forwarder.await;
        }
        _ => {
            forwarder.abort();
            let _ = forwarder.await;
        }
    }
    result
}

/// Reads tagged messages and dispatches them: commands get an immediate Ok
/// response and then run; everything else is broadcast, and the response
/// carries the fan-out outcome.
async fn dispatch_lines(
    reader: &mut LineReader,
    writer: &SharedWriter,
    hub: &Arc<Hub>,
    name: &str,
) -> Result<SessionEnd, SessionError> {
    loop {
        let Some(line) = protocol::read_line(reader).await? else {
            return Err(SessionError::ClientQuit);
        };
        let (id, text) = match protocol::parse_tagged_message(&line) {
            Some(parsed) => parsed,
            None => return Err(SessionError::OddInput(line)),
        };

        if let Some(cmd_name) = text.strip_prefix(CMD_PREFIX) {
            send_line(writer, &protocol::response_line(&id, Response::Ok)).await?;
            match Cmd::parse(cmd_name) {
                Cmd::Quit => {
                    send_line(writer, &protocol::command_line(&Cmd::Quit)).await?;
                    info!(user = %name, "logged out by request");
                    return Ok(SessionEnd::Relog);
                }
                Cmd::Other(other) => {
                    debug!(user = %name, command = %other, "ignoring unknown command");
                }
            }
        } else {
            let response = hub.broadcast(text, name).await;
            send_line(writer, &protocol::response_line(&id, response)).await?;
        }
    }
}

/// Drains the session inbox onto the stream and acks each message once its
/// line is flushed. Stops between messages when told to, or reports the
/// first write failure and exits.
async fn forward_inbox(
    mut inbox: mpsc::Receiver<ChatMessage>,
    writer: SharedWriter,
    errs: mpsc::Sender<SessionError>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let message = tokio::select! {
            _ = &mut stop => return,
            message = inbox.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };

        let line = protocol::chat_delivery_line(&message.sender, &message.content);
        if let Err(err) = send_line(&writer, &line).await {
            let _ = errs.try_send(err.into());
            return;
        }
        message.delivered();
    }
}

async fn send_line(writer: &SharedWriter, line: &str) -> io::Result<()> {
    let mut writer = writer.lock().await;
    protocol::write_line(&mut *writer, line).await
}
