//! The logged-in loop: ship user lines to the server, route responses
//! through the pending table, print incoming chat, and obey server
//! commands.

use std::sync::Arc;

use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::warn;

use crate::client::pending::{PendingTable, next_msg_id};
use crate::client::{ClientError, Connection, is_disconnect, write_stdout};
use crate::config;
use crate::protocol::{self, Cmd, MsgId, Response};

/// Why the logged-in loop ended.
pub(crate) enum SessionEnd {
    /// The server logged us out; re-authenticate on the same stream.
    Relog,
    /// The user's input stream ended; exit cleanly.
    Quit,
    /// The transport died or timed out; back off and dial again.
    Reconnect,
}

pub(crate) async fn run(
    input: &mut mpsc::Receiver<String>,
    conn: &mut Connection,
    pending: &Arc<PendingTable>,
) -> Result<SessionEnd, ClientError> {
    loop {
        select! {
            maybe_line = input.recv() => {
                let Some(line) = maybe_line else {
                    return Ok(SessionEnd::Quit);
                };
                let text = line.trim_end();
                if text.is_empty() {
                    continue;
                }
                match send_tagged(conn, pending, text).await {
                    Ok(()) => {}
                    Err(ClientError::SendTimedOut) => return Ok(SessionEnd::Reconnect),
                    Err(ClientError::Io(err)) if is_disconnect(&err) => {
                        return Ok(SessionEnd::Reconnect);
                    }
                    Err(err) => return Err(err),
                }
            }
            maybe_frame = conn.inbound.responses.recv() => {
                let Some(frame) = maybe_frame else {
                    return Ok(SessionEnd::Reconnect);
                };
                if !pending.complete(&frame.id, frame.response) {
                    // A late response whose ack timer already fired, or an
                    // id we never sent; not worth the session either way.
                    warn!(id = %frame.id, "response for an id we were not waiting on");
                }
            }
            maybe_chat = conn.inbound.chats.recv() => {
                let Some(body) = maybe_chat else {
                    return Ok(SessionEnd::Reconnect);
                };
                write_stdout(&body).await?;
            }
            maybe_cmd = conn.inbound.commands.recv() => {
                let Some(cmd) = maybe_cmd else {
                    return Ok(SessionEnd::Reconnect);
                };
                match cmd {
                    Cmd::Quit => {
                        write_stdout("Logged out").await?;
                        return Ok(SessionEnd::Relog);
                    }
                    Cmd::Other(name) => warn!(command = %name, "unknown command from server"),
                }
            }
            maybe_err = conn.inbound.errors.recv() => {
                return match maybe_err {
                    Some(ClientError::ServerClosed) | None => Ok(SessionEnd::Reconnect),
                    Some(ClientError::Io(err)) if is_disconnect(&err) => Ok(SessionEnd::Reconnect),
                    Some(err) => Err(err),
                };
            }
        }
    }
}

/// Tags the text with a fresh id, registers it in the pending table, writes
/// the frame under the send deadline, and leaves a waiter behind to reap
/// the response or the timeout.
async fn send_tagged(
    conn: &mut Connection,
    pending: &Arc<PendingTable>,
    text: &str,
) -> Result<(), ClientError> {
    let id = next_msg_id();
    let slot = pending.insert(id.clone());
    let line = protocol::tagged_message_line(&id, text);

    match timeout(
        config::MSG_SEND_TIMEOUT,
        protocol::write_line(&mut conn.writer, &line),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            pending.remove(&id);
            return Err(err.into());
        }
        Err(_) => {
            pending.remove(&id);
            return Err(ClientError::SendTimedOut);
        }
    }

    tokio::spawn(await_ack(Arc::clone(pending), id, slot));
    Ok(())
}

/// Waits for the response to one message. A timeout is logged and clears
/// the pending entry; it never tears the session down.
async fn await_ack(pending: Arc<PendingTable>, id: MsgId, slot: oneshot::Receiver<Response>) {
    match timeout(config::MSG_ACK_TIMEOUT, slot).await {
        Ok(Ok(response)) => {
            if response != Response::Ok {
                // Partial or failed delivery; surface the payload string.
                let _ = write_stdout(response.as_str()).await;
            }
        }
        // The session tore down and dropped the table with our entry.
        Ok(Err(_)) => {}
        Err(_) => {
            pending.remove(&id);
            warn!(id = %id, "message was never acknowledged");
        }
    }
}
