//! The authentication dialogue: prompt the user, send the three-line
//! request, and map the server's verdict.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::sync::mpsc;
use tracing::warn;

use crate::client::pending::PendingTable;
use crate::client::{ClientError, Connection, is_disconnect, write_stdout};
use crate::protocol::{AuthAction, Credentials, Response};

/// How an authentication attempt sequence ended.
pub(crate) enum AuthOutcome {
    /// The server accepted these credentials.
    LoggedIn(Credentials),
    /// The user's input stream ended; time to exit cleanly.
    UserQuit,
    /// The transport died mid-dialogue; the supervisor should reconnect.
    ConnectionLost,
}

/// Prompts and retries until the server accepts a credential pair, the user
/// quits, or the connection dies.
pub(crate) async fn authenticate_with_retry(
    input: &mut mpsc::Receiver<String>,
    conn: &mut Connection,
    pending: &Arc<PendingTable>,
) -> Result<AuthOutcome, ClientError> {
    loop {
        let Some(action) = choose_action(input).await? else {
            return Ok(AuthOutcome::UserQuit);
        };
        let Some(creds) = prompt_credentials(input).await? else {
            return Ok(AuthOutcome::UserQuit);
        };

        // Responses from the previous session may still be queued (the ack
        // for the message that carried `/quit` races the command frame).
        // Route them to their waiters so the next response frame is
        // guaranteed to be the authentication verdict.
        while let Ok(frame) = conn.inbound.responses.try_recv() {
            if !pending.complete(&frame.id, frame.response) {
                warn!(id = %frame.id, "dropping stale response");
            }
        }

        let request = format!(
            "{}\n{}\n{}\n",
            action.as_str(),
            creds.name,
            creds.password
        );
        if let Err(err) = conn.writer.write_all(request.as_bytes()).await {
            if is_disconnect(&err) {
                return Ok(AuthOutcome::ConnectionLost);
            }
            return Err(err.into());
        }

        // Only one authentication response can be pending, so the next
        // response frame is ours regardless of its (empty) id.
        let response = select! {
            maybe_response = conn.inbound.responses.recv() => match maybe_response {
                Some(frame) => frame.response,
                None => return Ok(AuthOutcome::ConnectionLost),
            },
            maybe_err = conn.inbound.errors.recv() => {
                return match maybe_err {
                    Some(ClientError::ServerClosed) | None => Ok(AuthOutcome::ConnectionLost),
                    Some(err) => Err(err),
                };
            }
        };

        match response {
            Response::Ok => return Ok(AuthOutcome::LoggedIn(creds)),
            Response::InvalidCredentials
            | Response::UsernameExists
            | Response::UserAlreadyOnline => {
                write_stdout(response.as_str()).await?;
            }
            other => {
                warn!(response = %other, "unexpected authentication response");
            }
        }
    }
}

/// Prompts until the user picks login or register. `None` when their input
/// stream ends.
async fn choose_action(
    input: &mut mpsc::Receiver<String>,
) -> Result<Option<AuthAction>, ClientError> {
    loop {
        write_stdout("Type r to register, l to login").await?;
        let Some(line) = input.recv().await else {
            return Ok(None);
        };
        if let Some(action) = AuthAction::parse(line.trim()) {
            return Ok(Some(action));
        }
    }
}

/// Prompts for a username and password, re-prompting on empty input.
async fn prompt_credentials(
    input: &mut mpsc::Receiver<String>,
) -> Result<Option<Credentials>, ClientError> {
    let Some(name) = prompt_non_empty(input, "Username:").await? else {
        return Ok(None);
    };
    let Some(password) = prompt_non_empty(input, "Password:").await? else {
        return Ok(None);
    };
    Ok(Some(Credentials { name, password }))
}

async fn prompt_non_empty(
    input: &mut mpsc::Receiver<String>,
    prompt: &str,
) -> Result<Option<String>, ClientError> {
    loop {
        write_stdout(prompt).await?;
        let Some(line) = input.recv().await else {
            return Ok(None);
        };
        let line = line.trim();
        if !line.is_empty() {
            return Ok(Some(line.to_string()));
        }
    }
}
