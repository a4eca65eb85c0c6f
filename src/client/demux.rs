//! Splits the server's line stream into typed channels.
//!
//! One spawned task reads lines and classifies each by its frame shape:
//! responses, chat deliveries, and server commands each get their own
//! bounded channel, and the first read failure lands on the error channel
//! before the task exits. Lines that match no frame are logged and dropped.

use tokio::io::{AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::client::ClientError;
use crate::config;
use crate::protocol::{self, Cmd, ServerFrame, ServerResponse};

/// Receiving ends of a demultiplexed connection. The channels stay usable
/// across relogs on the same stream.
pub(crate) struct Inbound {
    pub responses: mpsc::Receiver<ServerResponse>,
    pub chats: mpsc::Receiver<String>,
    pub commands: mpsc::Receiver<Cmd>,
    pub errors: mpsc::Receiver<ClientError>,
}

/// Spawns the demultiplexer task over the read half of a connection.
pub(crate) fn spawn<R>(read_half: R) -> Inbound
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (responses_tx, responses) = mpsc::channel(config::CHANNEL_CAPACITY);
    let (chats_tx, chats) = mpsc::channel(config::CHANNEL_CAPACITY);
    let (commands_tx, commands) = mpsc::channel(config::CHANNEL_CAPACITY);
    let (errors_tx, errors) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            let line = match protocol::read_line(&mut reader).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    let _ = errors_tx.send(ClientError::ServerClosed).await;
                    return;
                }
                Err(err) => {
                    let _ = errors_tx.send(err.into()).await;
                    return;
                }
            };

            let delivered = match protocol::parse_server_frame(&line) {
                Some(ServerFrame::Response(response)) => responses_tx.send(response).await.is_ok(),
                Some(ServerFrame::Chat(body)) => chats_tx.send(body).await.is_ok(),
                Some(ServerFrame::Command(cmd)) => commands_tx.send(cmd).await.is_ok(),
                None => {
                    warn!(line = %line, "odd line from server");
                    true
                }
            };
            if !delivered {
                // The session side hung up; nothing left to feed.
                return;
            }
        }
    });

    Inbound {
        responses,
        chats,
        commands,
        errors,
    }
}
