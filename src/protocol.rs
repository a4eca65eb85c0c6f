//! The line-oriented wire protocol.
//!
//! Every frame is a single LF-terminated line. Clients send tagged messages
//! (`m<id>;<text>`) and three-line authentication requests; the server sends
//! responses (`r<id>;<payload>`), chat deliveries (`m<sender>: <text>`), and
//! commands (`/<name>`). This module only parses and formats lines; it never
//! touches a socket beyond the two buffered line helpers at the bottom.

use std::fmt;
use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Prefix of tagged messages and chat deliveries.
pub const MSG_PREFIX: &str = "m";
/// Prefix of response frames.
pub const RESPONSE_PREFIX: &str = "r";
/// Prefix of command frames, on the wire and inside message text.
pub const CMD_PREFIX: &str = "/";
/// Separates the message id from the rest of a tagged or response frame.
pub const ID_SEPARATOR: &str = ";";

/// Correlates a tagged message with its response. Unique per client process.
pub type MsgId = String;

/// A username/password pair as typed at the auth prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub name: String,
    pub password: String,
}

/// First line of an authentication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Login,
    Register,
}

impl AuthAction {
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "l" => Some(AuthAction::Login),
            "r" => Some(AuthAction::Register),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthAction::Login => "l",
            AuthAction::Register => "r",
        }
    }
}

/// Payload of a response frame: the outcome of an authentication attempt or
/// of a broadcast. Not an error type; every sent message gets exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Ok,
    InvalidCredentials,
    UsernameExists,
    UserAlreadyOnline,
    MsgFailedForSome,
    MsgFailedForAll,
}

impl Response {
    pub fn parse(payload: &str) -> Option<Self> {
        match payload {
            "Ok" => Some(Response::Ok),
            "InvalidCredentials" => Some(Response::InvalidCredentials),
            "UsernameExists" => Some(Response::UsernameExists),
            "UserAlreadyOnline" => Some(Response::UserAlreadyOnline),
            "MsgFailedForSome" => Some(Response::MsgFailedForSome),
            "MsgFailedForAll" => Some(Response::MsgFailedForAll),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Response::Ok => "Ok",
            Response::InvalidCredentials => "InvalidCredentials",
            Response::UsernameExists => "UsernameExists",
            Response::UserAlreadyOnline => "UserAlreadyOnline",
            Response::MsgFailedForSome => "MsgFailedForSome",
            Response::MsgFailedForAll => "MsgFailedForAll",
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command carried over the wire with a `/` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    Quit,
    Other(String),
}

impl Cmd {
    /// Parses a command name, without its `/` prefix.
    pub fn parse(name: &str) -> Self {
        match name {
            "quit" => Cmd::Quit,
            other => Cmd::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Cmd::Quit => "quit",
            Cmd::Other(name) => name,
        }
    }
}

/// A response frame as sent by the server. The id is empty for
/// authentication responses, which are matched positionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    pub id: MsgId,
    pub response: Response,
}

/// Everything the server can push at a client, classified by leading bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Response(ServerResponse),
    /// Body of a chat delivery, already in `<sender>: <text>` form.
    Chat(String),
    Command(Cmd),
}

/// Classifies one server-sent line. `None` means the line matches no frame
/// shape and should be logged and dropped by the receiver.
pub fn parse_server_frame(line: &str) -> Option<ServerFrame> {
    if let Some(rest) = line.strip_prefix(RESPONSE_PREFIX) {
        if let Some((id, payload)) = rest.split_once(ID_SEPARATOR) {
            if let Some(response) = Response::parse(payload) {
                return Some(ServerFrame::Response(ServerResponse {
                    id: id.to_string(),
                    response,
                }));
            }
        }
    }
    if let Some(body) = line.strip_prefix(MSG_PREFIX) {
        return Some(ServerFrame::Chat(body.to_string()));
    }
    if let Some(name) = line.strip_prefix(CMD_PREFIX) {
        return Some(ServerFrame::Command(Cmd::parse(name)));
    }
    None
}

/// Splits a client-sent `m<id>;<text>` line into its id and text.
pub fn parse_tagged_message(line: &str) -> Option<(MsgId, &str)> {
    let rest = line.strip_prefix(MSG_PREFIX)?;
    let (id, text) = rest.split_once(ID_SEPARATOR)?;
    Some((id.to_string(), text))
}

pub fn tagged_message_line(id: &str, text: &str) -> String {
    format!("{MSG_PREFIX}{id}{ID_SEPARATOR}{text}")
}

pub fn response_line(id: &str, response: Response) -> String {
    format!("{RESPONSE_PREFIX}{id}{ID_SEPARATOR}{response}")
}

pub fn chat_delivery_line(sender: &str, content: &str) -> String {
    format!("{MSG_PREFIX}{sender}: {content}")
}

pub fn command_line(cmd: &Cmd) -> String {
    format!("{CMD_PREFIX}{}", cmd.name())
}

/// Reads one line, stripped of its terminator. `None` on EOF. Empty lines
/// come through as-is; the auth dialogue treats them like any other input.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Writes one line, appends the LF delimiter, and flushes so peers get
/// timely frames.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
