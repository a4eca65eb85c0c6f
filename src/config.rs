//! Tunable constants shared by the server and the client.

use std::time::Duration;

/// Deadline for one outbound wire write and for a whole broadcast fan-out.
pub const MSG_SEND_TIMEOUT: Duration = Duration::from_millis(200);

/// How long the client waits for the server's response to a sent message.
pub const MSG_ACK_TIMEOUT: Duration = Duration::from_millis(300);

/// Client sleep between connection attempts after the server goes away.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Bounded inbox per logged-in session on the server side.
pub const INBOX_CAPACITY: usize = 8;

/// Capacity of the client-side demultiplexer and user-input channels.
pub const CHANNEL_CAPACITY: usize = 128;
