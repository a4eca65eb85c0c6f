//! Correlates outbound tagged messages with the server's responses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;

use crate::protocol::{MsgId, Response};

static NEXT_MSG_ID: AtomicU64 = AtomicU64::new(1);

/// Reserves a fresh message id, unique for the lifetime of this process.
pub fn next_msg_id() -> MsgId {
    NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed).to_string()
}

/// Table of message ids awaiting a response. An entry lives from the moment
/// its message is sent until the response arrives or the ack timeout fires,
/// whichever happens first; both paths remove it.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<MsgId, oneshot::Sender<Response>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in the response for `id` and hands back the slot
    /// it will arrive on.
    pub fn insert(&self, id: MsgId) -> oneshot::Receiver<Response> {
        let (ack, slot) = oneshot::channel();
        self.entries.lock().unwrap().insert(id, ack);
        slot
    }

    /// Routes a response to whoever awaits `id`, consuming the entry.
    /// Returns false when the id is unknown, which on a live connection
    /// means the server answered a message this client never sent.
    pub fn complete(&self, id: &str, response: Response) -> bool {
        match self.entries.lock().unwrap().remove(id) {
            Some(ack) => {
                // The waiter may have timed out already; the response is
                // then simply dropped.
                let _ = ack.send(response);
                true
            }
            None => false,
        }
    }

    /// Drops the entry for `id`, called by the waiter when its ack timeout
    /// fires first.
    pub fn remove(&self, id: &str) -> bool {
        self.entries.lock().unwrap().remove(id).is_some()
    }
}
