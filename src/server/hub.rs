//! Process-wide registry of known users and active sessions, plus the
//! broadcast engine.
//!
//! The two maps are guarded by their own locks. Authentication takes both
//! write locks for the whole check-and-insert so a name can never end up
//! with two live sessions. Broadcast only snapshots the session map under
//! the read lock and delivers lock-free, so one slow recipient can never
//! stall logins or other broadcasts.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

use crate::config;
use crate::protocol::{AuthAction, Credentials, Response};

/// One chat line in flight from a sender to a single recipient. The
/// one-shot fires once the recipient has flushed the line to its stream,
/// and never blocks the acker.
pub struct ChatMessage {
    pub sender: String,
    pub content: String,
    done: oneshot::Sender<()>,
}

impl ChatMessage {
    fn new(sender: String, content: String) -> (Self, oneshot::Receiver<()>) {
        let (done, delivered) = oneshot::channel();
        (
            Self {
                sender,
                content,
                done,
            },
            delivered,
        )
    }

    /// Signals the broadcaster that this message reached the recipient's
    /// stream. The broadcaster may already have given up on the deadline;
    /// that is fine, the signal is simply dropped.
    pub fn delivered(self) {
        let _ = self.done.send(());
    }
}

/// The hub's handle on one logged-in connection: where broadcasts for that
/// user get queued.
pub struct SessionHandle {
    inbox: mpsc::Sender<ChatMessage>,
}

#[derive(Debug, Error)]
enum DeliveryError {
    #[error("delivery timed out")]
    TimedOut,
    #[error("recipient session is gone")]
    Closed,
}

#[derive(Default)]
pub struct Hub {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    users: RwLock<HashMap<String, String>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the inbox pair for a prospective session. The handle goes to
    /// [`Hub::authenticate`]; the receiver stays with the connection handler
    /// that forwards messages to its client.
    pub fn new_session() -> (SessionHandle, mpsc::Receiver<ChatMessage>) {
        let (inbox, receiver) = mpsc::channel(config::INBOX_CAPACITY);
        (SessionHandle { inbox }, receiver)
    }

    /// Checks the credentials and, on success, installs the session. The
    /// check and the insert happen under both write locks, so concurrent
    /// attempts on the same name serialize and exactly one wins.
    pub async fn authenticate(
        &self,
        action: AuthAction,
        creds: &Credentials,
        session: SessionHandle,
    ) -> Response {
        let mut sessions = self.sessions.write().await;
        let mut users = self.users.write().await;

        match action {
            AuthAction::Login => match users.get(&creds.name) {
                Some(password) if *password == creds.password => {
                    if sessions.contains_key(&creds.name) {
                        Response::UserAlreadyOnline
                    } else {
                        sessions.insert(creds.name.clone(), session);
                        info!(user = %creds.name, "logged in");
                        Response::Ok
                    }
                }
                _ => Response::InvalidCredentials,
            },
            AuthAction::Register => {
                if users.contains_key(&creds.name) {
                    Response::UsernameExists
                } else {
                    users.insert(creds.name.clone(), creds.password.clone());
                    sessions.insert(creds.name.clone(), session);
                    info!(user = %creds.name, "registered");
                    Response::Ok
                }
            }
        }
    }

    /// Removes the session for `name`. A name that is not logged in is a
    /// no-op, so calling this twice is harmless.
    pub async fn logout(&self, name: &str) {
        if self.sessions.write().await.remove(name).is_some() {
            info!(user = %name, "logged out");
        }
    }

    /// Fans `content` out to every active session except the sender, all
    /// under one shared deadline, and reports the aggregate outcome.
    ///
    /// Recipients are snapshotted up front: the session lock must not be
    /// held while deliveries block, and a session that joins mid-broadcast
    /// was simply not part of this one.
    pub async fn broadcast(&self, content: &str, sender: &str) -> Response {
        let recipients: Vec<(String, mpsc::Sender<ChatMessage>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(name, _)| name.as_str() != sender)
                .map(|(name, session)| (name.clone(), session.inbox.clone()))
                .collect()
        };
        if recipients.is_empty() {
            return Response::Ok;
        }

        let total = recipients.len();
        let deadline = Instant::now() + config::MSG_SEND_TIMEOUT;
        let mut deliveries = JoinSet::new();
        for (name, inbox) in recipients {
            let (message, delivered) = ChatMessage::new(sender.to_string(), content.to_string());
            deliveries.spawn(async move {
                deliver(inbox, message, delivered, deadline)
                    .await
                    .map_err(|err| (name, err))
            });
        }

        let mut succeeded = 0;
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err((name, err))) => {
                    warn!(recipient = %name, %err, "failed to deliver broadcast")
                }
                Err(err) => warn!(%err, "delivery task failed"),
            }
        }

        if succeeded == total {
            Response::Ok
        } else if succeeded > 0 {
            Response::MsgFailedForSome
        } else {
            Response::MsgFailedForAll
        }
    }
}

/// Queues the message on the recipient's inbox, then waits for its handler
/// to confirm the line hit the stream. Both steps race the shared deadline.
async fn deliver(
    inbox: mpsc::Sender<ChatMessage>,
    message: ChatMessage,
    delivered: oneshot::Receiver<()>,
    deadline: Instant,
) -> Result<(), DeliveryError> {
    timeout_at(deadline, inbox.send(message))
        .await
        .map_err(|_| DeliveryError::TimedOut)?
        .map_err(|_| DeliveryError::Closed)?;
    timeout_at(deadline, delivered)
        .await
        .map_err(|_| DeliveryError::TimedOut)?
        .map_err(|_| DeliveryError::Closed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn join(
        hub: &Hub,
        action: AuthAction,
        name: &str,
        password: &str,
    ) -> (Response, mpsc::Receiver<ChatMessage>) {
        let (session, inbox) = Hub::new_session();
        let creds = Credentials {
            name: name.to_string(),
            password: password.to_string(),
        };
        (hub.authenticate(action, &creds, session).await, inbox)
    }

    /// Drains exactly one message from an inbox, acks it, and returns its
    /// rendered form.
    async fn ack_one(inbox: &mut mpsc::Receiver<ChatMessage>) -> String {
        let message = inbox.recv().await.expect("expected a broadcast");
        let line = format!("{}: {}", message.sender, message.content);
        message.delivered();
        line
    }

    #[tokio::test]
    async fn register_then_login_requires_matching_password() {
        let hub = Hub::new();
        let (response, _inbox) = join(&hub, AuthAction::Register, "alice", "pw1").await;
        assert_eq!(response, Response::Ok);

        hub.logout("alice").await;

        let (response, _inbox) = join(&hub, AuthAction::Login, "alice", "wrong").await;
        assert_eq!(response, Response::InvalidCredentials);

        let (response, _inbox) = join(&hub, AuthAction::Login, "alice", "pw1").await;
        assert_eq!(response, Response::Ok);
    }

    #[tokio::test]
    async fn login_of_unknown_user_is_rejected() {
        let hub = Hub::new();
        let (response, _inbox) = join(&hub, AuthAction::Login, "nobody", "pw").await;
        assert_eq!(response, Response::InvalidCredentials);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let hub = Hub::new();
        let (response, _inbox) = join(&hub, AuthAction::Register, "bob", "pw").await;
        assert_eq!(response, Response::Ok);

        // The name stays taken even after the session ends.
        hub.logout("bob").await;
        let (response, _inbox) = join(&hub, AuthAction::Register, "bob", "other").await;
        assert_eq!(response, Response::UsernameExists);
    }

    #[tokio::test]
    async fn second_login_while_online_is_rejected() {
        let hub = Hub::new();
        let (response, _inbox) = join(&hub, AuthAction::Register, "carol", "pw").await;
        assert_eq!(response, Response::Ok);

        let (response, _other) = join(&hub, AuthAction::Login, "carol", "pw").await;
        assert_eq!(response, Response::UserAlreadyOnline);
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let hub = Hub::new();
        let (response, _inbox) = join(&hub, AuthAction::Register, "dave", "pw").await;
        assert_eq!(response, Response::Ok);

        hub.logout("dave").await;
        hub.logout("dave").await;
        hub.logout("never-logged-in").await;

        let (response, _inbox) = join(&hub, AuthAction::Login, "dave", "pw").await;
        assert_eq!(response, Response::Ok);
    }

    #[tokio::test]
    async fn broadcast_without_peers_is_ok() {
        let hub = Hub::new();
        let (response, _inbox) = join(&hub, AuthAction::Register, "alone", "pw").await;
        assert_eq!(response, Response::Ok);

        assert_eq!(hub.broadcast("anyone there?", "alone").await, Response::Ok);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer_exactly_once() {
        let hub = Hub::new();
        let (_, mut alice_inbox) = join(&hub, AuthAction::Register, "alice", "pw").await;
        let (_, mut bob_inbox) = join(&hub, AuthAction::Register, "bob", "pw").await;
        let (_, mut carol_inbox) = join(&hub, AuthAction::Register, "carol", "pw").await;

        let bob = tokio::spawn(async move { ack_one(&mut bob_inbox).await });
        let carol = tokio::spawn(async move { ack_one(&mut carol_inbox).await });

        assert_eq!(hub.broadcast("hello", "alice").await, Response::Ok);

        assert_eq!(bob.await.expect("bob acker"), "alice: hello");
        assert_eq!(carol.await.expect("carol acker"), "alice: hello");
        // The sender never hears their own broadcast.
        assert!(alice_inbox.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_fails_when_the_only_peer_never_acks() {
        let hub = Hub::new();
        let (_, _alice_inbox) = join(&hub, AuthAction::Register, "alice", "pw").await;
        // Bob's inbox is held but never drained.
        let (_, _bob_inbox) = join(&hub, AuthAction::Register, "bob", "pw").await;

        assert_eq!(hub.broadcast("hey", "alice").await, Response::MsgFailedForAll);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_reports_partial_failure() {
        let hub = Hub::new();
        let (_, _alice_inbox) = join(&hub, AuthAction::Register, "alice", "pw").await;
        let (_, mut bob_inbox) = join(&hub, AuthAction::Register, "bob", "pw").await;
        let (_, _carol_inbox) = join(&hub, AuthAction::Register, "carol", "pw").await;

        let bob = tokio::spawn(async move { ack_one(&mut bob_inbox).await });

        assert_eq!(
            hub.broadcast("hey", "alice").await,
            Response::MsgFailedForSome
        );
        assert_eq!(bob.await.expect("bob acker"), "alice: hey");
    }
}
