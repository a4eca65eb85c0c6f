//! The server half: a TCP accept loop that hands each connection to its own
//! handler task over a shared [`hub::Hub`].

pub mod hub;

mod handler;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::select;
use tracing::{info, warn};

use crate::server::hub::Hub;

pub struct Server {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            hub: Arc::new(Hub::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` completes. A failed accept or a
    /// misbehaving client never takes the loop down.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, hub } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            info!(%peer, "client connected");
                            let hub = Arc::clone(&hub);
                            // One task per connection so a slow client never
                            // blocks new accepts.
                            tokio::spawn(handler::handle_connection(stream, hub));
                        }
                        Err(err) => {
                            warn!(error = ?err, "failed to accept connection");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}
