//! Server integration tests over real sockets: the auth dialogue, the
//! broadcast path, and server-initiated logout.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use line_chat::protocol;
use line_chat::server::Server;
use tokio::{
    io::BufReader,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(1);

struct TestServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener);
        let addr = server.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        protocol::write_line(&mut self.writer, line)
            .await
            .with_context(|| format!("failed to send line {line:?}"))
    }

    async fn expect_line(&mut self, description: &str) -> Result<String> {
        match timeout(READ_TIMEOUT, protocol::read_line(&mut self.reader)).await {
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => Err(anyhow!("{description}: stream closed")),
            Ok(Err(err)) => Err(anyhow!("{description}: {err}")),
            Err(_) => Err(anyhow!("{description}: timed out waiting for line")),
        }
    }

    async fn expect_eof(&mut self, description: &str) -> Result<()> {
        match timeout(READ_TIMEOUT, protocol::read_line(&mut self.reader)).await {
            Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some(line))) => Err(anyhow!("{description}: unexpected line {line:?}")),
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(anyhow!("{description}: timed out waiting for close")),
        }
    }

    /// Sends the three-line auth request and returns the response frame.
    async fn authenticate(&mut self, action: &str, name: &str, password: &str) -> Result<String> {
        self.send_line(action).await?;
        self.send_line(name).await?;
        self.send_line(password).await?;
        self.expect_line("waiting for auth response").await
    }
}

#[tokio::test]
async fn register_then_login_after_disconnect() -> Result<()> {
    let server = TestServer::start().await?;

    let mut first = TestClient::connect(server.addr).await?;
    assert_eq!(first.authenticate("r", "alice", "pw1").await?, "r;Ok");
    drop(first);

    let mut second = TestClient::connect(server.addr).await?;
    assert_eq!(
        second.authenticate("l", "alice", "bad").await?,
        "r;InvalidCredentials"
    );

    // The server may still be tearing down the first session; a login that
    // races it sees the name as online, so retry briefly.
    let mut response = second.authenticate("l", "alice", "pw1").await?;
    for _ in 0..20 {
        if response == "r;Ok" {
            break;
        }
        assert_eq!(response, "r;UserAlreadyOnline");
        sleep(Duration::from_millis(50)).await;
        response = second.authenticate("l", "alice", "pw1").await?;
    }
    assert_eq!(response, "r;Ok");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_username_is_rejected() -> Result<()> {
    let server = TestServer::start().await?;

    let mut first = TestClient::connect(server.addr).await?;
    assert_eq!(first.authenticate("r", "bob", "pw").await?, "r;Ok");

    let mut second = TestClient::connect(server.addr).await?;
    assert_eq!(
        second.authenticate("r", "bob", "x").await?,
        "r;UsernameExists"
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_both_peers() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = TestClient::connect(server.addr).await?;
    let mut bob = TestClient::connect(server.addr).await?;
    let mut carol = TestClient::connect(server.addr).await?;
    assert_eq!(alice.authenticate("r", "alice", "pw").await?, "r;Ok");
    assert_eq!(bob.authenticate("r", "bob", "pw").await?, "r;Ok");
    assert_eq!(carol.authenticate("r", "carol", "pw").await?, "r;Ok");

    alice.send_line("m7;hello").await?;

    assert_eq!(
        bob.expect_line("waiting for bob's delivery").await?,
        "malice: hello"
    );
    assert_eq!(
        carol.expect_line("waiting for carol's delivery").await?,
        "malice: hello"
    );
    // The sender gets the outcome only after the fan-out is done.
    assert_eq!(
        alice.expect_line("waiting for alice's response").await?,
        "r7;Ok"
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn quit_command_logs_out_and_frees_the_name() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = TestClient::connect(server.addr).await?;
    assert_eq!(alice.authenticate("r", "alice", "pw").await?, "r;Ok");

    // An unknown command is acknowledged and otherwise ignored.
    alice.send_line("m2;/dance").await?;
    assert_eq!(
        alice.expect_line("waiting for unknown-command ack").await?,
        "r2;Ok"
    );

    alice.send_line("m3;/quit").await?;
    assert_eq!(
        alice.expect_line("waiting for quit ack").await?,
        "r3;Ok"
    );
    assert_eq!(
        alice.expect_line("waiting for the quit command").await?,
        "/quit"
    );

    // The session is gone and the stream is back at the auth dialogue.
    assert_eq!(alice.authenticate("l", "alice", "pw").await?, "r;Ok");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_input_closes_the_session() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = TestClient::connect(server.addr).await?;
    assert_eq!(alice.authenticate("r", "alice", "pw").await?, "r;Ok");

    alice.send_line("this is not a tagged message").await?;
    alice
        .expect_eof("waiting for the server to drop the connection")
        .await?;

    server.stop().await;
    Ok(())
}
