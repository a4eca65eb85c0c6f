use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use line_chat::{
    cli::{self, Cli, Mode},
    client,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version are graceful terminations; only genuine
            // usage problems exit 1. clap renders its own message.
            use clap::error::ErrorKind;

            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    match cli.mode {
        Mode::Server => {
            let listener = TcpListener::bind(cli::listen_addr(cli.port)).await?;
            let server = Server::new(listener);
            info!("listening on {}", server.local_addr()?);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Mode::Client => client::run(cli.port).await?,
    }

    Ok(())
}
