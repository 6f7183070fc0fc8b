use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use websocket_relay::{
    cli::{Cli, Command},
    client,
    server::RelayServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let hub_config = args.hub_config()?;
            let server_config = args.server_config()?;
            let listener = TcpListener::bind(server_config.listen)
                .await
                .with_context(|| format!("failed to bind {}", server_config.listen))?;
            let server = RelayServer::new(listener, server_config, hub_config)?;
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = server.run_until_signal().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Connect(args) => client::run(args).await?,
    }

    Ok(())
}
