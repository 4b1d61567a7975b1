use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use tcp_chat_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    server::{BroadcastServer, ServerConfig},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout belongs to the chat transcript.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args)?,
        Command::Client(args) => client::run(args)?,
    }

    Ok(())
}

fn run_server(args: ServerArgs) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(ServerConfig::from(args)))
}

async fn serve(config: ServerConfig) -> Result<()> {
    let server = BroadcastServer::bind(config).await?;
    let addr = server.local_addr()?;
    info!("server listening on {}", addr);
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err.into());
    }
    Ok(())
}
