use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command},
    client, console,
    config::RelayConfig,
    input::spawn_stdin_reader,
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
        Command::Server(args) => {
            let config = RelayConfig::from(args);
            let server = RelayServer::bind(&config).await?;
            info!("relay listening on {}", server.local_addr()?);

            let relay = server.handle();
            tokio::spawn(async move {
                let input = spawn_stdin_reader();
                if let Err(err) = console::run(input, tokio::io::stdout(), relay).await {
                    warn!("console stopped: {err:?}");
                }
            });

            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
