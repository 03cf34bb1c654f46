use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::config::RelayConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server. Type /help on its console for admin commands.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:64882")]
    pub listen: SocketAddr,
}

impl From<ServerArgs> for RelayConfig {
    fn from(args: ServerArgs) -> Self {
        RelayConfig::with_listen(args.listen)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:64882")]
    pub server: SocketAddr,

    /// Answer the nickname prompt with this name instead of asking.
    #[arg(long)]
    pub nickname: Option<String>,
}
