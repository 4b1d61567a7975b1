use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::{Args, Parser, Subcommand};

use crate::{connection::DEFAULT_PORT, framing::Framing, server::ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, forwarding each client's text to every other client.
    Server(ServerArgs),
    /// Connect to a relay server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Interface address to listen on.
    #[arg(long, env = "CHAT_RELAY_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Maximum number of clients served at once.
    #[arg(long, env = "CHAT_RELAY_MAX_CLIENTS", default_value_t = 1024)]
    pub max_clients: usize,

    /// Messages buffered per client; a client that falls further behind is disconnected.
    #[arg(long, env = "CHAT_RELAY_OUTBOUND_CAPACITY", default_value_t = 256)]
    pub outbound_capacity: usize,

    /// Relay whole reads (`chunk`) or reassembled newline-terminated lines (`line`).
    #[arg(long, env = "CHAT_RELAY_FRAMING", value_enum, default_value_t = Framing::Chunk)]
    pub framing: Framing,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        ServerConfig {
            listen: SocketAddr::new(args.bind, args.port),
            max_clients: args.max_clients,
            outbound_capacity: args.outbound_capacity,
            framing: args.framing,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host name or address of the relay server.
    #[arg(long, env = "CHAT_RELAY_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port of the relay server.
    #[arg(long, env = "CHAT_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// How received bytes are split into displayed messages.
    #[arg(long, env = "CHAT_RELAY_FRAMING", value_enum, default_value_t = Framing::Chunk)]
    pub framing: Framing,
}
