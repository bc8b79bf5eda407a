use std::{path::PathBuf, time::Duration};

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
    /// Run the relay server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Interface to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Refuse a join whose username is already online.
    #[arg(long)]
    pub unique_usernames: bool,

    /// Send each message back to its sender as well.
    #[arg(long)]
    pub echo: bool,

    /// Malformed frames tolerated per connection before it is closed.
    #[arg(long, default_value_t = 10)]
    pub malformed_threshold: u32,

    /// Seconds a new connection has to send its join frame.
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout: u64,

    /// Append accepted messages to this file as JSON lines.
    #[arg(long, value_name = "PATH")]
    pub history: Option<PathBuf>,

    /// Number of recent history messages replayed to new clients.
    #[arg(long, default_value_t = 10)]
    pub history_replay: usize,
}

impl ServerArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            enforce_unique_usernames: self.unique_usernames,
            echo_to_sender: self.echo,
            malformed_frame_threshold: self.malformed_threshold,
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            history_replay: self.history_replay,
            ..RelayConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host running the relay.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port the relay listens on.
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Username shown to other participants (at least 2 characters).
    #[arg(long)]
    pub username: String,
}
