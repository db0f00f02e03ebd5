use clap::Parser;

/// Environment variable consulted when `--token` is not given.
pub const TOKEN_ENV: &str = "VOXMESH_TOKEN";

/// Voxmesh: join a mesh voice channel from the terminal.
#[derive(Parser, Debug)]
#[command(name = "voxmesh", version, about)]
pub struct Args {
    /// Voice channel to join.
    #[arg(short = 'c', long)]
    pub channel: String,

    /// Relay credential. Falls back to $VOXMESH_TOKEN.
    #[arg(short = 't', long)]
    pub token: Option<String>,

    /// Local peer id to assume until the relay reports one.
    #[arg(long)]
    pub peer_id: Option<String>,

    /// Relay WebSocket URL override.
    #[arg(long)]
    pub url: Option<String>,

    /// Config file path override.
    #[arg(long)]
    pub config: Option<String>,

    /// Log level override (debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Join without opening the microphone.
    #[arg(long)]
    pub listen_only: bool,
}

pub fn parse() -> Args {
    Args::parse()
}
