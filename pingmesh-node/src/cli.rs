//! Command-line argument parsing.

use std::net::IpAddr;

use clap::Parser;
use pingmesh_p2p::PeerAddress;

/// Pingmesh overlay node.
#[derive(Parser, Debug, Clone)]
#[command(name = "pingmesh-node")]
#[command(about = "Pingmesh P2P overlay node")]
#[command(version)]
pub struct Cli {
    /// P2P listen port.
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// P2P listen address.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Host advertised in handshakes (default: only the port is sent).
    #[arg(long)]
    pub public_host: Option<String>,

    /// Comma-separated list of sticky peers (default: 127.0.0.1:5000,127.0.0.1:5001 minus self).
    #[arg(long, value_delimiter = ',')]
    pub peers: Option<Vec<PeerAddress>>,

    /// Pings each outbound connection sends after the handshake.
    #[arg(long, default_value_t = 3)]
    pub ping_budget: u32,

    /// Seconds between reconciliation passes (0 disables).
    #[arg(long, default_value_t = 5)]
    pub reconcile_interval_secs: u64,

    /// Seconds between outbound peer status logs (0 disables).
    #[arg(long, default_value_t = 30)]
    pub status_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
