//! Node configuration.

use std::net::SocketAddr;
use std::time::Duration;

use pingmesh_p2p::{P2pConfig, PeerAddress, DEFAULT_PORT};

use crate::cli::Cli;

/// Ports of the local bootstrap set.
const BOOTSTRAP_PORTS: [u16; 2] = [5000, 5001];

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// P2P listen address.
    pub p2p_addr: SocketAddr,

    /// Host advertised in handshakes.
    pub public_host: Option<String>,

    /// Sticky peers to connect to.
    pub peers: Vec<PeerAddress>,

    /// Pings per outbound connection.
    pub ping_budget: u32,

    /// Interval of background reconciliation.
    pub reconcile_interval: Option<Duration>,

    /// Interval of the outbound peer status log.
    pub status_interval: Option<Duration>,

    /// Log level.
    pub log_level: String,
}

impl NodeConfig {
    /// Create a node configuration from CLI arguments.
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            p2p_addr: SocketAddr::new(cli.bind, cli.port),
            public_host: cli.public_host.clone(),
            peers: cli
                .peers
                .clone()
                .unwrap_or_else(|| default_bootstrap_peers(cli.port)),
            ping_budget: cli.ping_budget,
            reconcile_interval: seconds(cli.reconcile_interval_secs),
            status_interval: seconds(cli.status_interval_secs),
            log_level: cli.log_level.clone(),
        }
    }

    /// Build P2P configuration from node config.
    pub fn p2p_config(&self) -> P2pConfig {
        let mut config = P2pConfig::new(self.p2p_addr)
            .with_ping_budget(self.ping_budget)
            .with_reconcile_interval(self.reconcile_interval)
            .with_bootstrap_peers(self.peers.clone());

        if let Some(host) = &self.public_host {
            config = config.with_public_host(host.clone());
        }

        config
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            p2p_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            public_host: None,
            peers: default_bootstrap_peers(DEFAULT_PORT),
            ping_budget: 3,
            reconcile_interval: Some(Duration::from_secs(5)),
            status_interval: Some(Duration::from_secs(30)),
            log_level: "info".to_string(),
        }
    }
}

/// The local bootstrap set, skipping our own port.
pub fn default_bootstrap_peers(own_port: u16) -> Vec<PeerAddress> {
    BOOTSTRAP_PORTS
        .iter()
        .filter(|port| **port != own_port)
        .map(|port| PeerAddress::new("127.0.0.1", *port))
        .collect()
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.p2p_addr.port(), 5000);
        assert_eq!(config.peers, vec![PeerAddress::new("127.0.0.1", 5001)]);
    }

    #[test]
    fn test_bootstrap_skips_self() {
        assert_eq!(
            default_bootstrap_peers(5001),
            vec![PeerAddress::new("127.0.0.1", 5000)]
        );
        assert_eq!(default_bootstrap_peers(7000).len(), 2);
    }

    #[test]
    fn test_from_cli() {
        let cli = Cli::parse_from([
            "pingmesh-node",
            "--port",
            "5001",
            "--public-host",
            "10.0.0.4",
            "--reconcile-interval-secs",
            "0",
            "--ping-budget",
            "7",
        ]);
        let config = NodeConfig::from_cli(&cli);

        assert_eq!(config.p2p_addr, "0.0.0.0:5001".parse().unwrap());
        assert_eq!(config.peers, vec![PeerAddress::new("127.0.0.1", 5000)]);
        assert_eq!(config.reconcile_interval, None);
        assert_eq!(config.status_interval, Some(Duration::from_secs(30)));

        let p2p = config.p2p_config();
        assert_eq!(p2p.ping_budget, 7);
        assert_eq!(p2p.reconcile_interval, None);
        assert_eq!(p2p.local_identity(5001), "10.0.0.4:5001");
        assert_eq!(p2p.bootstrap_peers.len(), 1);
    }

    #[test]
    fn test_explicit_peers_replace_default() {
        let cli = Cli::parse_from(["pingmesh-node", "--peers", "192.168.1.2:5000"]);
        let config = NodeConfig::from_cli(&cli);
        assert_eq!(config.peers, vec![PeerAddress::new("192.168.1.2", 5000)]);
    }
}
