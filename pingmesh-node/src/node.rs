//! Node composition: P2P node, status log and signal handling.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use pingmesh_p2p::{NodeHandle, P2pNode, PROTOCOL_VERSION};

use crate::config::NodeConfig;
use crate::shutdown::wait_for_shutdown_signal;

/// How long to wait for the P2P node to finish after shutdown is requested.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// A running pingmesh node.
pub struct Node {
    config: NodeConfig,
}

impl Node {
    /// Create a new node.
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Run until SIGINT/SIGTERM or until the P2P node stops on its own.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!("Starting pingmesh node...");
        tracing::info!("  Protocol version: {}", PROTOCOL_VERSION);
        tracing::info!("  P2P address: {}", self.config.p2p_addr);
        tracing::info!("  Ping budget: {}", self.config.ping_budget);
        for peer in &self.config.peers {
            tracing::info!("  Sticky peer: {}", peer);
        }

        let p2p = P2pNode::new(self.config.p2p_config());
        let handle = p2p.handle();
        let mut p2p_task = tokio::spawn(p2p.run());

        let status_task = self
            .config
            .status_interval
            .map(|period| spawn_status_log(handle.clone(), period));

        let result = tokio::select! {
            // P2P node stopped by itself (e.g. bind failure)
            joined = &mut p2p_task => joined.map_err(anyhow::Error::from).and_then(|r| r.map_err(Into::into)),

            signal = wait_for_shutdown_signal() => {
                signal?;
                tracing::info!("Shutting down node...");
                let _ = handle.shutdown().await;
                match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut p2p_task).await {
                    Ok(joined) => joined.map_err(anyhow::Error::from).and_then(|r| r.map_err(Into::into)),
                    Err(_) => {
                        tracing::warn!("P2P node did not stop in time");
                        p2p_task.abort();
                        Ok(())
                    }
                }
            }
        };

        if let Some(task) = status_task {
            task.abort();
        }

        tracing::info!("Node stopped");
        result
    }
}

/// Periodically log the peers holding an open outbound connection.
fn spawn_status_log(handle: NodeHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval_at(Instant::now() + period, period);
        loop {
            timer.tick().await;
            match handle.outbound_peers().await {
                Ok(peers) => {
                    let list: Vec<String> = peers.iter().map(ToString::to_string).collect();
                    tracing::info!(count = peers.len(), peers = ?list, "Outbound peers");
                }
                Err(_) => break,
            }
        }
    })
}
