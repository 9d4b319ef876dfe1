//! P2P overlay networking for pingmesh.
//!
//! Nodes speak a line-based text protocol over TCP. Every outbound connection
//! opens with a version handshake, sends a fixed number of pings and closes.
//! Nodes learn about each other from handshakes and peer gossip, and keep a
//! peer table of sticky (always redialed) and transient peers.
//!
//! # Architecture
//!
//! Each connection runs in its own tokio task around a sans-IO state machine.
//! The node owns the peer table; tasks report to it over a channel, so every
//! table update is handled one event at a time.
//!
//! ```text
//! Main Task (P2pNode::run())
//! ├── Listener (accept incoming)
//! ├── Connection Task 1 (read/write loop)
//! ├── Connection Task 2 (dial, handshake, pings)
//! └── Reconcile timer (redial sticky peers)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use pingmesh_p2p::{P2pConfig, P2pNode, PeerAddress};
//!
//! let config = P2pConfig::new("0.0.0.0:5000".parse().unwrap())
//!     .with_bootstrap_peers(vec![PeerAddress::new("127.0.0.1", 5001)]);
//!
//! let node = P2pNode::new(config);
//! let handle = node.handle();
//! tokio::spawn(node.run());
//!
//! let outbound = handle.outbound_peers().await?;
//! ```

pub mod config;
pub mod error;

pub mod protocol;
pub mod peer;
pub mod manager;
pub mod node;

// Re-export main types
pub use config::{P2pConfig, DEFAULT_PORT, MAX_LINE_LENGTH, PROTOCOL_VERSION};
pub use error::{P2pError, P2pResult};
pub use manager::{LinkStatus, PeerSnapshot};
pub use node::{NodeHandle, P2pNode};
pub use peer::{ConnectionId, ConnectionState, Endpoint};
pub use protocol::{Message, PeerAddress};
