//! P2P configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::PeerAddress;

/// Protocol version tag carried in handshakes.
pub const PROTOCOL_VERSION: &str = "V01";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 5000;

/// Default listen backlog.
pub const DEFAULT_LISTEN_BACKLOG: u32 = 10;

/// Default number of pings an outbound connection sends before closing.
pub const DEFAULT_PING_BUDGET: u32 = 3;

/// Default interval between background reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default time a dialed-then-swept endpoint ignores `:port` handshakes.
pub const DEFAULT_DIAL_BACK_COOLDOWN: Duration = Duration::from_secs(30);

/// Maximum length of a single protocol line, terminator excluded.
pub const MAX_LINE_LENGTH: usize = 4096;

/// Configuration for the P2P node.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Address to bind the listener to.
    pub bind_addr: SocketAddr,

    /// Listen backlog passed to the socket.
    pub listen_backlog: u32,

    /// Host advertised in handshakes. When unset, only `:<port>` is sent and
    /// remote nodes infer our host from the socket they see.
    pub public_host: Option<String>,

    /// Pings each outbound connection sends after the handshake.
    pub ping_budget: u32,

    /// Interval of the background reconciliation pass (`None` disables it).
    pub reconcile_interval: Option<Duration>,

    /// Sticky peers dialed on startup and redialed until connected.
    pub bootstrap_peers: Vec<PeerAddress>,

    /// How long an endpoint whose dialed session ended is not re-learned
    /// from `:port` handshakes. Stops two port-only nodes from dialing each
    /// other back forever.
    pub dial_back_cooldown: Duration,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            public_host: None,
            ping_budget: DEFAULT_PING_BUDGET,
            reconcile_interval: Some(DEFAULT_RECONCILE_INTERVAL),
            bootstrap_peers: Vec::new(),
            dial_back_cooldown: DEFAULT_DIAL_BACK_COOLDOWN,
        }
    }
}

impl P2pConfig {
    /// Create a new configuration with the specified bind address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the listen backlog.
    pub fn with_listen_backlog(mut self, backlog: u32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Set the host advertised in handshakes.
    pub fn with_public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }

    /// Set the ping budget of outbound connections.
    pub fn with_ping_budget(mut self, budget: u32) -> Self {
        self.ping_budget = budget;
        self
    }

    /// Set or disable the background reconciliation interval.
    pub fn with_reconcile_interval(mut self, interval: Option<Duration>) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Add bootstrap peers to connect to on startup.
    pub fn with_bootstrap_peers(mut self, peers: Vec<PeerAddress>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    /// Set the dial-back cooldown.
    pub fn with_dial_back_cooldown(mut self, cooldown: Duration) -> Self {
        self.dial_back_cooldown = cooldown;
        self
    }

    /// Identity announced in handshakes once the listener is bound to `port`.
    pub fn local_identity(&self, port: u16) -> String {
        match &self.public_host {
            Some(host) => format!("{host}:{port}"),
            None => format!(":{port}"),
        }
    }
}
