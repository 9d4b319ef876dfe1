//! Peer manager.
//!
//! Owns the peer table and the connection registry, decides what to dial,
//! and routes messages to connections.

pub mod inbound;
pub mod outbound;
pub mod registry;
pub mod table;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::{P2pError, P2pResult};
use crate::peer::{ConnectionCommand, ConnectionDirection, ConnectionId, Endpoint};
use crate::protocol::{Message, PeerAddress};

pub use inbound::InboundListener;
pub use outbound::connect_to_peer;
pub use registry::{ConnectionHandle, ConnectionRegistry, LinkStatus};
pub use table::{PeerEntry, PeerTable};

/// A dial the node must start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    /// Id reserved for the outbound connection.
    pub id: ConnectionId,
    /// Where to dial.
    pub target: PeerAddress,
}

/// Snapshot of a peer table entry for external reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    /// Table key.
    pub endpoint: Endpoint,
    /// Dial target, if the peer is dialable.
    pub dial_target: Option<PeerAddress>,
    /// Whether the entry is sticky.
    pub sticky: bool,
    /// Outbound dials started so far.
    pub dial_attempts: u32,
    /// Status of the outbound connection, if any.
    pub outbound: Option<LinkStatus>,
    /// Whether an inbound connection is attached.
    pub inbound: bool,
}

/// Manages the peer table and all connections.
#[derive(Debug, Default)]
pub struct PeerManager {
    /// Peer table keyed by endpoint.
    table: PeerTable,
    /// Node-side connection handles.
    registry: ConnectionRegistry,
}

impl PeerManager {
    /// Create an empty peer manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty peer manager with the given dial-back cooldown.
    pub fn with_dial_back_cooldown(cooldown: Duration) -> Self {
        Self {
            table: PeerTable::with_dial_back_cooldown(cooldown),
            registry: ConnectionRegistry::new(),
        }
    }

    /// Add a dialable peer. Idempotent; does not dial.
    pub fn add_peer(&mut self, target: PeerAddress, sticky: bool) -> bool {
        let added = self.table.add_peer(target.clone(), sticky);
        if added {
            tracing::info!(peer = %target, sticky, count = self.table.len(), "Added peer");
        }
        added
    }

    /// Add a peer inferred from a `:port` handshake. Skipped while the
    /// endpoint's last dialed session is cooling down.
    pub fn add_inferred_peer(&mut self, target: PeerAddress) -> bool {
        let added = self.table.add_inferred_peer(target.clone(), Instant::now());
        if added {
            tracing::info!(peer = %target, sticky = false, count = self.table.len(), "Added peer");
        } else if self.table.cooling_down(&Endpoint::from(&target), Instant::now()) {
            tracing::debug!(peer = %target, "Not dialing back, session just ended");
        }
        added
    }

    /// Register a socket accepted by the listener.
    pub fn inbound_accepted(&mut self, addr: SocketAddr) -> ConnectionId {
        let endpoint = Endpoint::from(addr);
        let id = self
            .registry
            .insert(ConnectionHandle::inbound(endpoint.clone(), addr.ip().to_string()));
        self.table.attach_inbound(endpoint, id);
        id
    }

    /// Reserve outbound connections for every entry that should be dialed.
    ///
    /// Idempotent: an entry with a dial in flight or an open outbound link is
    /// skipped.
    pub fn reconcile(&mut self) -> Vec<DialRequest> {
        let mut requests = Vec::new();
        for (endpoint, target) in self.table.dial_candidates() {
            let handle = ConnectionHandle::outbound(endpoint.clone(), target.host.clone());
            let id = self.registry.insert(handle);
            self.table.record_dial(&endpoint, id);

            tracing::debug!(conn = %id, target = %target, "Dialing peer");
            requests.push(DialRequest { id, target });
        }
        requests
    }

    /// Attach the command channel of a freshly spawned connection task.
    pub fn attach_command_channel(
        &mut self,
        id: ConnectionId,
        command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    ) {
        if let Some(handle) = self.registry.get_mut(id) {
            handle.command_tx = Some(command_tx);
        }
    }

    /// An outbound dial completed.
    pub fn connected(&mut self, id: ConnectionId) -> bool {
        match self.registry.get_mut(id) {
            Some(handle) if handle.status == LinkStatus::Dialing => {
                handle.status = LinkStatus::Open;
                true
            }
            _ => false,
        }
    }

    /// A connection finished, either closed or failed to dial.
    ///
    /// Releases it, clears every table reference to it, and sweeps idle
    /// entries. Returns the endpoints removed by the sweep.
    pub fn release(&mut self, id: ConnectionId) -> Vec<Endpoint> {
        if self.registry.remove(id).is_none() {
            tracing::trace!(conn = %id, "Release of unknown connection");
        }
        self.table.clear_connection(id);

        let removed = self.table.sweep(Instant::now());
        for endpoint in &removed {
            tracing::debug!(endpoint = %endpoint, count = self.table.len(), "Removed disconnected peer");
        }
        removed
    }

    /// Get a live connection handle.
    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.registry.get(id)
    }

    /// Dial targets currently holding an open outbound connection.
    pub fn outbound_peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self
            .table
            .iter()
            .filter(|entry| {
                entry
                    .outbound
                    .and_then(|id| self.registry.get(id))
                    .is_some_and(|handle| handle.status == LinkStatus::Open)
            })
            .filter_map(|entry| entry.dial_target.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Send a message to one connection.
    /// Uses unbounded channel so this never blocks.
    ///
    /// Links already closing are refused; their task would drop the message.
    pub fn send_to(&self, id: ConnectionId, message: Message) -> P2pResult<()> {
        if self
            .registry
            .get(id)
            .is_some_and(|handle| handle.status == LinkStatus::Closing)
        {
            return Err(P2pError::ConnectionClosing(id.to_string()));
        }
        self.command(id, ConnectionCommand::Send(message))
    }

    /// Ask a connection to close.
    pub fn close(&mut self, id: ConnectionId) -> P2pResult<()> {
        self.command(id, ConnectionCommand::Close)?;
        if let Some(handle) = self.registry.get_mut(id) {
            handle.status = LinkStatus::Closing;
        }
        Ok(())
    }

    /// Send a message on every open connection.
    pub fn broadcast(&self, message: Message) -> usize {
        let mut sent = 0;
        for (id, handle) in self.registry.iter() {
            if handle.status != LinkStatus::Open {
                continue;
            }
            let Some(tx) = handle.command_tx.as_ref() else {
                continue;
            };
            match tx.send(ConnectionCommand::Send(message.clone())) {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!(conn = %id, error = %e, "Failed to broadcast to connection"),
            }
        }
        sent
    }

    /// Ask every connection to close.
    pub fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.registry.iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Err(e) = self.close(id) {
                tracing::debug!(conn = %id, error = %e, "Failed to close connection");
            }
        }
    }

    /// Snapshot of the peer table, sorted by endpoint.
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .table
            .iter()
            .map(|entry| PeerSnapshot {
                endpoint: entry.endpoint.clone(),
                dial_target: entry.dial_target.clone(),
                sticky: entry.sticky,
                dial_attempts: entry.dial_attempts,
                outbound: entry
                    .outbound
                    .and_then(|id| self.registry.get(id))
                    .map(|handle| handle.status),
                inbound: entry.inbound.is_some(),
            })
            .collect();
        peers.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        peers
    }

    /// Get connection counts as `(outbound, inbound)`.
    pub fn connection_counts(&self) -> (usize, usize) {
        self.registry
            .iter()
            .fold((0, 0), |(outbound, inbound), (_, handle)| match handle.direction {
                ConnectionDirection::Outbound => (outbound + 1, inbound),
                ConnectionDirection::Inbound => (outbound, inbound + 1),
            })
    }

    /// Get the peer table.
    pub fn table(&self) -> &PeerTable {
        &self.table
    }

    fn command(&self, id: ConnectionId, command: ConnectionCommand) -> P2pResult<()> {
        let tx = self
            .registry
            .get(id)
            .and_then(|handle| handle.command_tx.as_ref())
            .ok_or_else(|| P2pError::ConnectionNotFound(id.to_string()))?;

        tx.send(command)
            .map_err(|_| P2pError::ChannelSend("Connection command channel closed".to_string()))
    }
}
