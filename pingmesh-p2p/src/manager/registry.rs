//! Connection registry.
//!
//! Slot arena owning the node-side handle of every live connection. Ids carry
//! the slot generation so an event from a connection that has already been
//! released can never reach its successor in the same slot.

use std::fmt;

use tokio::sync::mpsc;

use crate::peer::{ConnectionCommand, ConnectionDirection, ConnectionId, Endpoint};

/// Node-side view of a connection's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Outbound dial in progress.
    Dialing,
    /// Socket established.
    Open,
    /// Close requested, waiting for the task to finish.
    Closing,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Dialing => write!(f, "dialing"),
            LinkStatus::Open => write!(f, "open"),
            LinkStatus::Closing => write!(f, "closing"),
        }
    }
}

/// Node-side handle of a connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Who initiated the connection.
    pub direction: ConnectionDirection,
    /// Remote endpoint, also the peer table key.
    pub endpoint: Endpoint,
    /// Host of the remote side as seen on the socket (dial host for outbound).
    pub peer_host: String,
    /// Lifecycle status.
    pub status: LinkStatus,
    /// Command channel into the connection task, once spawned.
    pub command_tx: Option<mpsc::UnboundedSender<ConnectionCommand>>,
}

impl ConnectionHandle {
    /// Handle of a dial about to start.
    pub fn outbound(endpoint: Endpoint, peer_host: impl Into<String>) -> Self {
        Self {
            direction: ConnectionDirection::Outbound,
            endpoint,
            peer_host: peer_host.into(),
            status: LinkStatus::Dialing,
            command_tx: None,
        }
    }

    /// Handle of a socket accepted by the listener.
    pub fn inbound(endpoint: Endpoint, peer_host: impl Into<String>) -> Self {
        Self {
            direction: ConnectionDirection::Inbound,
            endpoint,
            peer_host: peer_host.into(),
            status: LinkStatus::Open,
            command_tx: None,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    handle: Option<ConnectionHandle>,
}

/// Generation-checked arena of connection handles.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a handle and return its id.
    pub fn insert(&mut self, handle: ConnectionHandle) -> ConnectionId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.handle = Some(handle);
            return ConnectionId::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            handle: Some(handle),
        });
        ConnectionId::new(index, 0)
    }

    /// Look up a live handle.
    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.handle.as_ref())
    }

    /// Look up a live handle for mutation.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionHandle> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.handle.as_mut())
    }

    /// Release a handle. The slot is reused under the next generation.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionHandle> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let handle = slot.handle.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.live -= 1;
        Some(handle)
    }

    /// Iterate over live handles.
    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &ConnectionHandle)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.handle
                .as_ref()
                .map(|handle| (ConnectionId::new(index as u32, slot.generation), handle))
        })
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no handle is live.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(endpoint: &str) -> ConnectionHandle {
        ConnectionHandle::inbound(Endpoint::new(endpoint), "127.0.0.1")
    }

    #[test]
    fn test_insert_and_get() {
        let mut registry = ConnectionRegistry::new();
        let a = registry.insert(inbound("127.0.0.1:1000"));
        let b = registry.insert(ConnectionHandle::outbound(
            Endpoint::new("127.0.0.1:5000"),
            "127.0.0.1",
        ));

        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a).unwrap().status, LinkStatus::Open);
        assert_eq!(registry.get(b).unwrap().status, LinkStatus::Dialing);
        assert_eq!(registry.get(b).unwrap().direction, ConnectionDirection::Outbound);
    }

    #[test]
    fn test_stale_id_rejected_after_reuse() {
        let mut registry = ConnectionRegistry::new();
        let old = registry.insert(inbound("127.0.0.1:1000"));
        assert!(registry.remove(old).is_some());
        assert!(registry.is_empty());

        let new = registry.insert(inbound("127.0.0.1:2000"));
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);

        assert!(registry.get(old).is_none());
        assert!(registry.get_mut(old).is_none());
        assert!(registry.remove(old).is_none());
        assert_eq!(registry.get(new).unwrap().endpoint.as_str(), "127.0.0.1:2000");
    }

    #[test]
    fn test_double_remove_is_noop() {
        let mut registry = ConnectionRegistry::new();
        let id = registry.insert(inbound("127.0.0.1:1000"));
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_iter_yields_live_handles() {
        let mut registry = ConnectionRegistry::new();
        let a = registry.insert(inbound("127.0.0.1:1000"));
        let b = registry.insert(inbound("127.0.0.1:2000"));
        registry.remove(a);

        let ids: Vec<_> = registry.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![b]);
    }
}
