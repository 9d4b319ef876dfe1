//! Peer table keyed by endpoint.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::DEFAULT_DIAL_BACK_COOLDOWN;
use crate::peer::{ConnectionId, Endpoint};
use crate::protocol::PeerAddress;

/// Everything the node knows about one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    /// Table key.
    pub endpoint: Endpoint,
    /// Where to dial; absent for peers only known through an inbound socket.
    pub dial_target: Option<PeerAddress>,
    /// Sticky entries are never swept and are redialed until connected.
    pub sticky: bool,
    /// Outbound dials started for this entry.
    pub dial_attempts: u32,
    /// Live outbound connection.
    pub outbound: Option<ConnectionId>,
    /// Live inbound connection.
    pub inbound: Option<ConnectionId>,
}

impl PeerEntry {
    fn dialable(target: PeerAddress, sticky: bool) -> Self {
        Self {
            endpoint: Endpoint::from(&target),
            dial_target: Some(target),
            sticky,
            dial_attempts: 0,
            outbound: None,
            inbound: None,
        }
    }

    fn inbound_only(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            dial_target: None,
            sticky: false,
            dial_attempts: 0,
            outbound: None,
            inbound: None,
        }
    }

    /// Whether the entry should be dialed by the next reconciliation pass.
    ///
    /// Non-sticky peers get one automatic attempt; sticky peers are retried
    /// whenever they have no outbound connection.
    pub fn wants_dial(&self) -> bool {
        self.dial_target.is_some()
            && self.outbound.is_none()
            && (self.dial_attempts == 0 || self.sticky)
    }

    /// Whether the sweep may drop this entry.
    pub fn is_idle(&self) -> bool {
        !self.sticky && self.outbound.is_none() && self.inbound.is_none()
    }
}

/// Peer table. At most one entry per endpoint.
#[derive(Debug)]
pub struct PeerTable {
    entries: HashMap<Endpoint, PeerEntry>,
    /// Non-sticky endpoints that were dialed and then swept, with sweep time.
    recently_dialed: HashMap<Endpoint, Instant>,
    /// How long a swept endpoint ignores handshake-inferred re-adds.
    dial_back_cooldown: Duration,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::with_dial_back_cooldown(DEFAULT_DIAL_BACK_COOLDOWN)
    }
}

impl PeerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table with the given dial-back cooldown.
    pub fn with_dial_back_cooldown(cooldown: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            recently_dialed: HashMap::new(),
            dial_back_cooldown: cooldown,
        }
    }

    /// Add a dialable peer. Does not dial.
    ///
    /// Returns `true` if a new entry was created. Re-adding a known endpoint
    /// only upgrades it to sticky when asked to.
    pub fn add_peer(&mut self, target: PeerAddress, sticky: bool) -> bool {
        let endpoint = Endpoint::from(&target);
        if let Some(entry) = self.entries.get_mut(&endpoint) {
            if sticky && !entry.sticky {
                entry.sticky = true;
            }
            return false;
        }
        self.entries.insert(endpoint, PeerEntry::dialable(target, sticky));
        true
    }

    /// Add a non-sticky peer learned from a `:port` handshake.
    ///
    /// Refused while the endpoint is cooling down after a dialed session was
    /// swept: the handshake most likely comes from the peer dialing us back
    /// for that very session.
    pub fn add_inferred_peer(&mut self, target: PeerAddress, now: Instant) -> bool {
        let endpoint = Endpoint::from(&target);
        if self.cooling_down(&endpoint, now) {
            return false;
        }
        self.add_peer(target, false)
    }

    /// Whether `endpoint` was dialed and swept within the cooldown.
    pub fn cooling_down(&self, endpoint: &Endpoint, now: Instant) -> bool {
        self.recently_dialed
            .get(endpoint)
            .is_some_and(|swept| now.saturating_duration_since(*swept) < self.dial_back_cooldown)
    }

    /// Record an accepted inbound connection, creating a non-sticky entry for
    /// an unknown endpoint.
    pub fn attach_inbound(&mut self, endpoint: Endpoint, id: ConnectionId) {
        self.entries
            .entry(endpoint.clone())
            .or_insert_with(|| PeerEntry::inbound_only(endpoint))
            .inbound = Some(id);
    }

    /// Record an outbound dial started for `endpoint`.
    pub fn record_dial(&mut self, endpoint: &Endpoint, id: ConnectionId) {
        if let Some(entry) = self.entries.get_mut(endpoint) {
            entry.dial_attempts += 1;
            entry.outbound = Some(id);
        }
    }

    /// Endpoints the next reconciliation pass should dial, in key order.
    pub fn dial_candidates(&self) -> Vec<(Endpoint, PeerAddress)> {
        let mut candidates: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.wants_dial())
            .filter_map(|entry| {
                entry
                    .dial_target
                    .clone()
                    .map(|target| (entry.endpoint.clone(), target))
            })
            .collect();
        candidates.sort();
        candidates
    }

    /// Drop every reference to a connection, whichever entry holds it.
    pub fn clear_connection(&mut self, id: ConnectionId) {
        for entry in self.entries.values_mut() {
            if entry.outbound == Some(id) {
                entry.outbound = None;
            }
            if entry.inbound == Some(id) {
                entry.inbound = None;
            }
        }
    }

    /// Remove idle non-sticky entries, returning the removed endpoints.
    ///
    /// Removing an entry never makes another one idle, so one pass reaches
    /// the fixpoint. Removed entries that were dialed start their dial-back
    /// cooldown at `now`.
    pub fn sweep(&mut self, now: Instant) -> Vec<Endpoint> {
        let cooldown = self.dial_back_cooldown;
        self.recently_dialed
            .retain(|_, swept| now.saturating_duration_since(*swept) < cooldown);

        let idle: Vec<Endpoint> = self
            .entries
            .values()
            .filter(|entry| entry.is_idle())
            .map(|entry| entry.endpoint.clone())
            .collect();

        for endpoint in &idle {
            if let Some(entry) = self.entries.remove(endpoint) {
                if entry.dial_attempts > 0 {
                    self.recently_dialed.insert(entry.endpoint, now);
                }
            }
        }
        idle
    }

    /// Look up an entry.
    pub fn get(&self, endpoint: &str) -> Option<&PeerEntry> {
        self.entries.get(endpoint)
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
