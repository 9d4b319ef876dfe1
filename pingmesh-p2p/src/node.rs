//! Main P2P node orchestrator.
//!
//! Every peer table mutation happens on the node's event loop: connection
//! tasks and [`NodeHandle`]s only send events and commands into it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::config::P2pConfig;
use crate::error::{P2pError, P2pResult};
use crate::manager::{connect_to_peer, InboundListener, PeerManager, PeerSnapshot};
use crate::peer::{spawn_inbound, ConnectionEvent, ConnectionId, Endpoint};
use crate::protocol::{
    create_handshake_response, inferred_peer_address, ping_response_text, validate_handshake,
    HandshakeMessage, Message, PeerAddress,
};

/// How long shutdown waits for each connection task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Pause after a failed accept, so errors like EMFILE do not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Requests served by the node event loop.
#[derive(Debug)]
pub enum NodeCommand {
    /// Add a dialable peer, then reconcile.
    AddPeer {
        target: PeerAddress,
        sticky: bool,
        reply: oneshot::Sender<bool>,
    },
    /// Announce a peer on every open connection.
    Gossip {
        target: PeerAddress,
        reply: oneshot::Sender<usize>,
    },
    /// List dial targets with an open outbound connection.
    OutboundPeers {
        reply: oneshot::Sender<Vec<PeerAddress>>,
    },
    /// Snapshot the peer table.
    Peers {
        reply: oneshot::Sender<Vec<PeerSnapshot>>,
    },
}

/// Cloneable handle for talking to a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    command_tx: mpsc::Sender<NodeCommand>,
    shutdown_tx: mpsc::Sender<()>,
}

impl NodeHandle {
    /// Add a dialable peer and reconcile. Returns `true` if it was new.
    pub async fn add_peer(&self, target: PeerAddress, sticky: bool) -> P2pResult<bool> {
        self.request(|reply| NodeCommand::AddPeer {
            target,
            sticky,
            reply,
        })
        .await
    }

    /// Send `PEER <host> <port>` on every open connection. Returns how many
    /// connections it was queued on.
    pub async fn gossip(&self, target: PeerAddress) -> P2pResult<usize> {
        self.request(|reply| NodeCommand::Gossip { target, reply }).await
    }

    /// Dial targets currently holding an open outbound connection.
    pub async fn outbound_peers(&self) -> P2pResult<Vec<PeerAddress>> {
        self.request(|reply| NodeCommand::OutboundPeers { reply }).await
    }

    /// Snapshot of the peer table.
    pub async fn peers(&self) -> P2pResult<Vec<PeerSnapshot>> {
        self.request(|reply| NodeCommand::Peers { reply }).await
    }

    /// Ask the node to shut down.
    pub async fn shutdown(&self) -> P2pResult<()> {
        self.shutdown_tx.send(()).await.map_err(|_| P2pError::Shutdown)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> P2pResult<T> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| P2pError::Shutdown)?;
        response.await.map_err(|_| P2pError::Shutdown)
    }
}

/// Main P2P node.
pub struct P2pNode {
    /// P2P configuration.
    config: Arc<P2pConfig>,
    /// Peer manager - THE authoritative source for peer state.
    peers: PeerManager,
    /// Identity announced in handshakes, known once the listener is bound.
    local_identity: String,
    /// Sender cloned into every connection task.
    event_tx: mpsc::Sender<ConnectionEvent>,
    /// Connection events, taken by `run`.
    event_rx: Option<mpsc::Receiver<ConnectionEvent>>,
    /// Command sender (for cloning into handles).
    command_tx: mpsc::Sender<NodeCommand>,
    /// Commands from handles, taken by `run`.
    command_rx: Option<mpsc::Receiver<NodeCommand>>,
    /// Shutdown signal receiver.
    shutdown_rx: Option<mpsc::Receiver<()>>,
    /// Shutdown signal sender (for cloning).
    shutdown_tx: mpsc::Sender<()>,
    /// Channel to send the bound address when the node starts.
    bound_addr_tx: Option<oneshot::Sender<SocketAddr>>,
    /// JoinHandles for connection tasks (for graceful shutdown).
    peer_tasks: HashMap<ConnectionId, JoinHandle<()>>,
}

impl P2pNode {
    /// Create a new P2P node.
    pub fn new(config: P2pConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Self {
            peers: PeerManager::with_dial_back_cooldown(config.dial_back_cooldown),
            config: Arc::new(config),
            local_identity: String::new(),
            event_tx,
            event_rx: Some(event_rx),
            command_tx,
            command_rx: Some(command_rx),
            shutdown_rx: Some(shutdown_rx),
            shutdown_tx,
            bound_addr_tx: None,
            peer_tasks: HashMap::new(),
        }
    }

    /// Get a oneshot receiver that will receive the bound address when the node starts.
    /// This is useful for tests that need to know the actual port when using port 0.
    pub fn bound_addr_receiver(&mut self) -> oneshot::Receiver<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.bound_addr_tx = Some(tx);
        rx
    }

    /// Get the shutdown sender for external shutdown signals.
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Get a handle for issuing commands to the running node.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Run the P2P node until shutdown.
    pub async fn run(mut self) -> P2pResult<()> {
        let (Some(mut event_rx), Some(mut command_rx), Some(mut shutdown_rx)) = (
            self.event_rx.take(),
            self.command_rx.take(),
            self.shutdown_rx.take(),
        ) else {
            return Err(P2pError::Shutdown);
        };

        // Start listener
        let listener = InboundListener::bind(&self.config)?;
        let local_addr = listener.local_addr()?;
        self.local_identity = self.config.local_identity(local_addr.port());
        tracing::info!(addr = %local_addr, identity = %self.local_identity, "P2P node listening");

        // Send bound address to receiver if one was set up
        if let Some(tx) = self.bound_addr_tx.take() {
            let _ = tx.send(local_addr);
        }

        for peer in self.config.bootstrap_peers.clone() {
            self.peers.add_peer(peer, true);
        }
        self.reconcile();

        let mut reconcile_timer = self
            .config
            .reconcile_interval
            .map(|period| interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                // Handle shutdown
                _ = shutdown_rx.recv() => {
                    tracing::info!("P2P node shutting down");
                    event_rx.close();
                    self.shutdown_peers().await;
                    break;
                }

                // Accept inbound connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.handle_inbound(stream, addr),
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept error");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }

                // Handle connection events
                Some(event) = event_rx.recv() => {
                    self.handle_connection_event(event);
                }

                // Handle commands from node handles
                Some(command) = command_rx.recv() => {
                    self.handle_command(command);
                }

                // Periodic reconciliation
                _ = async {
                    match reconcile_timer.as_mut() {
                        Some(timer) => {
                            timer.tick().await;
                        }
                        None => std::future::pending().await,
                    }
                } => {
                    self.reconcile();
                }
            }
        }

        Ok(())
    }

    /// Register and spawn an accepted socket.
    fn handle_inbound(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = self.peers.inbound_accepted(addr);
        let (command_tx, handle) = spawn_inbound(id, addr, stream, self.event_tx.clone());
        self.peers.attach_command_channel(id, command_tx);
        self.peer_tasks.insert(id, handle);
        tracing::info!(conn = %id, endpoint = %addr, "New incoming connection");
    }

    /// Start a dial for every peer table entry that wants one.
    fn reconcile(&mut self) {
        for request in self.peers.reconcile() {
            let (command_tx, handle) = connect_to_peer(
                request.id,
                request.target,
                self.local_identity.clone(),
                self.config.ping_budget,
                self.event_tx.clone(),
            );
            self.peers.attach_command_channel(request.id, command_tx);
            self.peer_tasks.insert(request.id, handle);
        }
    }

    /// Handle a connection event.
    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { id } => {
                if self.peers.connected(id) {
                    let endpoint = self.peers.connection(id).map(|h| h.endpoint.clone());
                    tracing::info!(conn = %id, endpoint = ?endpoint, "Outbound connection established");
                }
            }
            ConnectionEvent::ConnectFailed { id, error } => {
                tracing::debug!(conn = %id, error = %error, "Outbound connection failed");
                self.peers.release(id);
                self.peer_tasks.remove(&id);
            }
            ConnectionEvent::Message { id, message } => {
                self.handle_message(id, message);
            }
            ConnectionEvent::Closed { id, reason } => {
                tracing::info!(conn = %id, reason = %reason, "Connection done");
                self.peers.release(id);
                // Task has already finished
                self.peer_tasks.remove(&id);
            }
        }
    }

    /// Handle a message from a connection.
    fn handle_message(&mut self, id: ConnectionId, message: Message) {
        let Some(handle) = self.peers.connection(id) else {
            tracing::trace!(conn = %id, msg = %message, "Message from released connection");
            return;
        };
        let endpoint = handle.endpoint.clone();
        let peer_host = handle.peer_host.clone();

        match message {
            Message::Handshake(handshake) => {
                tracing::info!(conn = %id, endpoint = %endpoint, addr = %handshake.self_addr, "Received handshake");
                self.handle_handshake(id, &endpoint, &peer_host, handshake);
            }
            Message::Ping(text) => {
                tracing::debug!(conn = %id, endpoint = %endpoint, text = %text, "Received ping");
                let reply = Message::PingResponse(ping_response_text(&text, &self.local_identity));
                self.send(id, reply);
            }
            Message::PeerGossip(target) => {
                tracing::debug!(conn = %id, endpoint = %endpoint, peer = %target, "Received peer gossip");
                self.peers.add_peer(target, false);
                self.reconcile();
            }
            Message::HandshakeResponse(response) => {
                tracing::info!(conn = %id, endpoint = %endpoint, from = %response.from_addr, "Handshake acknowledged");
            }
            Message::PingResponse(text) => {
                tracing::debug!(conn = %id, endpoint = %endpoint, text = %text, "Received ping response");
            }
        }
    }

    fn handle_handshake(
        &mut self,
        id: ConnectionId,
        endpoint: &Endpoint,
        peer_host: &str,
        handshake: HandshakeMessage,
    ) {
        if let Err(e) = validate_handshake(&handshake) {
            tracing::warn!(conn = %id, endpoint = %endpoint, error = %e, "Rejecting handshake");
            if let Err(e) = self.peers.close(id) {
                tracing::debug!(conn = %id, error = %e, "Failed to close connection");
            }
            return;
        }

        let response = create_handshake_response(&self.local_identity, endpoint.as_str());
        self.send(id, response);

        match inferred_peer_address(&handshake, peer_host) {
            Ok(Some(target)) => {
                tracing::debug!(conn = %id, peer = %target, "Inferred peer address from handshake");
                self.peers.add_inferred_peer(target);
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(conn = %id, error = %e, "Unusable handshake address"),
        }
        self.reconcile();
    }

    /// Handle a command from a node handle.
    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::AddPeer {
                target,
                sticky,
                reply,
            } => {
                let added = self.peers.add_peer(target, sticky);
                self.reconcile();
                let _ = reply.send(added);
            }
            NodeCommand::Gossip { target, reply } => {
                let sent = self.peers.broadcast(Message::PeerGossip(target));
                let _ = reply.send(sent);
            }
            NodeCommand::OutboundPeers { reply } => {
                let _ = reply.send(self.peers.outbound_peers());
            }
            NodeCommand::Peers { reply } => {
                let _ = reply.send(self.peers.snapshot());
            }
        }
    }

    fn send(&self, id: ConnectionId, message: Message) {
        if let Err(e) = self.peers.send_to(id, message) {
            tracing::debug!(conn = %id, error = %e, "Failed to send to connection");
        }
    }

    /// Close every connection and wait for the tasks to finish.
    async fn shutdown_peers(&mut self) {
        tracing::info!(count = self.peer_tasks.len(), "Shutting down connections");

        self.peers.close_all();

        // Wait for all connection tasks to complete (with timeout)
        let handles: Vec<_> = self.peer_tasks.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
        }
    }
}
