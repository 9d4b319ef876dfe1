//! Outbound connection management.

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{P2pError, P2pResult};
use crate::peer::{
    run_connection, Connection, ConnectionCommand, ConnectionEvent, ConnectionId, Endpoint,
};
use crate::protocol::PeerAddress;

/// Dial a peer and run the handshake-then-ping sequence on the new socket.
///
/// The returned channel accepts commands right away. A `Close` sent while the
/// dial is still pending aborts it, which is reported as a failed dial.
pub fn connect_to_peer(
    id: ConnectionId,
    target: PeerAddress,
    local_identity: String,
    ping_budget: u32,
    event_tx: mpsc::Sender<ConnectionEvent>,
) -> (mpsc::UnboundedSender<ConnectionCommand>, JoinHandle<()>) {
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut conn = Connection::outbound(id, Endpoint::from(&target), local_identity, ping_budget);

        let dialed = match conn.connect() {
            Ok(()) => dial(&mut conn, &target, &mut command_rx).await,
            Err(e) => Err(e),
        };

        let stream = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(conn = %id, target = %target, error = %e, "Outbound connection failed");
                conn.connect_failed();
                let _ = event_tx
                    .send(ConnectionEvent::ConnectFailed {
                        id,
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let actions = match conn.on_connected() {
            Ok(actions) => actions,
            Err(e) => {
                tracing::warn!(conn = %id, target = %target, error = %e, "Connection state error");
                let _ = event_tx
                    .send(ConnectionEvent::ConnectFailed {
                        id,
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        tracing::debug!(conn = %id, target = %target, "TCP connection established, starting handshake");
        if event_tx.send(ConnectionEvent::Connected { id }).await.is_err() {
            return;
        }

        run_connection(conn, stream, actions, command_rx, event_tx).await;
    });

    (command_tx, handle)
}

/// Wait for the dial to complete or be cancelled by the node.
async fn dial(
    conn: &mut Connection,
    target: &PeerAddress,
    command_rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
) -> P2pResult<TcpStream> {
    tracing::debug!(conn = %conn.id(), target = %target, "Connecting to peer");

    let connect = TcpStream::connect((target.host.as_str(), target.port));
    tokio::pin!(connect);

    loop {
        tokio::select! {
            result = &mut connect => {
                let stream = result?;
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!(target = %target, error = %e, "Failed to set TCP_NODELAY");
                }
                return Ok(stream);
            }

            command = command_rx.recv() => {
                match command {
                    // Not connected yet: the state machine drops it.
                    Some(ConnectionCommand::Send(message)) => {
                        conn.send(message);
                    }
                    Some(ConnectionCommand::Close) | None => return Err(P2pError::Shutdown),
                }
            }
        }
    }
}
