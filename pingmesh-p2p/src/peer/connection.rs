//! Per-connection read/write task.
//!
//! Each socket is owned by one task that drives a [`Connection`] state
//! machine. Decoded messages and lifecycle changes are reported to the node
//! as [`ConnectionEvent`]s; the node answers through [`ConnectionCommand`]s.

use std::collections::VecDeque;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::peer::{Connection, ConnectionAction, ConnectionId, Endpoint};
use crate::protocol::{Message, MessageCodec};

/// Commands sent from the node to a connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    /// Send a message to the peer.
    Send(Message),
    /// Close the connection.
    Close,
}

/// Events sent from a connection task to the node.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Outbound dial completed.
    Connected { id: ConnectionId },
    /// Outbound dial failed; the connection never opened.
    ConnectFailed { id: ConnectionId, error: String },
    /// Message received from the peer.
    Message { id: ConnectionId, message: Message },
    /// Socket closed.
    Closed { id: ConnectionId, reason: String },
}

/// Spawn the task serving a socket accepted by the listener.
pub fn spawn_inbound(
    id: ConnectionId,
    addr: SocketAddr,
    stream: TcpStream,
    event_tx: mpsc::Sender<ConnectionEvent>,
) -> (mpsc::UnboundedSender<ConnectionCommand>, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut conn = Connection::inbound(id, Endpoint::from(addr));
        conn.arm_read();
        run_connection(conn, stream, Vec::new(), command_rx, event_tx).await;
    });

    (command_tx, handle)
}

/// Drive an established socket until it closes.
///
/// `actions` are the first I/O steps the state machine asked for, such as the
/// handshake of an outbound connection.
pub async fn run_connection(
    mut conn: Connection,
    stream: TcpStream,
    actions: Vec<ConnectionAction>,
    mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let id = conn.id();
    let endpoint = conn.endpoint().clone();
    let mut framed = Framed::new(stream, MessageCodec::new());
    let mut pending: VecDeque<ConnectionAction> = actions.into();
    let mut reason = String::from("closed");

    tracing::debug!(conn = %id, endpoint = %endpoint, direction = %conn.direction(), "Connection running");

    'run: loop {
        while let Some(action) = pending.pop_front() {
            match action {
                ConnectionAction::Send(message) => {
                    tracing::trace!(conn = %id, msg = %message, "Sending message");
                    if let Err(e) = framed.send(message).await {
                        tracing::debug!(conn = %id, endpoint = %endpoint, error = %e, "Send failed");
                        reason = format!("send failed: {e}");
                        conn.close();
                        break 'run;
                    }
                    conn.on_sent();
                }
                ConnectionAction::Close => break 'run,
            }
        }

        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(ConnectionCommand::Send(message)) => pending.extend(conn.send(message)),
                    Some(ConnectionCommand::Close) => {
                        reason = String::from("closed by node");
                        pending.extend(conn.close());
                    }
                    None => {
                        reason = String::from("node dropped connection");
                        conn.close();
                        break 'run;
                    }
                }
            }

            frame = framed.next(), if conn.is_reading() => {
                match frame {
                    Some(Ok(message)) => {
                        if !conn.on_message() {
                            continue;
                        }
                        tracing::trace!(conn = %id, msg = %message, "Received message");
                        if event_tx.send(ConnectionEvent::Message { id, message }).await.is_err() {
                            reason = String::from("node gone");
                            conn.close();
                            break 'run;
                        }
                        pending.extend(conn.after_dispatch());
                    }
                    Some(Err(e)) => {
                        tracing::debug!(conn = %id, endpoint = %endpoint, error = %e, "Read failed");
                        reason = format!("read failed: {e}");
                        conn.close();
                        break 'run;
                    }
                    None => {
                        reason = String::from("end of stream");
                        conn.close();
                        break 'run;
                    }
                }
            }
        }
    }

    if let Err(e) = SinkExt::<Message>::close(&mut framed).await {
        tracing::trace!(conn = %id, error = %e, "Socket shutdown failed");
    }
    conn.on_closed();

    tracing::debug!(conn = %id, endpoint = %endpoint, reason = %reason, "Connection closed");
    let _ = event_tx.send(ConnectionEvent::Closed { id, reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer_addr) = listener.accept().await.unwrap();
        (client, server, peer_addr)
    }

    #[tokio::test]
    async fn test_inbound_reports_messages_and_sends_replies() {
        let (client, server, peer_addr) = socket_pair().await;
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let id = ConnectionId::new(0, 0);

        let (command_tx, handle) = spawn_inbound(id, peer_addr, server, event_tx);

        let (read_half, mut write_half) = client.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // Split across writes, with a garbled line in between.
        write_half.write_all(b"PI").await.unwrap();
        write_half.write_all(b"NG hello\nJUNK\nPING again\n").await.unwrap();

        for expected in ["hello", "again"] {
            match event_rx.recv().await.unwrap() {
                ConnectionEvent::Message { id: got, message } => {
                    assert_eq!(got, id);
                    assert_eq!(message, Message::Ping(expected.into()));
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        command_tx
            .send(ConnectionCommand::Send(Message::PingResponse("pong".into())))
            .unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PINGRESP pong");

        command_tx.send(ConnectionCommand::Close).unwrap();
        match event_rx.recv().await.unwrap() {
            ConnectionEvent::Closed { id: got, .. } => assert_eq!(got, id),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(lines.next_line().await.unwrap().is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_closes_on_end_of_stream() {
        let (client, server, peer_addr) = socket_pair().await;
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let id = ConnectionId::new(3, 1);

        let (_command_tx, handle) = spawn_inbound(id, peer_addr, server, event_tx);
        drop(client);

        match event_rx.recv().await.unwrap() {
            ConnectionEvent::Closed { id: got, reason } => {
                assert_eq!(got, id);
                assert_eq!(reason, "end of stream");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_outbound_runs_handshake_then_pings() {
        let (client, server, _) = socket_pair().await;
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new(1, 0);

        let mut conn = Connection::outbound(id, Endpoint::new("127.0.0.1:5000"), ":5001", 2);
        conn.connect().unwrap();
        let actions = conn.on_connected().unwrap();
        let handle = tokio::spawn(run_connection(conn, client, actions, command_rx, event_tx));

        let (read_half, mut write_half) = server.into_split();
        let mut lines = BufReader::new(read_half).lines();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "HANDSH V01 :5001");
        write_half.write_all(b"HANDSHRESP V01 :5000\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PING Ping_127.0.0.1:5000_1");
        write_half.write_all(b"PINGRESP whatever\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PING Ping_127.0.0.1:5000_2");
        write_half.write_all(b"PINGRESP whatever\n").await.unwrap();
        assert!(lines.next_line().await.unwrap().is_none());

        let mut received = 0;
        loop {
            match event_rx.recv().await.unwrap() {
                ConnectionEvent::Message { .. } => received += 1,
                ConnectionEvent::Closed { id: got, .. } => {
                    assert_eq!(got, id);
                    break;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(received, 3);
        handle.await.unwrap();
    }
}
