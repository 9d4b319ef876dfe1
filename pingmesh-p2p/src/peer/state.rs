//! Connection state machine.
//!
//! [`Connection`] holds the protocol state of one socket without touching the
//! socket itself. The connection task feeds it I/O completions and carries out
//! the [`ConnectionAction`]s it returns, so every transition can be exercised
//! without a network.

use std::fmt;

use crate::error::{P2pError, P2pResult};
use crate::peer::{ConnectionDirection, ConnectionId, Endpoint};
use crate::protocol::{create_handshake, Message};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Outbound connection not yet dialing.
    #[default]
    Idle,
    /// Dial in progress.
    Connecting,
    /// Dial completed, handshake not yet sent.
    Connected,
    /// Inbound socket handed over by the listener.
    Accepted,
    /// A write is in flight.
    Sending,
    /// Last write completed.
    Sent,
    /// Waiting for data from the peer.
    Receiving,
    /// A message was decoded and dispatched.
    Received,
    /// Close issued, waiting for it to complete.
    Closing,
    /// Socket closed.
    Closed,
}

impl ConnectionState {
    /// Check if the socket is established and not tearing down.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Accepted
                | ConnectionState::Sending
                | ConnectionState::Sent
                | ConnectionState::Receiving
                | ConnectionState::Received
        )
    }

    /// Check if the connection is closing or already closed.
    pub fn is_closing(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Accepted => write!(f, "accepted"),
            ConnectionState::Sending => write!(f, "sending"),
            ConnectionState::Sent => write!(f, "sent"),
            ConnectionState::Receiving => write!(f, "receiving"),
            ConnectionState::Received => write!(f, "received"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// I/O the connection task must perform on behalf of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Write a message to the socket.
    Send(Message),
    /// Close the socket.
    Close,
}

/// Handshake-then-ping sequence run by outbound connections.
#[derive(Debug)]
struct PingDriver {
    local_identity: String,
    ping_budget: u32,
    /// Completed sends since the connection was established.
    send_counter: u32,
}

enum DriverStep {
    Close,
    Ping(u32),
    Wait,
}

impl PingDriver {
    fn next_step(&self) -> DriverStep {
        if self.send_counter >= 1 + self.ping_budget {
            DriverStep::Close
        } else if self.send_counter >= 1 {
            DriverStep::Ping(self.send_counter)
        } else {
            DriverStep::Wait
        }
    }
}

/// Protocol state of one TCP connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    direction: ConnectionDirection,
    endpoint: Endpoint,
    state: ConnectionState,
    /// Whether a read is registered with the socket.
    reading: bool,
    /// Present on outbound connections only.
    driver: Option<PingDriver>,
}

impl Connection {
    /// Create an outbound connection that will send `ping_budget` pings after
    /// its handshake and then close.
    pub fn outbound(
        id: ConnectionId,
        endpoint: Endpoint,
        local_identity: impl Into<String>,
        ping_budget: u32,
    ) -> Self {
        Self {
            id,
            direction: ConnectionDirection::Outbound,
            endpoint,
            state: ConnectionState::Idle,
            reading: false,
            driver: Some(PingDriver {
                local_identity: local_identity.into(),
                ping_budget,
                send_counter: 0,
            }),
        }
    }

    /// Create a connection for a socket accepted by the listener.
    pub fn inbound(id: ConnectionId, endpoint: Endpoint) -> Self {
        Self {
            id,
            direction: ConnectionDirection::Inbound,
            endpoint,
            state: ConnectionState::Accepted,
            reading: false,
            driver: None,
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Connection direction.
    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// Remote endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a read is armed.
    pub fn is_reading(&self) -> bool {
        self.reading
    }

    /// Completed sends of an outbound connection.
    pub fn send_counter(&self) -> Option<u32> {
        self.driver.as_ref().map(|d| d.send_counter)
    }

    fn transition_to(&mut self, new_state: ConnectionState) {
        tracing::trace!(
            conn = %self.id,
            from = %self.state,
            to = %new_state,
            "Connection state transition"
        );
        self.state = new_state;
    }

    /// Start dialing.
    ///
    /// Fails without changing state if the connection is inbound, already
    /// dialing or connected, or tearing down.
    pub fn connect(&mut self) -> P2pResult<()> {
        let can_dial = self.direction == ConnectionDirection::Outbound
            && matches!(self.state, ConnectionState::Idle | ConnectionState::Closed);
        if !can_dial {
            return Err(P2pError::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }
        if let Some(driver) = self.driver.as_mut() {
            driver.send_counter = 0;
        }
        self.reading = false;
        self.transition_to(ConnectionState::Connecting);
        Ok(())
    }

    /// The dial failed. The connection never reached `Connected` and is done.
    pub fn connect_failed(&mut self) {
        self.reading = false;
        self.transition_to(ConnectionState::Closed);
    }

    /// The dial completed; outbound connections open with a handshake.
    pub fn on_connected(&mut self) -> P2pResult<Vec<ConnectionAction>> {
        if self.state != ConnectionState::Connecting {
            return Err(P2pError::InvalidState {
                operation: "on_connected",
                state: self.state,
            });
        }
        self.transition_to(ConnectionState::Connected);

        let Some(driver) = self.driver.as_mut() else {
            return Ok(Vec::new());
        };
        driver.send_counter = 0;
        let handshake = create_handshake(&driver.local_identity);
        Ok(self.send(handshake))
    }

    /// Register a read with the socket.
    ///
    /// Returns `true` if the read was newly armed; a second call while one is
    /// outstanding only renames the state.
    pub fn arm_read(&mut self) -> bool {
        if !self.state.is_connected() {
            return false;
        }
        self.transition_to(ConnectionState::Receiving);
        if self.reading {
            return false;
        }
        self.reading = true;
        true
    }

    /// Queue a message for writing. A no-op unless the socket is established.
    pub fn send(&mut self, message: Message) -> Vec<ConnectionAction> {
        if !self.state.is_connected() {
            tracing::trace!(conn = %self.id, state = %self.state, msg = %message, "Dropping send");
            return Vec::new();
        }
        self.transition_to(ConnectionState::Sending);
        vec![ConnectionAction::Send(message)]
    }

    /// A write completed successfully.
    pub fn on_sent(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        self.transition_to(ConnectionState::Sent);
        if let Some(driver) = self.driver.as_mut() {
            driver.send_counter += 1;
        }
        self.arm_read();
    }

    /// A message was decoded. Returns `false` if it must not be dispatched
    /// because the connection is already tearing down.
    ///
    /// The decoded message consumes the armed read.
    pub fn on_message(&mut self) -> bool {
        if !self.state.is_connected() {
            return false;
        }
        self.reading = false;
        self.transition_to(ConnectionState::Received);
        true
    }

    /// Decide what follows a dispatched message.
    ///
    /// Outbound connections act purely on their send counter: they ping until
    /// the budget is spent and then close, whatever the peer replied.
    pub fn after_dispatch(&mut self) -> Vec<ConnectionAction> {
        if !self.state.is_connected() {
            return Vec::new();
        }
        let Some(driver) = self.driver.as_ref() else {
            self.arm_read();
            return Vec::new();
        };
        match driver.next_step() {
            DriverStep::Close => self.close(),
            DriverStep::Ping(counter) => {
                let ping = Message::Ping(format!("Ping_{}_{}", self.endpoint, counter));
                self.send(ping)
            }
            DriverStep::Wait => Vec::new(),
        }
    }

    /// Begin closing. Idempotent: a connection already closing yields nothing.
    pub fn close(&mut self) -> Vec<ConnectionAction> {
        if self.state.is_closing() {
            return Vec::new();
        }
        self.reading = false;
        self.transition_to(ConnectionState::Closing);
        vec![ConnectionAction::Close]
    }

    /// The socket finished closing.
    pub fn on_closed(&mut self) {
        self.reading = false;
        self.transition_to(ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HandshakeMessage;

    fn outbound(budget: u32) -> Connection {
        Connection::outbound(
            ConnectionId::new(0, 0),
            Endpoint::new("127.0.0.1:5000"),
            ":5001",
            budget,
        )
    }

    fn inbound() -> Connection {
        Connection::inbound(ConnectionId::new(1, 0), Endpoint::new("127.0.0.1:50000"))
    }

    /// Run an outbound connection against a peer that answers every write
    /// with one message, returning everything it sent.
    fn drive_outbound(conn: &mut Connection) -> Vec<Message> {
        let mut sent = Vec::new();
        conn.connect().unwrap();
        let mut actions = conn.on_connected().unwrap();

        while let Some(action) = actions.pop() {
            match action {
                ConnectionAction::Send(msg) => {
                    sent.push(msg);
                    conn.on_sent();
                    assert!(conn.on_message());
                    actions.extend(conn.after_dispatch());
                }
                ConnectionAction::Close => {
                    conn.on_closed();
                }
            }
        }
        sent
    }

    #[test]
    fn test_state_checks() {
        assert!(!ConnectionState::Idle.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Accepted.is_connected());
        assert!(ConnectionState::Received.is_connected());
        assert!(!ConnectionState::Closing.is_connected());

        assert!(ConnectionState::Closing.is_closing());
        assert!(ConnectionState::Closed.is_closing());
        assert!(!ConnectionState::Sent.is_closing());
    }

    #[test]
    fn test_outbound_sends_handshake_on_connect() {
        let mut conn = outbound(3);
        assert_eq!(conn.state(), ConnectionState::Idle);

        conn.connect().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);

        let actions = conn.on_connected().unwrap();
        assert_eq!(
            actions,
            vec![ConnectionAction::Send(Message::Handshake(HandshakeMessage {
                version: "V01".into(),
                self_addr: ":5001".into(),
            }))]
        );
        assert_eq!(conn.state(), ConnectionState::Sending);
        assert_eq!(conn.send_counter(), Some(0));
    }

    #[test]
    fn test_outbound_sends_exactly_budget_pings() {
        for budget in [0, 1, 3, 10] {
            let mut conn = outbound(budget);
            let sent = drive_outbound(&mut conn);

            let pings: Vec<_> = sent.iter().filter(|m| matches!(m, Message::Ping(_))).collect();
            assert_eq!(pings.len() as u32, budget);
            assert!(matches!(sent[0], Message::Handshake(_)));
            assert_eq!(sent.len() as u32, budget + 1);
            assert_eq!(conn.state(), ConnectionState::Closed);
        }
    }

    #[test]
    fn test_ping_text_carries_endpoint_and_counter() {
        let mut conn = outbound(2);
        let sent = drive_outbound(&mut conn);
        assert_eq!(sent[1], Message::Ping("Ping_127.0.0.1:5000_1".into()));
        assert_eq!(sent[2], Message::Ping("Ping_127.0.0.1:5000_2".into()));
    }

    #[test]
    fn test_send_completion_arms_read_once() {
        let mut conn = outbound(1);
        conn.connect().unwrap();
        conn.on_connected().unwrap();
        assert!(!conn.is_reading());

        conn.on_sent();
        assert_eq!(conn.send_counter(), Some(1));
        assert_eq!(conn.state(), ConnectionState::Receiving);
        assert!(conn.is_reading());

        // Already armed: state name only.
        assert!(!conn.arm_read());
        assert!(conn.is_reading());
    }

    #[test]
    fn test_message_before_handshake_completes_waits() {
        let mut conn = outbound(2);
        conn.connect().unwrap();
        conn.on_connected().unwrap();
        assert!(conn.on_message());
        assert!(conn.after_dispatch().is_empty());
    }

    #[test]
    fn test_connect_rejected_when_not_idle() {
        let mut conn = outbound(1);
        conn.connect().unwrap();
        assert!(matches!(
            conn.connect(),
            Err(P2pError::InvalidState { operation: "connect", .. })
        ));

        conn.on_connected().unwrap();
        assert!(conn.connect().is_err());
        assert_eq!(conn.state(), ConnectionState::Sending);

        conn.close();
        assert!(conn.connect().is_err());
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_connect_rejected_for_inbound() {
        let mut conn = inbound();
        assert!(conn.connect().is_err());
        assert_eq!(conn.state(), ConnectionState::Accepted);
    }

    #[test]
    fn test_connect_failure_closes() {
        let mut conn = outbound(1);
        conn.connect().unwrap();
        conn.connect_failed();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.on_connected().is_err());
    }

    #[test]
    fn test_inbound_lifecycle() {
        let mut conn = inbound();
        assert_eq!(conn.state(), ConnectionState::Accepted);
        assert_eq!(conn.send_counter(), None);

        assert!(conn.arm_read());
        assert_eq!(conn.state(), ConnectionState::Receiving);

        assert!(conn.on_message());
        assert_eq!(conn.state(), ConnectionState::Received);
        assert!(!conn.is_reading());
        assert!(conn.after_dispatch().is_empty());
        assert_eq!(conn.state(), ConnectionState::Receiving);
        assert!(conn.is_reading());

        let actions = conn.send(Message::PingResponse("x".into()));
        assert_eq!(actions.len(), 1);
        assert_eq!(conn.state(), ConnectionState::Sending);

        conn.on_sent();
        assert_eq!(conn.state(), ConnectionState::Receiving);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut conn = inbound();
        conn.arm_read();

        assert_eq!(conn.close(), vec![ConnectionAction::Close]);
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(!conn.is_reading());
        assert!(conn.close().is_empty());

        conn.on_closed();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.close().is_empty());
    }

    #[test]
    fn test_send_while_closing_is_noop() {
        let mut conn = inbound();
        conn.close();
        assert!(conn.send(Message::Ping("late".into())).is_empty());
        assert_eq!(conn.state(), ConnectionState::Closing);

        conn.on_closed();
        assert!(conn.send(Message::Ping("later".into())).is_empty());
    }

    #[test]
    fn test_messages_after_close_not_dispatched() {
        let mut conn = inbound();
        conn.arm_read();
        conn.close();
        assert!(!conn.on_message());
        assert!(conn.after_dispatch().is_empty());
    }
}
