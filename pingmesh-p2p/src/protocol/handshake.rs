//! Handshake logic.
//!
//! The handshake protocol:
//! 1. The dialing side sends `Handshake` with its version and identity
//! 2. The accepting side validates the version and answers `HandshakeResponse`,
//!    or closes the connection on a mismatch
//! 3. An identity of the form `:port` asks the accepting side to dial back,
//!    using the host it observes on the socket

use crate::config::PROTOCOL_VERSION;
use crate::error::{P2pError, P2pResult};
use crate::protocol::{HandshakeMessage, HandshakeResponseMessage, Message, PeerAddress};

/// Create the handshake sent on a freshly connected outbound socket.
pub fn create_handshake(local_identity: &str) -> Message {
    Message::Handshake(HandshakeMessage {
        version: PROTOCOL_VERSION.to_string(),
        self_addr: local_identity.to_string(),
    })
}

/// Create the reply to an accepted handshake.
pub fn create_handshake_response(local_identity: &str, observed_remote: &str) -> Message {
    Message::HandshakeResponse(HandshakeResponseMessage {
        version: PROTOCOL_VERSION.to_string(),
        from_addr: local_identity.to_string(),
        to_addr: observed_remote.to_string(),
    })
}

/// Validate a received handshake.
///
/// Only an exact version match is accepted.
pub fn validate_handshake(received: &HandshakeMessage) -> P2pResult<()> {
    if received.version != PROTOCOL_VERSION {
        return Err(P2pError::IncompatibleVersion {
            peer_version: received.version.clone(),
            our_version: PROTOCOL_VERSION.to_string(),
        });
    }
    Ok(())
}

/// Dialable address announced by a handshake that only carries a port.
///
/// Returns `Ok(None)` when the peer advertised a full address (or none), since
/// nothing needs to be inferred then. The host is taken from the socket the
/// handshake arrived on.
pub fn inferred_peer_address(
    received: &HandshakeMessage,
    observed_host: &str,
) -> P2pResult<Option<PeerAddress>> {
    let Some(port) = received.self_addr.strip_prefix(':') else {
        return Ok(None);
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| P2pError::InvalidAddress(received.self_addr.clone()))?;
    Ok(Some(PeerAddress::new(observed_host, port)))
}

/// Text of the reply to a ping.
pub fn ping_response_text(ping_text: &str, local_identity: &str) -> String {
    format!("Resp_to_{ping_text}_from_{local_identity}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(version: &str, self_addr: &str) -> HandshakeMessage {
        HandshakeMessage {
            version: version.to_string(),
            self_addr: self_addr.to_string(),
        }
    }

    #[test]
    fn test_validate_handshake() {
        assert!(validate_handshake(&handshake("V01", ":5000")).is_ok());
        assert!(matches!(
            validate_handshake(&handshake("V02", ":5000")),
            Err(P2pError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn test_create_messages() {
        assert_eq!(create_handshake(":5001").to_line(), "HANDSH V01 :5001");
        assert_eq!(
            create_handshake_response(":5000", "127.0.0.1:41000").to_line(),
            "HANDSHRESP V01 :5000 127.0.0.1:41000"
        );
    }

    #[test]
    fn test_port_only_identity_infers_host() {
        let inferred = inferred_peer_address(&handshake("V01", ":5001"), "192.168.1.9").unwrap();
        assert_eq!(inferred, Some(PeerAddress::new("192.168.1.9", 5001)));
    }

    #[test]
    fn test_full_identity_infers_nothing() {
        assert_eq!(
            inferred_peer_address(&handshake("V01", "10.0.0.2:5001"), "10.0.0.2").unwrap(),
            None
        );
        assert_eq!(inferred_peer_address(&handshake("V01", ""), "10.0.0.2").unwrap(), None);
    }

    #[test]
    fn test_bad_port_is_rejected() {
        assert!(inferred_peer_address(&handshake("V01", ":http"), "10.0.0.2").is_err());
    }

    #[test]
    fn test_ping_response_text() {
        assert_eq!(ping_response_text("Ping_a_1", ":5000"), "Resp_to_Ping_a_1_from_:5000");
    }
}
