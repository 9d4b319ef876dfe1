//! P2P protocol layer.
//!
//! This module contains:
//! - Message definitions for the five line-protocol message kinds
//! - Newline-delimited framing codec
//! - Handshake logic

pub mod framing;
pub mod handshake;
pub mod messages;

// Re-export main types
pub use framing::MessageCodec;
pub use handshake::{
    create_handshake, create_handshake_response, inferred_peer_address, ping_response_text,
    validate_handshake,
};
pub use messages::{HandshakeMessage, HandshakeResponseMessage, Message, PeerAddress};
