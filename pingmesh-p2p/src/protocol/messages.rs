//! P2P protocol messages.
//!
//! Every message travels as a single line of space-separated tokens. The first
//! token names the message kind; field values never contain whitespace.

use std::fmt;
use std::str::FromStr;

use crate::error::{P2pError, P2pResult};

const HANDSHAKE: &str = "HANDSH";
const HANDSHAKE_RESPONSE: &str = "HANDSHRESP";
const PING: &str = "PING";
const PING_RESPONSE: &str = "PINGRESP";
const PEER: &str = "PEER";

/// A dialable `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl PeerAddress {
    /// Create a new peer address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = P2pError;

    fn from_str(s: &str) -> P2pResult<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| P2pError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(P2pError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| P2pError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Opening message of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    /// Protocol version tag.
    pub version: String,
    /// Sender's own address: `host:port`, or `:port` when it only knows its
    /// listen port. Empty when omitted.
    pub self_addr: String,
}

/// Reply to a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponseMessage {
    /// Protocol version tag.
    pub version: String,
    /// Responder's identity.
    pub from_addr: String,
    /// The initiator's address as observed by the responder. Empty when omitted.
    pub to_addr: String,
}

/// All P2P protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Version and identity sent at start of connection.
    Handshake(HandshakeMessage),
    /// Acknowledgment of a handshake.
    HandshakeResponse(HandshakeResponseMessage),
    /// Ping carrying free text.
    Ping(String),
    /// Reply to a ping.
    PingResponse(String),
    /// Announcement of another dialable peer.
    PeerGossip(PeerAddress),
}

impl Message {
    /// Get a human-readable name for the message type.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::HandshakeResponse(_) => "handshake_response",
            Message::Ping(_) => "ping",
            Message::PingResponse(_) => "ping_response",
            Message::PeerGossip(_) => "peer_gossip",
        }
    }

    /// Render the wire form of this message, without the line terminator.
    pub fn to_line(&self) -> String {
        match self {
            Message::Handshake(hs) => {
                let mut line = format!("{HANDSHAKE} {}", hs.version);
                if !hs.self_addr.is_empty() {
                    line.push(' ');
                    line.push_str(&hs.self_addr);
                }
                line
            }
            Message::HandshakeResponse(resp) => {
                let mut line = format!("{HANDSHAKE_RESPONSE} {} {}", resp.version, resp.from_addr);
                if !resp.to_addr.is_empty() {
                    line.push(' ');
                    line.push_str(&resp.to_addr);
                }
                line
            }
            Message::Ping(text) => format!("{PING} {text}"),
            Message::PingResponse(text) => format!("{PING_RESPONSE} {text}"),
            Message::PeerGossip(addr) => format!("{PEER} {} {}", addr.host, addr.port),
        }
    }
}

impl FromStr for Message {
    type Err = P2pError;

    fn from_str(line: &str) -> P2pResult<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let malformed = || P2pError::Decode(format!("'{line}' ({} tokens)", tokens.len()));

        match tokens.as_slice() {
            [HANDSHAKE, version, rest @ ..] => Ok(Message::Handshake(HandshakeMessage {
                version: version.to_string(),
                self_addr: rest.first().map(|s| s.to_string()).unwrap_or_default(),
            })),
            [HANDSHAKE_RESPONSE, version, from_addr, rest @ ..] => {
                Ok(Message::HandshakeResponse(HandshakeResponseMessage {
                    version: version.to_string(),
                    from_addr: from_addr.to_string(),
                    to_addr: rest.first().map(|s| s.to_string()).unwrap_or_default(),
                }))
            }
            [PING, text, ..] => Ok(Message::Ping(text.to_string())),
            [PING_RESPONSE, text, ..] => Ok(Message::PingResponse(text.to_string())),
            [PEER, host, port, ..] => {
                let port = port.parse::<u16>().map_err(|_| malformed())?;
                Ok(Message::PeerGossip(PeerAddress::new(*host, port)))
            }
            _ => Err(malformed()),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Handshake(hs) => {
                write!(f, "Handshake(version={}, addr={})", hs.version, hs.self_addr)
            }
            Message::HandshakeResponse(resp) => write!(
                f,
                "HandshakeResponse(version={}, from={}, to={})",
                resp.version, resp.from_addr, resp.to_addr
            ),
            Message::Ping(text) => write!(f, "Ping({text})"),
            Message::PingResponse(text) => write!(f, "PingResponse({text})"),
            Message::PeerGossip(addr) => write!(f, "PeerGossip({addr})"),
        }
    }
}
