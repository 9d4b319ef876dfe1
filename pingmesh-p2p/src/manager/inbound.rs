//! Inbound connection listener.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::config::P2pConfig;
use crate::error::{P2pError, P2pResult};

/// Inbound connection listener.
pub struct InboundListener {
    /// TCP listener.
    listener: TcpListener,
}

impl InboundListener {
    /// Bind the listener with the configured backlog.
    pub fn bind(config: &P2pConfig) -> P2pResult<Self> {
        let socket = match config.bind_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(config.bind_addr)?;
        let listener = socket.listen(config.listen_backlog)?;

        tracing::info!(
            addr = %config.bind_addr,
            backlog = config.listen_backlog,
            "Listening for inbound connections"
        );

        Ok(Self { listener })
    }

    /// Get the local address we're listening on.
    pub fn local_addr(&self) -> P2pResult<SocketAddr> {
        self.listener.local_addr().map_err(P2pError::Io)
    }

    /// Accept the next inbound connection.
    pub async fn accept(&self) -> P2pResult<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        tracing::debug!(addr = %addr, "Accepted inbound connection");
        Ok((stream, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port_and_accept() {
        let config = P2pConfig::new("127.0.0.1:0".parse().unwrap());
        let listener = InboundListener::bind(&config).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = TcpStream::connect(addr).await.unwrap();
        let (_stream, remote) = listener.accept().await.unwrap();
        assert_eq!(remote, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let config = P2pConfig::new("127.0.0.1:0".parse().unwrap());
        let first = InboundListener::bind(&config).unwrap();
        let taken = P2pConfig::new(first.local_addr().unwrap());

        assert!(matches!(InboundListener::bind(&taken), Err(P2pError::Io(_))));
    }
}
