//! Transport port
//!
//! The engine never opens sockets. It talks to the outside world through the
//! [`Transport`] trait: serialized messages go out via `send`, inbound
//! messages arrive on an mpsc channel the transport owner hands to the
//! engine. Socket transports (UDP/TCP/TLS/WS) live with the embedding
//! application; this module only fixes the contract and ships a loopback
//! implementation for tests.

use crate::error::SipError;
use crate::message::SipMessage;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportKind {
    /// Token used in the Via header.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
            TransportKind::Wss => "WSS",
        }
    }

    /// Reliable transports skip the retransmission timers.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp => 5060,
            TransportKind::Tls => 5061,
            TransportKind::Ws => 80,
            TransportKind::Wss => 443,
        }
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// Outgoing serialized SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// The port the engine sends through.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Hand a serialized message to the wire. Non-blocking from the
    /// engine's perspective; a failed send surfaces as `TransportError`.
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Local address, used to build Via and Contact headers.
    fn local_addr(&self) -> SocketAddr;

    fn kind(&self) -> TransportKind;
}

/// In-memory transport: everything sent is pushed onto a channel the test
/// inspects, and the test injects inbound traffic on the engine's incoming
/// channel. Models an unreliable transport so retransmission paths run.
pub struct ChannelTransport {
    local: SocketAddr,
    kind: TransportKind,
    outbound: mpsc::UnboundedSender<OutgoingMessage>,
}

impl ChannelTransport {
    pub fn new(
        local: SocketAddr,
        kind: TransportKind,
    ) -> (Self, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                local,
                kind,
                outbound: tx,
            },
            rx,
        )
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        self.outbound
            .send(message)
            .map_err(|e| SipError::TransportError(format!("channel closed: {}", e)))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind() {
        assert!(!TransportKind::Udp.is_reliable());
        assert!(TransportKind::Tcp.is_reliable());
        assert_eq!(TransportKind::Udp.as_str(), "UDP");
        assert_eq!(TransportKind::Tls.default_port(), 5061);
    }

    #[tokio::test]
    async fn test_channel_transport_delivers_outbound() {
        let local: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let (transport, mut outbound) = ChannelTransport::new(local, TransportKind::Udp);

        let dest: SocketAddr = "127.0.0.1:5070".parse().unwrap();
        transport
            .send(OutgoingMessage {
                data: Bytes::from_static(b"OPTIONS sip:x SIP/2.0\r\n\r\n"),
                destination: dest,
            })
            .await
            .unwrap();

        let sent = outbound.recv().await.unwrap();
        assert_eq!(sent.destination, dest);
        assert!(sent.data.starts_with(b"OPTIONS"));
    }
}
