use std::io;
use std::net::SocketAddr;

use rkyv::{Archive, Deserialize, Serialize};

use crate::ids::{ConnectionId, PacketId};

use super::protocol::{Packet, PacketError, PacketHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// This side opened the connection.
    Connector,
    /// This side accepted the connection while listening.
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    ProtocolError,
    TransportError,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::Shutdown => "shut down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: ConnectionRole,
    pub remote: SocketAddr,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected {
        id: ConnectionId,
        role: ConnectionRole,
        remote: SocketAddr,
    },
    Packet {
        id: ConnectionId,
        header: PacketHeader,
        packet: Packet,
    },
    /// The remote confirmed receipt of a packet sent on this connection.
    Acked {
        id: ConnectionId,
        packet_id: PacketId,
    },
    Disconnected {
        id: ConnectionId,
        role: ConnectionRole,
        reason: DisconnectReason,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} is not established")]
    NotConnected(ConnectionId),
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    Oversize { size: usize, limit: usize },
    #[error("nothing is listening on {0}")]
    ConnectionRefused(SocketAddr),
    #[error("port {0} is already in use")]
    AddrInUse(u16),
}

/// Point-to-point packet channel the session core drives once per tick.
pub trait Networking: Send {
    fn listen(&mut self, port: u16) -> Result<(), TransportError>;

    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, TransportError>;

    fn disconnect(&mut self, id: ConnectionId, reason: DisconnectReason);

    fn send_reliable(&mut self, id: ConnectionId, packet: &Packet)
    -> Result<PacketId, TransportError>;

    fn send_unreliable(
        &mut self,
        id: ConnectionId,
        packet: &Packet,
    ) -> Result<PacketId, TransportError>;

    fn connections(&self) -> Vec<ConnectionInfo>;

    /// Drains everything that happened since the last call.
    fn poll(&mut self) -> Vec<TransportEvent>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn is_listening(&self) -> bool;
}
