mod frame;
mod loopback;
mod protocol;
mod stats;
mod tracking;
mod transport;
mod udp;

pub use frame::{Frame, FrameBody};
pub use loopback::{LoopbackHub, LoopbackNetworking};
pub use protocol::{
    DEFAULT_SERVER_PORT, EntityRpcMessage, EntityUpdateMessage, MAX_PACKET_SIZE, PACKET_OVERHEAD,
    PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet, PacketError, PacketHeader, PropertyDelta,
    SYNC_CONSOLE_CAPACITY,
};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use tracking::{AckTracker, PendingPacket, ReceiveTracker, ReliablePayload, ReliableReceiver};
pub use transport::{
    ConnectionInfo, ConnectionRole, DisconnectReason, Networking, TransportError, TransportEvent,
};
pub use udp::{UdpNetworking, UdpSettings};
