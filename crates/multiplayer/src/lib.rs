//! Session and entity replication core: connection lifecycle, per-client
//! replication windows, delta entity updates, RPC routing, the replicated
//! network clock and console variable replication.

pub mod config;
pub mod connection;
pub mod console;
pub mod entity;
pub mod ids;
pub mod net;
pub mod replication;
pub mod session;
pub mod stats;
pub mod system;
pub mod time;

pub use config::{MultiplayerConfig, ProtocolType};
pub use connection::{ClientToServerConnectionData, ConnectionData, ServerToClientConnectionData};
pub use console::{Console, ConsoleError, ConsoleFlags, CvarRegistry, CvarValue};
pub use entity::{NetEntityRole, NetworkEntity, NetworkEntityManager, PrefabDescriptor, PrefabEntityId};
pub use ids::{ConnectionId, HostFrameId, HostId, NetEntityId};
pub use net::{LoopbackHub, LoopbackNetworking, Networking, Packet, UdpNetworking, UdpSettings};
pub use replication::{EntityReplicationManager, ReplicationWindow};
pub use session::SessionEvent;
pub use stats::MultiplayerStats;
pub use system::{AgentType, MultiplayerError, MultiplayerSystem, ViewVolume};
pub use time::NetworkTime;
