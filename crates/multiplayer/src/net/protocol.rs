use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::entity::{NetEntityRole, PrefabEntityId, PropertyValue};
use crate::ids::{
    ClientInputId, HostFrameId, HostId, NetComponentId, NetEntityId, PacketId, PropertyIndex,
    RpcIndex,
};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x4d50_4c59;
pub const DEFAULT_SERVER_PORT: u16 = 33450;
pub const SYNC_CONSOLE_CAPACITY: usize = 32;

/// Bytes the transport header and the packet envelope take out of every datagram.
pub const PACKET_OVERHEAD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }

    pub fn packet_id(&self) -> PacketId {
        PacketId(self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PropertyDelta {
    pub component: NetComponentId,
    pub property: PropertyIndex,
    pub value: PropertyValue,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EntityUpdateMessage {
    pub entity_id: NetEntityId,
    /// Role the receiving peer binds its copy of the entity to.
    pub network_role: NetEntityRole,
    pub is_delete: bool,
    pub prefab: Option<PrefabEntityId>,
    pub transform: Option<[f32; 3]>,
    pub properties: Vec<PropertyDelta>,
}

impl EntityUpdateMessage {
    pub fn delete(entity_id: NetEntityId, network_role: NetEntityRole) -> Self {
        Self {
            entity_id,
            network_role,
            is_delete: true,
            prefab: None,
            transform: None,
            properties: Vec::new(),
        }
    }

    pub fn estimated_size(&self) -> usize {
        let prefab = self.prefab.as_ref().map_or(1, |p| 1 + p.estimated_size());
        let transform = if self.transform.is_some() { 13 } else { 1 };
        let properties: usize = self
            .properties
            .iter()
            .map(|d| 4 + d.value.estimated_size())
            .sum();
        12 + prefab + transform + 4 + properties
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EntityRpcMessage {
    pub entity_id: NetEntityId,
    pub component: NetComponentId,
    pub rpc: RpcIndex,
    pub params: Vec<PropertyValue>,
    pub input_id: Option<ClientInputId>,
}

impl EntityRpcMessage {
    pub fn new(entity_id: NetEntityId, component: NetComponentId, rpc: RpcIndex) -> Self {
        Self {
            entity_id,
            component,
            rpc,
            params: Vec::new(),
            input_id: None,
        }
    }

    pub fn estimated_size(&self) -> usize {
        let params: usize = self.params.iter().map(PropertyValue::estimated_size).sum();
        8 + 2 + 2 + 4 + params + 5
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Packet {
    Connect {
        protocol_version: u32,
    },
    Accept {
        host_id: HostId,
        map: String,
    },
    ReadyForEntityUpdates {
        ready: bool,
    },
    SyncConsole {
        commands: Vec<String>,
    },
    ConsoleCommand {
        command: String,
    },
    EntityUpdates {
        host_frame_id: HostFrameId,
        host_time_ms: u64,
        updates: Vec<EntityUpdateMessage>,
    },
    EntityRpcs {
        rpcs: Vec<EntityRpcMessage>,
    },
    EntityResets {
        entity_ids: Vec<NetEntityId>,
    },
    ClientMigration {
        remote_server: HostId,
        temporary_user_id: u64,
        last_client_input_id: ClientInputId,
    },
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect { .. } => "Connect",
            Packet::Accept { .. } => "Accept",
            Packet::ReadyForEntityUpdates { .. } => "ReadyForEntityUpdates",
            Packet::SyncConsole { .. } => "SyncConsole",
            Packet::ConsoleCommand { .. } => "ConsoleCommand",
            Packet::EntityUpdates { .. } => "EntityUpdates",
            Packet::EntityRpcs { .. } => "EntityRpcs",
            Packet::EntityResets { .. } => "EntityResets",
            Packet::ClientMigration { .. } => "ClientMigration",
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        // Datagram buffers carry no alignment guarantee.
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_serialization() {
        let packet = Packet::EntityUpdates {
            host_frame_id: HostFrameId(42),
            host_time_ms: 2100,
            updates: vec![EntityUpdateMessage {
                entity_id: NetEntityId(7),
                network_role: NetEntityRole::Client,
                is_delete: false,
                prefab: Some(PrefabEntityId::new("prefabs/crate.network.spawnable", 0)),
                transform: Some([1.0, 2.0, 3.0]),
                properties: vec![PropertyDelta {
                    component: NetComponentId(0),
                    property: PropertyIndex(1),
                    value: PropertyValue::Text("lid".to_string()),
                }],
            }],
        };

        let bytes = packet.serialize().unwrap();
        let decoded = Packet::deserialize(&bytes).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Packet::deserialize(&[0xff; 3]).is_err());
    }

    #[test]
    fn test_estimated_size_grows_with_payload() {
        let mut update = EntityUpdateMessage::delete(NetEntityId(1), NetEntityRole::Client);
        let base = update.estimated_size();
        update.properties.push(PropertyDelta {
            component: NetComponentId(0),
            property: PropertyIndex(0),
            value: PropertyValue::Vec3([0.0; 3]),
        });
        assert!(update.estimated_size() > base);
    }
}
