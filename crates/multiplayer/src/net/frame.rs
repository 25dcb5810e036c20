use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::protocol::{MAX_PACKET_SIZE, Packet, PacketError, PacketHeader};
use super::transport::DisconnectReason;

/// Datagram body exchanged by [`super::UdpNetworking`].
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum FrameBody {
    Hello {
        salt: u64,
    },
    Welcome {
        salt: u64,
    },
    Payload {
        reliable_id: Option<u64>,
        /// Reliable ids below this are settled on the sending side.
        reliable_floor: u64,
        packet: Packet,
    },
    Heartbeat,
    Disconnect {
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Frame {
    pub header: PacketHeader,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(header: PacketHeader, body: FrameBody) -> Self {
        Self { header, body }
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

    pub fn fits(encoded: &[u8]) -> bool {
        encoded.len() <= MAX_PACKET_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_frame_survives_the_wire() {
        let frame = Frame::new(
            PacketHeader::new(9, 8, 0b1),
            FrameBody::Payload {
                reliable_id: Some(9),
                reliable_floor: 7,
                packet: Packet::SyncConsole {
                    commands: vec!["sv_map arena".to_string()],
                },
            },
        );
        let bytes = frame.serialize().unwrap();
        assert!(Frame::fits(&bytes));

        let decoded = Frame::deserialize(&bytes).unwrap();
        assert!(decoded.header.is_valid());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = Frame::new(PacketHeader::new(1, 0, 0), FrameBody::Heartbeat)
            .serialize()
            .unwrap();
        assert!(Frame::deserialize(&bytes[..bytes.len() / 2]).is_err());
    }
}
