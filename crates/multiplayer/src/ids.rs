use std::fmt;
use std::net::{IpAddr, SocketAddr};

use rkyv::{Archive, Deserialize, Serialize};

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

macro_rules! net_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Archive, Serialize,
            Deserialize,
        )]
        #[rkyv(derive(Debug, PartialEq, Eq))]
        pub struct $name(pub $inner);

        impl $name {
            #[inline]
            pub fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

net_id!(
    /// Identifies a replicated entity across every peer of a session.
    NetEntityId(u64)
);
net_id!(
    /// Index of a replicated component inside its entity.
    NetComponentId(u16)
);
net_id!(PropertyIndex(u16));
net_id!(RpcIndex(u16));
net_id!(
    /// Client-authored input sequence number.
    ClientInputId(u32)
);
net_id!(
    /// Authoritative logical tick counter, advanced once per network send tick.
    HostFrameId(u64)
);
net_id!(ConnectionId(u32));
net_id!(
    /// Transport sequence number of a sent packet.
    PacketId(u32)
);

impl NetEntityId {
    pub const INVALID: NetEntityId = NetEntityId(u64::MAX);
}

impl HostFrameId {
    #[inline]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl PacketId {
    #[inline]
    pub fn is_newer_than(self, other: PacketId) -> bool {
        sequence_greater_than(self.0, other.0)
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// Identity of a host, derived from the address it listens on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Archive, Serialize,
    Deserialize,
)]
#[rkyv(derive(Debug, PartialEq, Eq))]
pub struct HostId(pub u64);

impl HostId {
    pub const INVALID: HostId = HostId(0);

    pub fn from_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => u32::from(v4) as u64,
            IpAddr::V6(v6) => {
                let octets = v6.octets();
                octets
                    .chunks(4)
                    .fold(0u64, |acc, c| acc ^ u32::from_be_bytes([c[0], c[1], c[2], c[3]]) as u64)
            }
        };
        Self((ip << 16) | addr.port() as u64)
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return f.write_str("invalid");
        }
        let ip = std::net::Ipv4Addr::from((self.0 >> 16) as u32);
        write!(f, "{}:{}", ip, self.0 & 0xffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_id_wraps() {
        assert!(PacketId(2).is_newer_than(PacketId(1)));
        assert!(!PacketId(1).is_newer_than(PacketId(2)));
        assert!(PacketId(0).is_newer_than(PacketId(u32::MAX)));
        assert!(!PacketId(5).is_newer_than(PacketId(5)));
    }

    #[test]
    fn host_id_from_addr() {
        let addr: SocketAddr = "127.0.0.1:30090".parse().unwrap();
        let host = HostId::from_addr(addr);
        assert!(host.is_valid());
        assert_eq!(host.to_string(), "127.0.0.1:30090");
        assert_eq!(HostId::INVALID.to_string(), "invalid");
    }
}
