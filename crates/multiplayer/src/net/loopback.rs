use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ids::{ConnectionId, PacketId};

use super::protocol::{MAX_PACKET_SIZE, Packet, PacketHeader};
use super::stats::{NetworkStats, PacketLossSimulation};
use super::transport::{
    ConnectionInfo, ConnectionRole, DisconnectReason, Networking, TransportError, TransportEvent,
};

const FIRST_EPHEMERAL_PORT: u16 = 50000;

#[derive(Debug)]
struct Endpoint {
    port: u16,
    mailbox: Vec<TransportEvent>,
    loss: PacketLossSimulation,
    stats: NetworkStats,
}

#[derive(Debug)]
struct Link {
    owner: u32,
    peer: ConnectionId,
    info: ConnectionInfo,
    next_sequence: u32,
}

#[derive(Debug)]
struct HubState {
    next_endpoint: u32,
    next_connection_id: u32,
    next_ephemeral_port: u16,
    listeners: HashMap<u16, u32>,
    endpoints: HashMap<u32, Endpoint>,
    links: HashMap<ConnectionId, Link>,
}

impl HubState {
    fn push(&mut self, endpoint: u32, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get_mut(&endpoint) {
            endpoint.mailbox.push(event);
        }
    }

    fn address_of(&self, endpoint: u32) -> SocketAddr {
        let port = self.endpoints.get(&endpoint).map_or(0, |e| e.port);
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;
        id
    }

    fn unlink(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };
        let owner = link.owner;
        self.push(
            owner,
            TransportEvent::Disconnected {
                id,
                role: link.info.role,
                reason,
            },
        );

        if let Some(peer) = self.links.remove(&link.peer) {
            let peer_owner = peer.owner;
            self.push(
                peer_owner,
                TransportEvent::Disconnected {
                    id: link.peer,
                    role: peer.info.role,
                    reason,
                },
            );
        }
    }
}

/// In-process switchboard that [`LoopbackNetworking`] endpoints attach to.
#[derive(Debug, Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                next_endpoint: 1,
                next_connection_id: 1,
                next_ephemeral_port: FIRST_EPHEMERAL_PORT,
                listeners: HashMap::new(),
                endpoints: HashMap::new(),
                links: HashMap::new(),
            })),
        }
    }

    pub fn endpoint(&self) -> LoopbackNetworking {
        let mut state = self.state.lock();
        let key = state.next_endpoint;
        state.next_endpoint += 1;
        let port = state.next_ephemeral_port;
        state.next_ephemeral_port = state.next_ephemeral_port.wrapping_add(1);
        state.endpoints.insert(
            key,
            Endpoint {
                port,
                mailbox: Vec::new(),
                loss: PacketLossSimulation::default(),
                stats: NetworkStats::default(),
            },
        );

        LoopbackNetworking {
            hub: self.clone(),
            key,
            listening: false,
        }
    }
}

/// Delivers packets in order and acknowledges them as soon as they are queued
/// for the peer. Unreliable sends honour the endpoint's loss simulation.
#[derive(Debug)]
pub struct LoopbackNetworking {
    hub: LoopbackHub,
    key: u32,
    listening: bool,
}

impl LoopbackNetworking {
    pub fn set_packet_loss(&self, loss: PacketLossSimulation) {
        if let Some(endpoint) = self.hub.state.lock().endpoints.get_mut(&self.key) {
            endpoint.loss = loss;
        }
    }

    pub fn stats(&self) -> NetworkStats {
        self.hub
            .state
            .lock()
            .endpoints
            .get(&self.key)
            .map(|e| e.stats.clone())
            .unwrap_or_default()
    }

    fn send(
        &mut self,
        id: ConnectionId,
        packet: &Packet,
        reliable: bool,
    ) -> Result<PacketId, TransportError> {
        let data = packet.serialize()?;
        if data.len() > MAX_PACKET_SIZE {
            return Err(TransportError::Oversize {
                size: data.len(),
                limit: MAX_PACKET_SIZE,
            });
        }
        let delivered = Packet::deserialize(&data)?;

        let mut state = self.hub.state.lock();
        let link = state
            .links
            .get_mut(&id)
            .filter(|link| link.owner == self.key)
            .ok_or(TransportError::UnknownConnection(id))?;
        let sequence = link.next_sequence;
        link.next_sequence = link.next_sequence.wrapping_add(1);
        let peer = link.peer;
        let packet_id = PacketId(sequence);

        let dropped = match state.endpoints.get_mut(&self.key) {
            Some(endpoint) => {
                endpoint.stats.record_sent(data.len());
                let dropped = !reliable && endpoint.loss.should_drop();
                if dropped {
                    endpoint.stats.packets_dropped += 1;
                }
                dropped
            }
            None => false,
        };
        if dropped {
            return Ok(packet_id);
        }

        let Some(peer_owner) = state.links.get(&peer).map(|link| link.owner) else {
            return Err(TransportError::NotConnected(id));
        };
        if let Some(endpoint) = state.endpoints.get_mut(&peer_owner) {
            endpoint.stats.record_received(data.len());
        }
        state.push(
            peer_owner,
            TransportEvent::Packet {
                id: peer,
                header: PacketHeader::new(sequence, 0, 0),
                packet: delivered,
            },
        );
        state.push(self.key, TransportEvent::Acked { id, packet_id });
        Ok(packet_id)
    }
}

impl Networking for LoopbackNetworking {
    fn listen(&mut self, port: u16) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        if state.listeners.contains_key(&port) {
            return Err(TransportError::AddrInUse(port));
        }
        state.listeners.insert(port, self.key);
        if let Some(endpoint) = state.endpoints.get_mut(&self.key) {
            endpoint.port = port;
        }
        self.listening = true;
        log::info!("Loopback endpoint listening on {}", port);
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, TransportError> {
        let mut state = self.hub.state.lock();
        let target = *state
            .listeners
            .get(&addr.port())
            .ok_or(TransportError::ConnectionRefused(addr))?;

        let local = state.allocate_id();
        let remote = state.allocate_id();
        let local_addr = state.address_of(self.key);

        state.links.insert(
            local,
            Link {
                owner: self.key,
                peer: remote,
                info: ConnectionInfo {
                    id: local,
                    role: ConnectionRole::Connector,
                    remote: addr,
                },
                next_sequence: 1,
            },
        );
        state.links.insert(
            remote,
            Link {
                owner: target,
                peer: local,
                info: ConnectionInfo {
                    id: remote,
                    role: ConnectionRole::Acceptor,
                    remote: local_addr,
                },
                next_sequence: 1,
            },
        );

        state.push(
            target,
            TransportEvent::Connected {
                id: remote,
                role: ConnectionRole::Acceptor,
                remote: local_addr,
            },
        );
        state.push(
            self.key,
            TransportEvent::Connected {
                id: local,
                role: ConnectionRole::Connector,
                remote: addr,
            },
        );
        Ok(local)
    }

    fn disconnect(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let mut state = self.hub.state.lock();
        if state.links.get(&id).is_some_and(|link| link.owner == self.key) {
            state.unlink(id, reason);
        }
    }

    fn send_reliable(
        &mut self,
        id: ConnectionId,
        packet: &Packet,
    ) -> Result<PacketId, TransportError> {
        self.send(id, packet, true)
    }

    fn send_unreliable(
        &mut self,
        id: ConnectionId,
        packet: &Packet,
    ) -> Result<PacketId, TransportError> {
        self.send(id, packet, false)
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.hub.state.lock();
        let mut infos: Vec<ConnectionInfo> = state
            .links
            .values()
            .filter(|link| link.owner == self.key)
            .map(|link| link.info)
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut state = self.hub.state.lock();
        state
            .endpoints
            .get_mut(&self.key)
            .map(|endpoint| std::mem::take(&mut endpoint.mailbox))
            .unwrap_or_default()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.hub.state.lock().address_of(self.key))
    }

    fn is_listening(&self) -> bool {
        self.listening
    }
}

impl Drop for LoopbackNetworking {
    fn drop(&mut self) {
        let mut state = self.hub.state.lock();
        let owned: Vec<ConnectionId> = state
            .links
            .iter()
            .filter(|(_, link)| link.owner == self.key)
            .map(|(&id, _)| id)
            .collect();
        for id in owned {
            state.unlink(id, DisconnectReason::Shutdown);
        }
        state.listeners.retain(|_, key| *key != self.key);
        state.endpoints.remove(&self.key);
    }
}
