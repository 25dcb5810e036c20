use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use crate::config::MultiplayerConfig;
use crate::ids::{ConnectionId, PacketId};

use super::frame::{Frame, FrameBody};
use super::protocol::{MAX_PACKET_SIZE, Packet, PacketHeader};
use super::stats::{NetworkStats, rand_u64};
use super::tracking::{AckTracker, ReceiveTracker, ReliablePayload, ReliableReceiver};
use super::transport::{
    ConnectionInfo, ConnectionRole, DisconnectReason, Networking, TransportError, TransportEvent,
};

const MAX_PENDING_PACKETS: usize = 256;

#[derive(Debug, Clone)]
pub struct UdpSettings {
    /// Local port used when connecting out; zero picks an ephemeral port.
    pub client_port: u16,
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    pub resend_interval: Duration,
}

impl Default for UdpSettings {
    fn default() -> Self {
        Self::from_config(&MultiplayerConfig::default())
    }
}

impl UdpSettings {
    pub fn from_config(config: &MultiplayerConfig) -> Self {
        Self {
            client_port: config.client_port,
            timeout: Duration::from_millis(config.connection_timeout_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            resend_interval: Duration::from_millis(config.resend_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Connecting,
    Connected,
}

#[derive(Debug)]
struct Peer {
    info: ConnectionInfo,
    state: PeerState,
    salt: u64,
    send_sequence: u32,
    next_reliable_id: u64,
    receive_tracker: ReceiveTracker,
    reliable_receiver: ReliableReceiver,
    ack_tracker: AckTracker,
    last_receive: Instant,
    last_send: Instant,
    ack_owed: bool,
}

impl Peer {
    fn new(info: ConnectionInfo, state: PeerState, salt: u64) -> Self {
        let now = Instant::now();
        Self {
            info,
            state,
            salt,
            send_sequence: 1,
            next_reliable_id: 1,
            receive_tracker: ReceiveTracker::new(),
            reliable_receiver: ReliableReceiver::new(),
            ack_tracker: AckTracker::new(MAX_PENDING_PACKETS),
            last_receive: now,
            last_send: now,
            ack_owed: false,
        }
    }

    fn next_sequence(&mut self) -> u32 {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        sequence
    }

    fn reliable_floor(&self) -> u64 {
        self.ack_tracker
            .oldest_reliable_id()
            .unwrap_or(self.next_reliable_id)
    }

    fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive.elapsed() > timeout
    }
}

/// Connection-oriented channel over a single non-blocking UDP socket.
pub struct UdpNetworking {
    socket: Option<UdpSocket>,
    listening: bool,
    settings: UdpSettings,
    peers: HashMap<ConnectionId, Peer>,
    peers_by_addr: HashMap<SocketAddr, ConnectionId>,
    next_connection_id: u32,
    events: Vec<TransportEvent>,
    stats: NetworkStats,
    recv_buffer: Vec<u8>,
}

impl UdpNetworking {
    pub fn new(settings: UdpSettings) -> Self {
        Self {
            socket: None,
            listening: false,
            settings,
            peers: HashMap::new(),
            peers_by_addr: HashMap::new(),
            next_connection_id: 1,
            events: Vec::new(),
            stats: NetworkStats::default(),
            recv_buffer: vec![0u8; MAX_PACKET_SIZE],
        }
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn rtt_ms(&self, id: ConnectionId) -> Option<f32> {
        self.peers.get(&id).map(|peer| peer.ack_tracker.srtt())
    }

    fn bind(&mut self, port: u16) -> io::Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_nonblocking(true)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;
        id
    }

    fn send(
        &mut self,
        id: ConnectionId,
        packet: &Packet,
        reliable: bool,
    ) -> Result<PacketId, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected(id))?;
        let peer = self
            .peers
            .get_mut(&id)
            .ok_or(TransportError::UnknownConnection(id))?;
        if peer.state != PeerState::Connected {
            return Err(TransportError::NotConnected(id));
        }

        let reliable_floor = peer.reliable_floor();
        let reliable = reliable.then(|| {
            let id = peer.next_reliable_id;
            peer.next_reliable_id += 1;
            ReliablePayload {
                id,
                packet: packet.clone(),
            }
        });

        let sequence = peer.next_sequence();
        let body = FrameBody::Payload {
            reliable_id: reliable.as_ref().map(|reliable| reliable.id),
            reliable_floor,
            packet: packet.clone(),
        };
        transmit(socket, peer, &mut self.stats, sequence, body)?;
        Ok(peer.ack_tracker.track_packet(sequence, reliable))
    }

    fn receive(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        let mut frames = Vec::new();
        loop {
            match socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => match Frame::deserialize(&self.recv_buffer[..size]) {
                    Ok(frame) if frame.header.is_valid() => {
                        self.stats.record_received(size);
                        frames.push((frame, addr));
                    }
                    Ok(_) => log::debug!("Ignoring frame with a foreign header from {}", addr),
                    Err(e) => log::debug!("Ignoring malformed frame from {}: {}", addr, e),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable surfaces here on some platforms.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    log::error!("Socket receive failed: {}", e);
                    break;
                }
            }
        }

        for (frame, addr) in frames {
            self.handle_frame(frame, addr);
        }
    }

    fn handle_frame(&mut self, frame: Frame, addr: SocketAddr) {
        if let FrameBody::Hello { salt } = frame.body {
            self.handle_hello(addr, salt);
            return;
        }

        let Some(&id) = self.peers_by_addr.get(&addr) else {
            return;
        };
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };

        if peer.state == PeerState::Connecting {
            if let FrameBody::Welcome { salt } = frame.body {
                if salt == peer.salt {
                    peer.state = PeerState::Connected;
                    peer.last_receive = Instant::now();
                    peer.receive_tracker.record_received(frame.header.sequence);
                    log::info!("Connected to {}", addr);
                    self.events.push(TransportEvent::Connected {
                        id,
                        role: ConnectionRole::Connector,
                        remote: addr,
                    });
                } else {
                    log::warn!("Welcome from {} carried the wrong salt", addr);
                }
            }
            return;
        }

        peer.last_receive = Instant::now();
        if !peer.receive_tracker.record_received(frame.header.sequence) {
            return;
        }

        for packet_id in peer
            .ack_tracker
            .process_ack(frame.header.ack, frame.header.ack_bitfield)
        {
            self.events.push(TransportEvent::Acked { id, packet_id });
        }

        match frame.body {
            FrameBody::Payload {
                reliable_id,
                reliable_floor,
                packet,
            } => {
                peer.ack_owed = true;
                let fresh =
                    reliable_id.is_none_or(|id| peer.reliable_receiver.record_delivered(id));
                peer.reliable_receiver.advance_floor(reliable_floor);
                if !fresh {
                    return;
                }
                self.events.push(TransportEvent::Packet {
                    id,
                    header: frame.header,
                    packet,
                });
            }
            FrameBody::Disconnect { reason } => {
                log::info!("{} closed the connection: {}", addr, reason.as_str());
                let role = peer.info.role;
                self.remove_peer(id);
                self.events
                    .push(TransportEvent::Disconnected { id, role, reason });
            }
            FrameBody::Heartbeat | FrameBody::Welcome { .. } | FrameBody::Hello { .. } => {}
        }
    }

    fn handle_hello(&mut self, addr: SocketAddr, salt: u64) {
        let known = self.peers_by_addr.get(&addr).copied();
        let id = match known {
            Some(id) => id,
            None if self.listening => {
                let id = self.allocate_id();
                let info = ConnectionInfo {
                    id,
                    role: ConnectionRole::Acceptor,
                    remote: addr,
                };
                self.peers
                    .insert(id, Peer::new(info, PeerState::Connected, salt));
                self.peers_by_addr.insert(addr, id);
                log::info!("Accepted connection {} from {}", id, addr);
                self.events.push(TransportEvent::Connected {
                    id,
                    role: ConnectionRole::Acceptor,
                    remote: addr,
                });
                id
            }
            None => return,
        };

        let (Some(socket), Some(peer)) = (self.socket.as_ref(), self.peers.get_mut(&id)) else {
            return;
        };
        if peer.info.role != ConnectionRole::Acceptor {
            return;
        }
        peer.last_receive = Instant::now();
        let sequence = peer.next_sequence();
        let salt = peer.salt;
        if let Err(e) = transmit(socket, peer, &mut self.stats, sequence, FrameBody::Welcome { salt })
        {
            log::warn!("Failed to welcome {}: {}", addr, e);
        }
    }

    fn maintain(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        let mut timed_out = Vec::new();
        for (&id, peer) in self.peers.iter_mut() {
            if peer.is_timed_out(self.settings.timeout) {
                timed_out.push((id, peer.info.role));
                continue;
            }

            if let Err(e) = service_peer(socket, peer, &mut self.stats, &self.settings) {
                log::warn!("Send to {} failed: {}", peer.info.remote, e);
            }
        }

        for (id, role) in timed_out {
            log::warn!("Connection {} timed out", id);
            self.remove_peer(id);
            self.events.push(TransportEvent::Disconnected {
                id,
                role,
                reason: DisconnectReason::Timeout,
            });
        }
    }

    fn remove_peer(&mut self, id: ConnectionId) -> Option<Peer> {
        let peer = self.peers.remove(&id)?;
        self.peers_by_addr.remove(&peer.info.remote);
        Some(peer)
    }
}

fn transmit(
    socket: &UdpSocket,
    peer: &mut Peer,
    stats: &mut NetworkStats,
    sequence: u32,
    body: FrameBody,
) -> Result<(), TransportError> {
    let (ack, ack_bitfield) = peer.receive_tracker.ack_data();
    let frame = Frame::new(PacketHeader::new(sequence, ack, ack_bitfield), body);
    let data = frame.serialize()?;
    if !Frame::fits(&data) {
        return Err(TransportError::Oversize {
            size: data.len(),
            limit: MAX_PACKET_SIZE,
        });
    }

    let bytes = socket.send_to(&data, peer.info.remote)?;
    stats.record_sent(bytes);
    peer.last_send = Instant::now();
    peer.ack_owed = false;
    Ok(())
}

fn service_peer(
    socket: &UdpSocket,
    peer: &mut Peer,
    stats: &mut NetworkStats,
    settings: &UdpSettings,
) -> Result<(), TransportError> {
    match peer.state {
        PeerState::Connecting => {
            if peer.last_send.elapsed() >= settings.heartbeat_interval {
                let sequence = peer.next_sequence();
                let salt = peer.salt;
                transmit(socket, peer, stats, sequence, FrameBody::Hello { salt })?;
            }
        }
        PeerState::Connected => {
            resend_due(socket, peer, stats, settings.resend_interval)?;
            if peer.ack_owed || peer.last_send.elapsed() >= settings.heartbeat_interval {
                let sequence = peer.next_sequence();
                transmit(socket, peer, stats, sequence, FrameBody::Heartbeat)?;
            }
        }
    }
    Ok(())
}

fn resend_due(
    socket: &UdpSocket,
    peer: &mut Peer,
    stats: &mut NetworkStats,
    interval: Duration,
) -> Result<(), TransportError> {
    for (packet_id, reliable) in peer.ack_tracker.due_for_resend(interval) {
        let sequence = peer.next_sequence();
        let body = FrameBody::Payload {
            reliable_id: Some(reliable.id),
            reliable_floor: peer.reliable_floor(),
            packet: reliable.packet,
        };
        transmit(socket, peer, stats, sequence, body)?;
        peer.ack_tracker.resequence(packet_id, sequence);
        stats.packets_resent += 1;
    }
    Ok(())
}

impl Networking for UdpNetworking {
    fn listen(&mut self, port: u16) -> Result<(), TransportError> {
        self.bind(port).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => TransportError::AddrInUse(port),
            _ => TransportError::Io(e),
        })?;
        self.listening = true;
        log::info!("Listening on {}", self.local_addr().map_or(port, |a| a.port()));
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, TransportError> {
        if self.socket.is_none() {
            self.bind(self.settings.client_port)?;
        }
        if let Some(&existing) = self.peers_by_addr.get(&addr) {
            return Ok(existing);
        }

        let id = self.allocate_id();
        let info = ConnectionInfo {
            id,
            role: ConnectionRole::Connector,
            remote: addr,
        };
        let mut peer = Peer::new(info, PeerState::Connecting, rand_u64());

        if let Some(socket) = self.socket.as_ref() {
            let sequence = peer.next_sequence();
            let salt = peer.salt;
            transmit(socket, &mut peer, &mut self.stats, sequence, FrameBody::Hello { salt })?;
        }

        log::info!("Connecting to {}", addr);
        self.peers.insert(id, peer);
        self.peers_by_addr.insert(addr, id);
        Ok(id)
    }

    fn disconnect(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let Some(mut peer) = self.remove_peer(id) else {
            return;
        };
        if let Some(socket) = self.socket.as_ref() {
            let sequence = peer.next_sequence();
            let _ = transmit(
                socket,
                &mut peer,
                &mut self.stats,
                sequence,
                FrameBody::Disconnect { reason },
            );
        }
        self.events.push(TransportEvent::Disconnected {
            id,
            role: peer.info.role,
            reason,
        });
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
        let mut infos: Vec<ConnectionInfo> = self
            .peers
            .values()
            .filter(|peer| peer.state == PeerState::Connected)
            .map(|peer| peer.info)
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        self.receive();
        self.maintain();
        std::mem::take(&mut self.events)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn is_listening(&self) -> bool {
        self.listening
    }
}

impl Drop for UdpNetworking {
    fn drop(&mut self) {
        let ids: Vec<ConnectionId> = self.peers.keys().copied().collect();
        for id in ids {
            self.disconnect(id, DisconnectReason::Shutdown);
        }
    }
}
