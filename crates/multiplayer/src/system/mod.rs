mod handlers;

use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crossbeam_channel::Receiver;
use glam::Vec3;

use crate::config::{MultiplayerConfig, ProtocolType};
use crate::connection::{ClientToServerConnectionData, ConnectionData, ServerToClientConnectionData};
use crate::console::{
    Console, ConsoleCommandQueue, ConsoleError, ConsoleFlags, ConsoleQueueSender, CvarValue,
    command_name,
};
use crate::entity::{
    EntityError, FullOwnershipEntityDomain, NetEntityRole, NetworkEntityManager, PrefabDescriptor,
    PrefabEntityId, RpcDeliveryType,
};
use crate::ids::{ConnectionId, HostId};
use crate::net::{
    ConnectionRole, DisconnectReason, Networking, PROTOCOL_VERSION, Packet, PacketHeader,
    TransportError, TransportEvent,
};
use crate::replication::{
    ReplicationSettings, ServerToClientReplicationWindow, UpdateContext, relevance_for_radius,
};
use crate::session::{SessionEvent, SessionEvents};
use crate::stats::{MultiplayerStats, ReplicationTraffic};
use crate::time::NetworkTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AgentType {
    #[default]
    Uninitialized,
    Client,
    ClientServer,
    DedicatedServer,
}

impl AgentType {
    pub fn is_host(self) -> bool {
        matches!(self, AgentType::ClientServer | AgentType::DedicatedServer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Uninitialized => "uninitialized",
            AgentType::Client => "client",
            AgentType::ClientServer => "client-server",
            AgentType::DedicatedServer => "dedicated server",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MultiplayerError {
    #[error("cannot {action} while running as {agent}")]
    WrongAgentType {
        action: &'static str,
        agent: AgentType,
    },
    #[error("invalid address '{0}'")]
    BadAddress(String),
    #[error("protocol {0} is not supported")]
    UnsupportedProtocol(ProtocolType),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Entity(#[from] EntityError),
    #[error(transparent)]
    Console(#[from] ConsoleError),
}

/// Sphere limiting which entities get their render transform blended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewVolume {
    pub center: Vec3,
    pub radius: f32,
}

impl ViewVolume {
    pub fn contains(&self, point: Vec3) -> bool {
        self.center.distance_squared(point) <= self.radius * self.radius
    }
}

/// Owns the transport, the per-connection replication state and the tick loop.
pub struct MultiplayerSystem {
    config: MultiplayerConfig,
    agent_type: AgentType,
    network: Box<dyn Networking>,
    console: Box<dyn Console>,
    entities: NetworkEntityManager,
    time: NetworkTime,
    connections: BTreeMap<ConnectionId, ConnectionData>,
    console_queue: ConsoleCommandQueue,
    events: SessionEvents,
    send_accumulator: Duration,
    camera: Option<ViewVolume>,
    closed_traffic: ReplicationTraffic,
    console_commands_replicated: u64,
    protocol_errors: u64,
}

impl MultiplayerSystem {
    pub fn new(
        config: MultiplayerConfig,
        network: Box<dyn Networking>,
        console: Box<dyn Console>,
    ) -> Self {
        let console_queue =
            ConsoleCommandQueue::new(config.console_queue_capacity, config.sync_console_capacity);
        Self {
            config,
            agent_type: AgentType::Uninitialized,
            network,
            console,
            entities: NetworkEntityManager::new(),
            time: NetworkTime::new(),
            connections: BTreeMap::new(),
            console_queue,
            events: SessionEvents::default(),
            send_accumulator: Duration::ZERO,
            camera: None,
            closed_traffic: ReplicationTraffic::default(),
            console_commands_replicated: 0,
            protocol_errors: 0,
        }
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn config(&self) -> &MultiplayerConfig {
        &self.config
    }

    pub fn network(&self) -> &dyn Networking {
        self.network.as_ref()
    }

    pub fn network_mut(&mut self) -> &mut dyn Networking {
        self.network.as_mut()
    }

    pub fn console(&self) -> &dyn Console {
        self.console.as_ref()
    }

    pub fn entities(&self) -> &NetworkEntityManager {
        &self.entities
    }

    pub fn entities_mut(&mut self) -> &mut NetworkEntityManager {
        &mut self.entities
    }

    pub fn network_time(&self) -> &NetworkTime {
        &self.time
    }

    pub fn network_time_mut(&mut self) -> &mut NetworkTime {
        &mut self.time
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionData> {
        self.connections.get(&id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn register_prefab(&mut self, name: impl Into<String>, prefab: PrefabDescriptor) {
        self.entities.register_prefab(name, prefab);
    }

    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn console_sender(&self) -> ConsoleQueueSender {
        self.console_queue.sender()
    }

    /// `None` blends every active entity.
    pub fn set_camera(&mut self, camera: Option<ViewVolume>) {
        self.camera = camera;
    }

    pub fn stats(&self) -> MultiplayerStats {
        let mut traffic = self.closed_traffic;
        let mut client_connection_count = 0;
        let mut server_connection_count = 0;
        for data in self.connections.values() {
            traffic += data.replication_manager().traffic();
            match data.connection_role() {
                ConnectionRole::Acceptor => client_connection_count += 1,
                ConnectionRole::Connector => server_connection_count += 1,
            }
        }
        MultiplayerStats {
            entity_count: self.entities.entity_count(),
            client_connection_count,
            server_connection_count,
            host_frame_id: self.time.host_frame_id().get(),
            traffic,
            console_commands_replicated: self.console_commands_replicated,
            protocol_errors: self.protocol_errors,
        }
    }

    /// One-way transition out of `Uninitialized`. Returns false and changes
    /// nothing when already initialized.
    pub fn initialize_multiplayer(&mut self, agent_type: AgentType) -> bool {
        if self.agent_type != AgentType::Uninitialized {
            log::debug!(
                "Ignoring initialization as {}, already running as {}",
                agent_type,
                self.agent_type
            );
            return false;
        }
        if agent_type == AgentType::Uninitialized {
            return false;
        }

        self.agent_type = agent_type;
        if agent_type.is_host() {
            let host_id = self
                .network
                .local_addr()
                .map_or(HostId::INVALID, HostId::from_addr);
            self.entities
                .initialize(host_id, Box::new(FullOwnershipEntityDomain));
            self.events.emit(SessionEvent::SessionInit { agent_type });
        }
        log::info!("Multiplayer initialized as {}", agent_type);
        true
    }

    pub fn host(&mut self) -> Result<(), MultiplayerError> {
        if self.agent_type != AgentType::Uninitialized {
            return Err(MultiplayerError::WrongAgentType {
                action: "host",
                agent: self.agent_type,
            });
        }
        self.check_protocol()?;

        let port = self.cvar_port("sv_port", self.config.port);
        if !self.network.is_listening() {
            self.network.listen(port)?;
        }
        let agent_type = if self.cvar_bool("sv_isDedicated", self.config.dedicated) {
            AgentType::DedicatedServer
        } else {
            AgentType::ClientServer
        };
        self.initialize_multiplayer(agent_type);
        log::info!("Hosting map {} on port {}", self.cvar_string("sv_map", &self.config.map), port);
        Ok(())
    }

    /// Connects to `target` (`host[:port]`), defaulting to `cl_serveraddr` and
    /// `cl_serverport`.
    pub fn connect(&mut self, target: Option<&str>) -> Result<ConnectionId, MultiplayerError> {
        if self.agent_type != AgentType::Uninitialized {
            return Err(MultiplayerError::WrongAgentType {
                action: "connect",
                agent: self.agent_type,
            });
        }
        self.check_protocol()?;

        let addr = self.resolve_address(target)?;
        let id = self.network.connect(addr)?;
        self.initialize_multiplayer(AgentType::Client);
        log::info!("Connecting to {} as connection {}", addr, id);
        Ok(id)
    }

    pub fn disconnect(&mut self) {
        self.close_all(DisconnectReason::Graceful);
    }

    pub fn shutdown(&mut self) {
        self.close_all(DisconnectReason::Shutdown);
    }

    pub fn kick(&mut self, id: ConnectionId) {
        if self.connections.contains_key(&id) {
            log::info!("Kicking connection {}", id);
            self.network.disconnect(id, DisconnectReason::Kicked);
        }
    }

    pub fn set_ready_for_entity_updates(&mut self, ready: bool) {
        let servers: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, data)| data.connection_role() == ConnectionRole::Connector)
            .map(|(id, _)| *id)
            .collect();
        for id in servers {
            self.send_reliable(id, &Packet::ReadyForEntityUpdates { ready });
        }
    }

    fn close_all(&mut self, reason: DisconnectReason) {
        for info in self.network.connections() {
            self.network.disconnect(info.id, reason);
        }
        self.teardown_session();
    }

    fn teardown_session(&mut self) {
        for (_, mut data) in std::mem::take(&mut self.connections) {
            self.closed_traffic += data.replication_manager().traffic();
            data.replication_manager_mut().clear(&mut self.entities);
        }
        self.entities.clear();
        self.time.reset();
        self.send_accumulator = Duration::ZERO;

        if self.agent_type != AgentType::Uninitialized {
            log::info!("Leaving {} session", self.agent_type);
            self.agent_type = AgentType::Uninitialized;
            self.events.emit(SessionEvent::SessionShutdown);
        }
    }

    fn check_protocol(&self) -> Result<(), MultiplayerError> {
        let protocol = self
            .console
            .cvar("sv_protocol")
            .and_then(|value| value.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(self.config.protocol);
        match protocol {
            ProtocolType::Udp => Ok(()),
            ProtocolType::Tcp => Err(MultiplayerError::UnsupportedProtocol(protocol)),
        }
    }

    fn resolve_address(&self, target: Option<&str>) -> Result<SocketAddr, MultiplayerError> {
        let default_host = self.cvar_string("cl_serveraddr", &self.config.server_addr);
        let default_port = self.cvar_port("cl_serverport", self.config.server_port);
        let target = target.unwrap_or(&default_host);

        if let Ok(addr) = target.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let (host, port) = match target.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| MultiplayerError::BadAddress(target.to_string()))?,
            ),
            None => (target, default_port),
        };
        (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| MultiplayerError::BadAddress(target.to_string()))
    }

    fn cvar_int(&self, name: &str) -> Option<i64> {
        self.console.cvar(name).and_then(|value| value.as_int())
    }

    fn cvar_port(&self, name: &str, default: u16) -> u16 {
        self.cvar_int(name)
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(default)
    }

    fn cvar_bool(&self, name: &str, default: bool) -> bool {
        self.console
            .cvar(name)
            .and_then(|value| value.as_bool())
            .unwrap_or(default)
    }

    fn cvar_string(&self, name: &str, default: &str) -> String {
        match self.console.cvar(name) {
            Some(CvarValue::Str(value)) => value,
            _ => default.to_string(),
        }
    }

    fn send_interval(&self) -> Duration {
        let ms = self
            .cvar_int("sv_serverSendRateMs")
            .unwrap_or(self.config.server_send_rate_ms.into())
            .max(1);
        Duration::from_millis(ms as u64)
    }

    /// Runs a console line typed or scripted on this process. `host`,
    /// `connect` and `disconnect` drive the session; anything else goes to the
    /// console and is replicated unless flagged `DONT_REPLICATE`.
    pub fn execute_console_command(&mut self, command: &str) -> Result<(), MultiplayerError> {
        let name = command_name(command).ok_or(ConsoleError::Empty)?;
        let mut args = command.split_whitespace().skip(1);
        match name.to_ascii_lowercase().as_str() {
            "host" => return self.host(),
            "connect" => return self.connect(args.next()).map(|_| ()),
            "disconnect" => {
                self.disconnect();
                return Ok(());
            }
            _ => {}
        }

        let flags = self.console.perform_command(command, ConsoleFlags::NONE)?;
        self.replicate_console_command(command, flags);
        Ok(())
    }

    pub(super) fn is_cvar_query(&self, command: &str) -> bool {
        let mut tokens = command.split_whitespace();
        match (tokens.next(), tokens.next()) {
            (Some(name), None) => self.console.cvar(name).is_some(),
            _ => false,
        }
    }

    fn replicate_console_command(&mut self, command: &str, flags: ConsoleFlags) {
        if flags.contains(ConsoleFlags::DONT_REPLICATE) || self.is_cvar_query(command) {
            return;
        }
        let line = command.split_whitespace().collect::<Vec<_>>().join(" ");

        if self.agent_type.is_host() {
            self.console_queue.push(line);
        } else if self.agent_type == AgentType::Client
            && flags.contains(ConsoleFlags::ALLOW_CLIENT_SET)
        {
            let servers: Vec<ConnectionId> = self
                .connections
                .iter()
                .filter(|(_, data)| data.connection_role() == ConnectionRole::Connector)
                .map(|(id, _)| *id)
                .collect();
            for id in servers {
                self.send_reliable(id, &Packet::ConsoleCommand {
                    command: line.clone(),
                });
            }
        }
    }

    /// One frame. Order: transport events, render blend, host send-rate gate
    /// and frame advance, deferred RPCs and dirty notification, per-connection
    /// updates, console replication.
    pub fn on_tick(&mut self, delta: Duration) {
        self.process_network_events();
        self.update_render_blend(delta);

        if self.agent_type.is_host() {
            let interval = self.send_interval();
            self.send_accumulator += delta;
            if self.send_accumulator < interval {
                return;
            }
            self.send_accumulator -= interval;
            if self.send_accumulator >= interval {
                log::debug!(
                    "Dropping {}ms of send backlog",
                    self.send_accumulator.as_millis()
                );
                self.send_accumulator = Duration::ZERO;
            }
            self.time.increment_host_frame_id();
            self.time.advance_host_time(interval.as_millis() as u64);
        }

        self.entities.dispatch_local_deferred_rpcs();
        self.time.clear_rewound_entities();
        self.entities.notify_entities_dirtied();
        self.route_outbound_rpcs();

        let host_frame_id = self.time.host_frame_id();
        let host_time_ms = self.time.host_time_ms();
        for data in self.connections.values_mut() {
            data.update(&mut UpdateContext {
                entities: &mut self.entities,
                network: self.network.as_mut(),
                host_frame_id,
                host_time_ms,
            });
        }

        self.flush_console_queue();
    }

    fn update_render_blend(&mut self, delta: Duration) {
        let accumulated = delta.as_secs_f32() * self.config.blend_rate;
        let factor = 1.0 - 0.2f32.powf(accumulated);
        let camera = self.camera;
        for entity in self.entities.entities_mut() {
            if !entity.is_active() {
                continue;
            }
            if camera.is_some_and(|view| !view.contains(entity.transform)) {
                continue;
            }
            entity.blend_render_transform(factor);
        }
    }

    fn route_outbound_rpcs(&mut self) {
        for rpc in self.entities.drain_outbound_rpcs() {
            let id = rpc.message.entity_id;
            for data in self.connections.values_mut() {
                let role = data.connection_role();
                let manager = data.replication_manager_mut();
                let wanted = match rpc.delivery {
                    RpcDeliveryType::AuthorityToClient => manager.replicates(id).is_some(),
                    RpcDeliveryType::AuthorityToAutonomous => {
                        manager.replicates(id) == Some(NetEntityRole::Autonomous)
                    }
                    RpcDeliveryType::AutonomousToAuthority => role == ConnectionRole::Connector,
                };
                if wanted {
                    manager.add_deferred_rpc(rpc.message.clone(), rpc.reliability);
                }
            }
        }
    }

    fn flush_console_queue(&mut self) {
        let batches = self.console_queue.drain_batches();
        if batches.is_empty() {
            return;
        }
        let acceptors: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, data)| data.connection_role() == ConnectionRole::Acceptor)
            .map(|(id, _)| *id)
            .collect();

        for commands in batches {
            let count = commands.len() as u64;
            let packet = Packet::SyncConsole { commands };
            for &id in &acceptors {
                self.send_reliable(id, &packet);
            }
            self.console_commands_replicated += count;
        }
    }

    fn process_network_events(&mut self) {
        for event in self.network.poll() {
            match event {
                TransportEvent::Connected { id, role, remote } => self.on_connect(id, role, remote),
                TransportEvent::Packet { id, header, packet } => {
                    self.on_packet_received(id, header, packet)
                }
                TransportEvent::Acked { id, packet_id } => {
                    if let Some(data) = self.connections.get_mut(&id) {
                        data.replication_manager_mut().on_packet_acked(packet_id);
                    }
                }
                TransportEvent::Disconnected { id, role, reason } => {
                    self.on_disconnect(id, role, reason)
                }
            }
        }
    }

    fn on_connect(&mut self, id: ConnectionId, role: ConnectionRole, remote: SocketAddr) {
        if self.connections.contains_key(&id) {
            return;
        }
        let settings = ReplicationSettings::from_config(&self.config);

        let data = match role {
            ConnectionRole::Connector => {
                let time_slice = self
                    .cvar_int("cl_defaultNetworkEntityActivationTimeSliceMs")
                    .unwrap_or(self.config.activation_time_slice_ms.into())
                    .max(0) as u64;
                ConnectionData::ClientToServer(ClientToServerConnectionData::new(
                    id, settings, time_slice,
                ))
            }
            ConnectionRole::Acceptor => {
                let controlled = self.spawn_player(id);
                let window = ServerToClientReplicationWindow::new(
                    controlled,
                    id,
                    relevance_for_radius(self.config.relevance_radius),
                )
                .with_limits(
                    self.config.max_window_entities,
                    self.config.max_proxy_entity_send_count,
                );
                ConnectionData::ServerToClient(ServerToClientConnectionData::new(
                    id, window, settings,
                ))
            }
        };
        self.connections.insert(id, data);
        log::info!("Connection {} to {} established ({:?})", id, remote, role);
        self.events
            .emit(SessionEvent::ConnectionAcquired { id, role, remote });

        if role == ConnectionRole::Connector {
            self.send_reliable(id, &Packet::Connect {
                protocol_version: PROTOCOL_VERSION,
            });
        }
    }

    fn spawn_player(&mut self, connection: ConnectionId) -> Option<crate::ids::NetEntityId> {
        let asset = self.cvar_string(
            "sv_defaultPlayerSpawnAsset",
            &self.config.default_player_spawn_asset,
        );
        match self
            .entities
            .create_entity(&PrefabEntityId::new(asset.as_str(), 0), Vec3::ZERO)
        {
            Ok(entity) => {
                if let Some(player) = self.entities.get_mut(entity) {
                    player.owning_connection = Some(connection);
                }
                log::info!("Spawned player entity {} for connection {}", entity, connection);
                Some(entity)
            }
            Err(e) => {
                log::warn!("Failed to spawn {} for connection {}: {}", asset, connection, e);
                None
            }
        }
    }

    fn on_disconnect(&mut self, id: ConnectionId, role: ConnectionRole, reason: DisconnectReason) {
        let Some(mut data) = self.connections.remove(&id) else {
            return;
        };
        log::info!("Connection {} {}", id, reason.as_str());

        self.closed_traffic += data.replication_manager().traffic();
        data.replication_manager_mut().clear(&mut self.entities);
        if let Some(entity) = data.controlled_entity() {
            self.entities.mark_for_removal(entity);
        }
        self.events
            .emit(SessionEvent::ConnectionLost { id, role, reason });

        if role == ConnectionRole::Connector {
            self.teardown_session();
        }
    }

    fn on_packet_received(&mut self, id: ConnectionId, header: PacketHeader, packet: Packet) {
        if !self.connections.contains_key(&id) {
            log::debug!("Ignoring {} from unknown connection {}", packet.name(), id);
            return;
        }
        let name = packet.name();
        log::trace!("Received {} from connection {}", name, id);

        let handled = match packet {
            Packet::Connect { protocol_version } => self.handle_connect(id, protocol_version),
            Packet::Accept { host_id, map } => self.handle_accept(id, host_id, map),
            Packet::ReadyForEntityUpdates { ready } => self.handle_ready_for_entity_updates(id, ready),
            Packet::SyncConsole { commands } => self.handle_sync_console(id, commands),
            Packet::ConsoleCommand { command } => self.handle_console_command(id, command),
            Packet::EntityUpdates {
                host_frame_id,
                host_time_ms,
                updates,
            } => self.handle_entity_updates(id, &header, host_frame_id, host_time_ms, updates),
            Packet::EntityRpcs { rpcs } => self.handle_entity_rpcs(id, rpcs),
            Packet::EntityResets { entity_ids } => self.handle_entity_resets(id, entity_ids),
            Packet::ClientMigration {
                remote_server,
                temporary_user_id,
                last_client_input_id,
            } => self.handle_client_migration(id, remote_server, temporary_user_id, last_client_input_id),
        };

        if !handled {
            log::warn!("Failed to handle {} from connection {}, disconnecting", name, id);
            self.protocol_errors += 1;
            self.network.disconnect(id, DisconnectReason::ProtocolError);
        }
    }

    fn send_reliable(&mut self, id: ConnectionId, packet: &Packet) -> bool {
        match self.network.send_reliable(id, packet) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Failed to send {} to connection {}: {}", packet.name(), id, e);
                false
            }
        }
    }
}
