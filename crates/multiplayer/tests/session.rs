use std::net::SocketAddr;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use multiplayer::console::ConsoleFlags;
use multiplayer::entity::{
    ComponentDescriptor, PropertyValue, Reliability, RpcDeliveryType, RpcDescriptor,
};
use multiplayer::ids::{ClientInputId, NetComponentId, PacketId, RpcIndex};
use multiplayer::net::{ConnectionInfo, DisconnectReason, TransportError, TransportEvent};
use multiplayer::{
    AgentType, ConnectionId, CvarRegistry, CvarValue, HostId, LoopbackHub, MultiplayerConfig,
    MultiplayerSystem, NetEntityId, NetEntityRole, Networking, Packet, PrefabDescriptor,
    SessionEvent,
};

const PLAYER_PREFAB: &str = "prefabs/player.network.spawnable";
const PORT: u16 = 30000;
const FRAME: Duration = Duration::from_millis(50);

/// Passes everything through and reports every packet this side receives.
struct RecordingNetworking<N> {
    inner: N,
    received: Sender<Packet>,
}

impl<N: Networking> Networking for RecordingNetworking<N> {
    fn listen(&mut self, port: u16) -> Result<(), TransportError> {
        self.inner.listen(port)
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, TransportError> {
        self.inner.connect(addr)
    }

    fn disconnect(&mut self, id: ConnectionId, reason: DisconnectReason) {
        self.inner.disconnect(id, reason)
    }

    fn send_reliable(
        &mut self,
        id: ConnectionId,
        packet: &Packet,
    ) -> Result<PacketId, TransportError> {
        self.inner.send_reliable(id, packet)
    }

    fn send_unreliable(
        &mut self,
        id: ConnectionId,
        packet: &Packet,
    ) -> Result<PacketId, TransportError> {
        self.inner.send_unreliable(id, packet)
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.connections()
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let events = self.inner.poll();
        for event in &events {
            if let TransportEvent::Packet { packet, .. } = event {
                let _ = self.received.send(packet.clone());
            }
        }
        events
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn is_listening(&self) -> bool {
        self.inner.is_listening()
    }
}

fn player_prefab() -> PrefabDescriptor {
    PrefabDescriptor::single(vec![
        ComponentDescriptor::new("Health")
            .with_property(PropertyValue::Int(100))
            .with_rpc(RpcDescriptor::new(
                "Flash",
                RpcDeliveryType::AuthorityToClient,
                Reliability::Reliable,
            ))
            .with_rpc(RpcDescriptor::new(
                "Move",
                RpcDeliveryType::AutonomousToAuthority,
                Reliability::Reliable,
            )),
    ])
}

fn config() -> MultiplayerConfig {
    MultiplayerConfig {
        port: PORT,
        ..MultiplayerConfig::default()
    }
}

fn console(config: &MultiplayerConfig) -> CvarRegistry {
    let mut console = CvarRegistry::from_config(config);
    console.register_cvar("g_gravity", CvarValue::Float(-9.8), ConsoleFlags::ALLOW_CLIENT_SET);
    console
}

struct Peer {
    system: MultiplayerSystem,
    received: Receiver<Packet>,
}

impl Peer {
    fn new(hub: &LoopbackHub, console: CvarRegistry) -> Self {
        let (tx, received) = unbounded();
        let network = RecordingNetworking {
            inner: hub.endpoint(),
            received: tx,
        };
        let mut system = MultiplayerSystem::new(config(), Box::new(network), Box::new(console));
        system.register_prefab(PLAYER_PREFAB, player_prefab());
        Self { system, received }
    }

    fn received(&self) -> Vec<Packet> {
        self.received.try_iter().collect()
    }
}

fn count(packets: &[Packet], name: &str) -> usize {
    packets.iter().filter(|packet| packet.name() == name).count()
}

fn pump(server: &mut Peer, clients: &mut [&mut Peer], rounds: usize) {
    for _ in 0..rounds {
        server.system.on_tick(FRAME);
        for client in clients.iter_mut() {
            client.system.on_tick(FRAME);
        }
    }
}

/// Host plus one connected client whose player entity is live on both sides.
fn session() -> (LoopbackHub, Peer, Peer) {
    let hub = LoopbackHub::new();
    let cfg = config();
    let mut server = Peer::new(&hub, console(&cfg));
    let mut client = Peer::new(&hub, console(&cfg));

    server.system.execute_console_command("host").unwrap();
    client
        .system
        .execute_console_command(&format!("connect 127.0.0.1:{}", PORT))
        .unwrap();
    pump(&mut server, &mut [&mut client], 4);
    server.received();
    client.received();
    (hub, server, client)
}

fn player(peer: &Peer) -> NetEntityId {
    peer.system
        .entities()
        .entities()
        .next()
        .map(|entity| entity.id)
        .expect("player entity")
}

#[test]
fn client_loads_the_map_the_server_accepts_with() {
    let hub = LoopbackHub::new();
    let cfg = config();
    let mut server = Peer::new(&hub, console(&cfg));

    let (loads_tx, loads) = unbounded();
    let mut client_console = console(&cfg);
    client_console.set("sv_map", CvarValue::Str("elsewhere".to_string()));
    client_console.register_function("LoadLevel", ConsoleFlags::DONT_REPLICATE, move |args| {
        loads_tx.send(args.join(" ")).map_err(|e| e.to_string())
    });
    let mut client = Peer::new(&hub, client_console);
    let client_events = client.system.subscribe();

    server.system.execute_console_command("host").unwrap();
    assert_eq!(server.system.agent_type(), AgentType::ClientServer);
    client
        .system
        .execute_console_command("connect 127.0.0.1:30000")
        .unwrap();
    assert_eq!(client.system.agent_type(), AgentType::Client);

    pump(&mut server, &mut [&mut client], 2);

    let to_server = server.received();
    assert_eq!(to_server.first().map(Packet::name), Some("Connect"));
    let to_client = client.received();
    assert!(to_client.iter().any(|packet| matches!(
        packet,
        Packet::Accept { host_id, map } if !host_id.is_valid() && map == "nolevel"
    )));

    assert_eq!(
        client.system.console().cvar("sv_map"),
        Some(CvarValue::Str("nolevel".to_string()))
    );
    assert_eq!(loads.try_recv().unwrap(), "nolevel");
    assert!(
        client_events
            .try_iter()
            .any(|event| event == SessionEvent::LevelLoadRequested { map: "nolevel".to_string() })
    );
}

#[test]
fn console_commands_batch_into_sync_packets() {
    let (_hub, mut server, mut client) = session();

    for _ in 0..40 {
        server
            .system
            .execute_console_command("sv_serverSendRateMs 50")
            .unwrap();
    }
    pump(&mut server, &mut [&mut client], 1);

    let batches: Vec<usize> = client
        .received()
        .iter()
        .filter_map(|packet| match packet {
            Packet::SyncConsole { commands } => Some(commands.len()),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![32, 8]);
    assert_eq!(count(&server.received(), "SyncConsole"), 0);
    assert_eq!(server.system.stats().console_commands_replicated, 40);
}

#[test]
fn local_only_commands_stay_local() {
    let (_hub, mut server, mut client) = session();

    server
        .system
        .execute_console_command("sv_map arena")
        .unwrap();
    pump(&mut server, &mut [&mut client], 2);

    assert_eq!(count(&client.received(), "SyncConsole"), 0);
    assert_eq!(
        client.system.console().cvar("sv_map"),
        Some(CvarValue::Str("nolevel".to_string()))
    );
    assert_eq!(server.system.stats().console_commands_replicated, 0);
}

#[test]
fn cvar_queries_are_not_replicated() {
    let (_hub, mut server, mut client) = session();

    server
        .system
        .execute_console_command("sv_serverSendRateMs")
        .unwrap();
    client.system.execute_console_command("g_gravity").unwrap();
    pump(&mut server, &mut [&mut client], 2);

    assert_eq!(count(&client.received(), "SyncConsole"), 0);
    assert_eq!(count(&server.received(), "ConsoleCommand"), 0);
    assert_eq!(server.system.stats().console_commands_replicated, 0);
}

#[test]
fn replicated_commands_apply_on_clients() {
    let (_hub, mut server, mut client) = session();

    server
        .system
        .execute_console_command("sv_serverSendRateMs 33")
        .unwrap();
    pump(&mut server, &mut [&mut client], 1);

    assert_eq!(
        client.system.console().cvar("sv_serverSendRateMs"),
        Some(CvarValue::Int(33))
    );
}

#[test]
fn clients_may_only_set_client_settable_cvars() {
    let (_hub, mut server, mut client) = session();

    client
        .system
        .execute_console_command("g_gravity -3")
        .unwrap();
    client
        .system
        .execute_console_command("sv_serverSendRateMs 10")
        .unwrap();
    pump(&mut server, &mut [&mut client], 2);

    let to_server = server.received();
    assert_eq!(count(&to_server, "ConsoleCommand"), 1);
    assert_eq!(
        server.system.console().cvar("g_gravity"),
        Some(CvarValue::Float(-3.0))
    );
    assert_eq!(
        server.system.console().cvar("sv_serverSendRateMs"),
        Some(CvarValue::Int(50))
    );
}

#[test]
fn paused_connections_receive_no_entity_updates() {
    let (_hub, mut server, mut client) = session();
    let id = player(&server);

    client.system.set_ready_for_entity_updates(false);
    pump(&mut server, &mut [&mut client], 1);
    client.received();

    for health in 0..5 {
        server
            .system
            .entities_mut()
            .set_property(id, NetComponentId(0), 0, PropertyValue::Int(health))
            .unwrap();
        pump(&mut server, &mut [&mut client], 1);
    }
    assert_eq!(count(&client.received(), "EntityUpdates"), 0);

    client.system.set_ready_for_entity_updates(true);
    pump(&mut server, &mut [&mut client], 2);
    assert!(count(&client.received(), "EntityUpdates") > 0);
    assert_eq!(
        client.system.entities().get(id).and_then(|e| e.property(NetComponentId(0), 0)),
        Some(&PropertyValue::Int(4))
    );
}

#[test]
fn send_rate_gates_the_host_frame() {
    let hub = LoopbackHub::new();
    let cfg = config();
    let mut server = Peer::new(&hub, console(&cfg));
    server.system.execute_console_command("host").unwrap();

    let tick = Duration::from_millis(16);
    for _ in 0..3 {
        server.system.on_tick(tick);
        assert_eq!(server.system.network_time().host_frame_id().get(), 0);
    }
    server.system.on_tick(tick);
    assert_eq!(server.system.network_time().host_frame_id().get(), 1);
    assert_eq!(server.system.network_time().host_time_ms(), 50);
}

#[test]
fn initialization_happens_once() {
    let hub = LoopbackHub::new();
    let cfg = config();
    let mut peer = Peer::new(&hub, console(&cfg));
    let events = peer.system.subscribe();

    assert!(peer.system.initialize_multiplayer(AgentType::DedicatedServer));
    assert!(!peer.system.initialize_multiplayer(AgentType::Client));
    assert!(!peer.system.initialize_multiplayer(AgentType::DedicatedServer));
    assert_eq!(peer.system.agent_type(), AgentType::DedicatedServer);

    let inits = events
        .try_iter()
        .filter(|event| matches!(event, SessionEvent::SessionInit { .. }))
        .count();
    assert_eq!(inits, 1);
    assert!(peer.system.execute_console_command("connect").is_err());
}

#[test]
fn player_entity_replicates_to_its_client() {
    let (_hub, server, client) = session();
    let id = player(&server);

    let server_entity = server.system.entities().get(id).unwrap();
    assert_eq!(server_entity.role, NetEntityRole::Authority);

    let replica = client.system.entities().get(id).unwrap();
    assert_eq!(replica.role, NetEntityRole::Autonomous);
    assert!(replica.is_active());
    assert!(client.system.network_time().host_frame_id().get() > 0);

    let stats = server.system.stats();
    assert_eq!(stats.client_connection_count, 1);
    assert_eq!(stats.server_connection_count, 0);
    assert!(stats.traffic.properties_sent.calls > 0);
}

#[test]
fn each_client_controls_only_its_own_player() {
    let (hub, mut server, mut first) = session();
    let cfg = config();
    let mut second = Peer::new(&hub, console(&cfg));
    second
        .system
        .execute_console_command(&format!("connect 127.0.0.1:{}", PORT))
        .unwrap();
    pump(&mut server, &mut [&mut first, &mut second], 4);

    assert_eq!(server.system.entities().entity_count(), 2);
    let autonomous = |peer: &Peer| {
        peer.system
            .entities()
            .entities()
            .filter(|entity| entity.role == NetEntityRole::Autonomous)
            .map(|entity| entity.id)
            .collect::<Vec<_>>()
    };
    let first_owned = autonomous(&first);
    let second_owned = autonomous(&second);
    assert_eq!(first_owned.len(), 1);
    assert_eq!(second_owned.len(), 1);
    assert_ne!(first_owned, second_owned);

    // Each client also sees the other player as a plain replica.
    assert_eq!(first.system.entities().entity_count(), 2);
    assert_eq!(
        first.system.entities().get(second_owned[0]).map(|e| e.role),
        Some(NetEntityRole::Client)
    );
}

#[test]
fn rpcs_route_between_authority_and_controller() {
    let (_hub, mut server, mut client) = session();
    let id = player(&server);

    server
        .system
        .entities_mut()
        .invoke_rpc(id, NetComponentId(0), RpcIndex(0), vec![PropertyValue::Bool(true)], None)
        .unwrap();
    client
        .system
        .entities_mut()
        .invoke_rpc(
            id,
            NetComponentId(0),
            RpcIndex(1),
            vec![PropertyValue::Vec3([1.0, 0.0, 0.0])],
            Some(ClientInputId(7)),
        )
        .unwrap();
    pump(&mut server, &mut [&mut client], 2);

    let flashes = client.system.entities_mut().get_mut(id).unwrap().take_rpcs();
    assert_eq!(flashes.len(), 1);
    assert_eq!(flashes[0].rpc, RpcIndex(0));
    assert_eq!(flashes[0].params, vec![PropertyValue::Bool(true)]);

    let moves = server.system.entities_mut().get_mut(id).unwrap().take_rpcs();
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].rpc, RpcIndex(1));
    assert_eq!(moves[0].input_id, Some(ClientInputId(7)));
    assert_eq!(server.system.connection_ids().len(), 1);
}

#[test]
fn disconnecting_despawns_the_player() {
    let (_hub, mut server, mut client) = session();
    let server_events = server.system.subscribe();
    let client_events = client.system.subscribe();

    client.system.execute_console_command("disconnect").unwrap();
    assert_eq!(client.system.agent_type(), AgentType::Uninitialized);
    assert_eq!(client.system.entities().entity_count(), 0);
    assert!(client_events.try_iter().any(|event| event == SessionEvent::SessionShutdown));

    pump(&mut server, &mut [&mut client], 1);
    assert_eq!(server.system.entities().entity_count(), 0);
    assert_eq!(server.system.agent_type(), AgentType::ClientServer);
    assert!(
        server_events
            .try_iter()
            .any(|event| matches!(event, SessionEvent::ConnectionLost { .. }))
    );
}

#[test]
fn kicked_clients_shut_their_session_down() {
    let (_hub, mut server, mut client) = session();
    let client_events = client.system.subscribe();

    let id = server.system.connection_ids()[0];
    server.system.kick(id);
    pump(&mut server, &mut [&mut client], 1);

    assert_eq!(client.system.agent_type(), AgentType::Uninitialized);
    let events: Vec<SessionEvent> = client_events.try_iter().collect();
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::ConnectionLost { reason: DisconnectReason::Kicked, .. }
    )));
    assert!(events.contains(&SessionEvent::SessionShutdown));
}

#[test]
fn unexpected_migration_drops_the_link() {
    let (_hub, mut server, mut client) = session();
    assert_eq!(client.system.connection_ids().len(), 1);

    // Send a migration notice straight through the server's transport.
    let id = server.system.connection_ids()[0];
    server
        .system
        .network_mut()
        .send_reliable(id, &Packet::ClientMigration {
            remote_server: HostId::INVALID,
            temporary_user_id: 1,
            last_client_input_id: ClientInputId(0),
        })
        .unwrap();
    client.system.on_tick(FRAME);
    assert_eq!(client.system.stats().protocol_errors, 1);

    // The dropped link surfaces on the next poll.
    client.system.on_tick(FRAME);
    assert_eq!(client.system.agent_type(), AgentType::Uninitialized);
}
