use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use multiplayer::entity::{ComponentDescriptor, PropertyValue};
use multiplayer::{
    AgentType, CvarRegistry, MultiplayerConfig, MultiplayerSystem, NetEntityRole,
    PrefabDescriptor, UdpNetworking, UdpSettings,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

fn system(config: MultiplayerConfig) -> MultiplayerSystem {
    let network = UdpNetworking::new(UdpSettings::from_config(&config));
    let console = CvarRegistry::from_config(&config);
    let mut system = MultiplayerSystem::new(config, Box::new(network), Box::new(console));
    system.register_prefab(
        "prefabs/player.network.spawnable",
        PrefabDescriptor::single(vec![
            ComponentDescriptor::new("Health").with_property(PropertyValue::Int(100)),
        ]),
    );
    system
}

fn wait_for(
    server: &mut MultiplayerSystem,
    client: &mut MultiplayerSystem,
    timeout_ms: u64,
    done: impl Fn(&MultiplayerSystem, &MultiplayerSystem) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        server.on_tick(Duration::from_millis(5));
        client.on_tick(Duration::from_millis(5));
        if done(server, client) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_udp_session_replicates_player() {
    let port = next_port();
    let config = MultiplayerConfig {
        port,
        server_port: port,
        server_send_rate_ms: 10,
        ..MultiplayerConfig::default()
    };

    let mut server = system(config.clone());
    let mut client = system(config);

    server.host().unwrap();
    assert_eq!(server.agent_type(), AgentType::ClientServer);
    client.connect(Some(&format!("127.0.0.1:{}", port))).unwrap();

    let replicated = wait_for(&mut server, &mut client, 2000, |_, client| {
        client
            .entities()
            .entities()
            .any(|entity| entity.role == NetEntityRole::Autonomous && entity.is_active())
    });
    assert!(replicated, "player never reached the client");
    assert_eq!(server.stats().client_connection_count, 1);
    assert_eq!(client.stats().server_connection_count, 1);

    client.disconnect();
    let despawned = wait_for(&mut server, &mut client, 2000, |server, _| {
        server.entities().entity_count() == 0
    });
    assert!(despawned, "server kept the player after the client left");
    assert_eq!(client.agent_type(), AgentType::Uninitialized);
}

#[test]
fn test_hosting_twice_is_rejected() {
    let port = next_port();
    let config = MultiplayerConfig {
        port,
        ..MultiplayerConfig::default()
    };
    let mut server = system(config);

    server.host().unwrap();
    assert!(server.host().is_err());
    assert!(server.connect(None).is_err());
}
