use crate::ids::{ConnectionId, NetEntityId};
use crate::net::ConnectionRole;
use crate::replication::{
    EntityReplicationManager, NullReplicationWindow, ReplicationMode, ReplicationSettings,
    ReplicationWindow, ServerToClientReplicationWindow, UpdateContext,
};

/// Session state of a link to the server.
pub struct ClientToServerConnectionData {
    replication: EntityReplicationManager,
    can_send_updates: bool,
}

impl ClientToServerConnectionData {
    pub fn new(
        connection: ConnectionId,
        settings: ReplicationSettings,
        activation_time_slice_ms: u64,
    ) -> Self {
        let mut replication = EntityReplicationManager::new(
            connection,
            ReplicationMode::LocalClientToRemoteServer,
            Box::new(NullReplicationWindow::default()),
            settings,
        );
        replication.set_entity_activation_time_slice_ms(activation_time_slice_ms);
        Self {
            replication,
            can_send_updates: true,
        }
    }
}

/// Session state of a link to a client, scoped to the entity it controls.
pub struct ServerToClientConnectionData {
    replication: EntityReplicationManager,
    controlled_entity: Option<NetEntityId>,
    can_send_updates: bool,
}

impl ServerToClientConnectionData {
    pub fn new(
        connection: ConnectionId,
        window: ServerToClientReplicationWindow,
        settings: ReplicationSettings,
    ) -> Self {
        let controlled_entity = window.controlled_entity();
        Self {
            replication: EntityReplicationManager::new(
                connection,
                ReplicationMode::LocalServerToRemoteClient,
                Box::new(window),
                settings,
            ),
            controlled_entity,
            // The client opens the gate once its level is loaded.
            can_send_updates: false,
        }
    }
}

pub enum ConnectionData {
    ClientToServer(ClientToServerConnectionData),
    ServerToClient(ServerToClientConnectionData),
}

impl ConnectionData {
    pub fn connection_role(&self) -> ConnectionRole {
        match self {
            ConnectionData::ClientToServer(_) => ConnectionRole::Connector,
            ConnectionData::ServerToClient(_) => ConnectionRole::Acceptor,
        }
    }

    pub fn replication_manager(&self) -> &EntityReplicationManager {
        match self {
            ConnectionData::ClientToServer(data) => &data.replication,
            ConnectionData::ServerToClient(data) => &data.replication,
        }
    }

    pub fn replication_manager_mut(&mut self) -> &mut EntityReplicationManager {
        match self {
            ConnectionData::ClientToServer(data) => &mut data.replication,
            ConnectionData::ServerToClient(data) => &mut data.replication,
        }
    }

    /// Entity spawned for the remote player, on server-side links.
    pub fn controlled_entity(&self) -> Option<NetEntityId> {
        match self {
            ConnectionData::ClientToServer(_) => None,
            ConnectionData::ServerToClient(data) => data.controlled_entity,
        }
    }

    pub fn can_send_updates(&self) -> bool {
        match self {
            ConnectionData::ClientToServer(data) => data.can_send_updates,
            ConnectionData::ServerToClient(data) => data.can_send_updates,
        }
    }

    pub fn set_can_send_updates(&mut self, can_send: bool) {
        match self {
            ConnectionData::ClientToServer(data) => data.can_send_updates = can_send,
            ConnectionData::ServerToClient(data) => data.can_send_updates = can_send,
        }
    }

    /// Received entities keep activating while the remote has paused us;
    /// only the send half waits for the gate.
    pub fn update(&mut self, ctx: &mut UpdateContext<'_>) {
        let can_send = self.can_send_updates();
        let replication = self.replication_manager_mut();
        replication.receive_pass(ctx);
        if can_send {
            replication.send_pass(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{
        ComponentDescriptor, NetEntityRole, NetworkEntityManager, PrefabDescriptor, PrefabEntityId,
        PropertyValue, Reliability,
    };
    use crate::ids::{HostFrameId, NetComponentId, RpcIndex};
    use crate::net::{
        EntityRpcMessage, EntityUpdateMessage, LoopbackHub, LoopbackNetworking, Networking, Packet,
        PacketHeader, TransportEvent,
    };
    use crate::replication::AllEntitiesRelevance;

    fn rpc_packets(network: &mut LoopbackNetworking) -> usize {
        network
            .poll()
            .into_iter()
            .filter(|event| {
                matches!(
                    event,
                    TransportEvent::Packet {
                        packet: Packet::EntityRpcs { .. },
                        ..
                    }
                )
            })
            .count()
    }

    fn tick(
        data: &mut ConnectionData,
        entities: &mut NetworkEntityManager,
        network: &mut LoopbackNetworking,
    ) {
        data.update(&mut UpdateContext {
            entities,
            network,
            host_frame_id: HostFrameId(0),
            host_time_ms: 0,
        });
    }

    #[test]
    fn server_links_start_gated() {
        let window = ServerToClientReplicationWindow::new(
            Some(NetEntityId(4)),
            ConnectionId(1),
            Box::new(AllEntitiesRelevance),
        );
        let mut data = ConnectionData::ServerToClient(ServerToClientConnectionData::new(
            ConnectionId(1),
            window,
            ReplicationSettings::default(),
        ));
        assert!(!data.can_send_updates());
        assert_eq!(data.controlled_entity(), Some(NetEntityId(4)));
        assert_eq!(data.connection_role(), ConnectionRole::Acceptor);

        data.set_can_send_updates(true);
        assert!(data.can_send_updates());
    }

    #[test]
    fn client_links_carry_the_activation_slice() {
        let data = ConnectionData::ClientToServer(ClientToServerConnectionData::new(
            ConnectionId(2),
            ReplicationSettings::default(),
            5,
        ));
        assert!(data.can_send_updates());
        assert_eq!(
            data.replication_manager().entity_activation_time_slice(),
            std::time::Duration::from_millis(5)
        );
        assert_eq!(data.controlled_entity(), None);
    }

    #[test]
    fn paused_client_links_activate_but_do_not_send() {
        let hub = LoopbackHub::new();
        let mut server_net = hub.endpoint();
        let mut client_net = hub.endpoint();
        server_net.listen(4100).unwrap();
        let to_server = client_net.connect("127.0.0.1:4100".parse().unwrap()).unwrap();
        server_net.poll();

        let mut entities = NetworkEntityManager::new();
        entities.register_prefab(
            "thing",
            PrefabDescriptor::single(vec![
                ComponentDescriptor::new("Health").with_property(PropertyValue::Int(100)),
            ]),
        );

        let mut data = ConnectionData::ClientToServer(ClientToServerConnectionData::new(
            to_server,
            ReplicationSettings::default(),
            0,
        ));
        data.set_can_send_updates(false);

        let id = NetEntityId(5);
        let update = EntityUpdateMessage {
            entity_id: id,
            network_role: NetEntityRole::Client,
            is_delete: false,
            prefab: Some(PrefabEntityId::new("thing", 0)),
            transform: Some([0.0; 3]),
            properties: Vec::new(),
        };
        assert!(data.replication_manager_mut().handle_entity_update_message(
            &mut entities,
            &PacketHeader::new(1, 0, 0),
            update
        ));
        data.replication_manager_mut().add_deferred_rpc(
            EntityRpcMessage::new(id, NetComponentId(0), RpcIndex(0)),
            Reliability::Reliable,
        );

        tick(&mut data, &mut entities, &mut client_net);
        assert!(entities.get(id).unwrap().is_active());
        assert_eq!(rpc_packets(&mut server_net), 0);

        data.set_can_send_updates(true);
        tick(&mut data, &mut entities, &mut client_net);
        assert_eq!(rpc_packets(&mut server_net), 1);
    }
}
