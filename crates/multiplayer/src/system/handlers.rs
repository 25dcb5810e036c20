use crate::console::ConsoleFlags;
use crate::ids::{ClientInputId, ConnectionId, HostFrameId, HostId, NetEntityId};
use crate::net::{
    ConnectionRole, EntityRpcMessage, EntityUpdateMessage, PROTOCOL_VERSION, Packet, PacketHeader,
};
use crate::session::SessionEvent;

use super::MultiplayerSystem;

// Every handler returns false only when the connection must be dropped.
impl MultiplayerSystem {
    fn role_of(&self, id: ConnectionId) -> Option<ConnectionRole> {
        self.connections.get(&id).map(|data| data.connection_role())
    }

    pub(super) fn handle_connect(&mut self, id: ConnectionId, protocol_version: u32) -> bool {
        if !self.agent_type.is_host() {
            log::warn!("Connect from {} but this peer is not hosting", id);
            return false;
        }
        if protocol_version != PROTOCOL_VERSION {
            log::warn!(
                "Connection {} speaks protocol {}, expected {}",
                id,
                protocol_version,
                PROTOCOL_VERSION
            );
            return false;
        }

        let map = self.cvar_string("sv_map", &self.config.map);
        log::info!("Accepting connection {} into {}", id, map);
        self.send_reliable(id, &Packet::Accept {
            host_id: HostId::INVALID,
            map,
        })
    }

    pub(super) fn handle_accept(&mut self, id: ConnectionId, host_id: HostId, map: String) -> bool {
        if self.role_of(id) != Some(ConnectionRole::Connector) {
            log::warn!("Accept arrived on connection {} which did not connect out", id);
            return false;
        }
        self.entities.set_host_id(host_id);

        for command in [format!("sv_map {}", map), format!("LoadLevel {}", map)] {
            if let Err(e) = self.console.perform_command(&command, ConsoleFlags::NONE) {
                log::warn!("'{}' failed: {}", command, e);
            }
        }
        self.events
            .emit(SessionEvent::LevelLoadRequested { map: map.clone() });
        log::info!("Accepted by connection {}, loading {}", id, map);

        self.send_reliable(id, &Packet::ReadyForEntityUpdates { ready: true })
    }

    pub(super) fn handle_ready_for_entity_updates(&mut self, id: ConnectionId, ready: bool) -> bool {
        match self.connections.get_mut(&id) {
            Some(data) => {
                log::debug!("Connection {} ready for entity updates: {}", id, ready);
                data.set_can_send_updates(ready);
                true
            }
            None => false,
        }
    }

    pub(super) fn handle_sync_console(&mut self, id: ConnectionId, commands: Vec<String>) -> bool {
        if commands.len() > self.config.sync_console_capacity {
            log::warn!(
                "SyncConsole from {} carries {} commands, limit is {}",
                id,
                commands.len(),
                self.config.sync_console_capacity
            );
            return false;
        }
        for command in commands {
            self.apply_remote_command(id, &command);
        }
        true
    }

    pub(super) fn handle_console_command(&mut self, id: ConnectionId, command: String) -> bool {
        self.apply_remote_command(id, &command);
        true
    }

    /// Commands coming from a client must be flagged `ALLOW_CLIENT_SET`.
    fn apply_remote_command(&mut self, id: ConnectionId, command: &str) {
        let from_client =
            self.agent_type.is_host() && self.role_of(id) == Some(ConnectionRole::Acceptor);
        let required = if from_client {
            ConsoleFlags::ALLOW_CLIENT_SET
        } else {
            ConsoleFlags::NONE
        };

        match self.console.perform_command(command, required) {
            Ok(flags) => {
                log::debug!("Applied '{}' from connection {}", command, id);
                if self.agent_type.is_host()
                    && !flags.contains(ConsoleFlags::DONT_REPLICATE)
                    && !self.is_cvar_query(command)
                {
                    self.console_queue.push(command);
                }
            }
            Err(e) => log::warn!("Rejected '{}' from connection {}: {}", command, id, e),
        }
    }

    pub(super) fn handle_entity_updates(
        &mut self,
        id: ConnectionId,
        header: &PacketHeader,
        host_frame_id: HostFrameId,
        host_time_ms: u64,
        updates: Vec<EntityUpdateMessage>,
    ) -> bool {
        if !self.agent_type.is_host() {
            self.time.alter_time(host_frame_id, host_time_ms, id);
        }
        let Some(data) = self.connections.get_mut(&id) else {
            return false;
        };
        let manager = data.replication_manager_mut();

        let mut handled = true;
        for update in updates {
            handled &= manager.handle_entity_update_message(&mut self.entities, header, update);
        }
        handled
    }

    pub(super) fn handle_entity_rpcs(&mut self, id: ConnectionId, rpcs: Vec<EntityRpcMessage>) -> bool {
        match self.connections.get_mut(&id) {
            Some(data) => data
                .replication_manager_mut()
                .handle_entity_rpc_messages(&mut self.entities, rpcs),
            None => false,
        }
    }

    pub(super) fn handle_entity_resets(&mut self, id: ConnectionId, entity_ids: Vec<NetEntityId>) -> bool {
        match self.connections.get_mut(&id) {
            Some(data) => data
                .replication_manager_mut()
                .handle_entity_reset_messages(entity_ids),
            None => false,
        }
    }

    /// Host migration is not supported; the link is dropped.
    pub(super) fn handle_client_migration(
        &mut self,
        id: ConnectionId,
        remote_server: HostId,
        temporary_user_id: u64,
        last_client_input_id: ClientInputId,
    ) -> bool {
        log::warn!(
            "Connection {} requested migration to host {} (user {}, input {})",
            id,
            remote_server,
            temporary_user_id,
            last_client_input_id
        );
        false
    }
}
