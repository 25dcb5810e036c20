use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use glam::Vec3;

use crate::config::MultiplayerConfig;
use crate::entity::{
    NetEntityRole, NetworkEntityManager, ReceivedRpc, Reliability, RpcDeliveryType,
};
use crate::ids::{ClientInputId, ConnectionId, HostFrameId, NetEntityId, PacketId};
use crate::net::{EntityRpcMessage, EntityUpdateMessage, Networking, Packet, PacketHeader};
use crate::stats::ReplicationTraffic;

use super::orphaned::OrphanedEntityRpcs;
use super::replicator::EntityReplicator;
use super::window::ReplicationWindow;

/// Unacknowledged update packets older than this many resend timeouts are forgotten.
const IN_FLIGHT_HORIZON: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    LocalServerToRemoteClient,
    LocalClientToRemoteServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateValidation {
    Handle,
    Drop,
    DropAndDisconnect,
}

#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    pub max_entity_updates_per_packet: usize,
    pub max_rpcs_per_packet: usize,
    pub max_payload_size: usize,
    pub max_remote_entities_pending_creation: usize,
    pub resend_timeout: Duration,
    pub orphaned_rpc_timeout: Duration,
}

impl ReplicationSettings {
    pub fn from_config(config: &MultiplayerConfig) -> Self {
        Self {
            max_entity_updates_per_packet: config.max_entity_updates_per_packet.max(1),
            max_rpcs_per_packet: config.max_rpcs_per_packet.max(1),
            max_payload_size: config.max_payload_size,
            max_remote_entities_pending_creation: config.max_remote_entities_pending_creation,
            resend_timeout: Duration::from_millis(config.resend_timeout_ms),
            orphaned_rpc_timeout: Duration::from_millis(config.orphaned_rpc_timeout_ms),
        }
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self::from_config(&MultiplayerConfig::default())
    }
}

pub struct UpdateContext<'a> {
    pub entities: &'a mut NetworkEntityManager,
    pub network: &'a mut dyn Networking,
    pub host_frame_id: HostFrameId,
    pub host_time_ms: u64,
}

#[derive(Debug, Clone, Copy)]
enum OutboundUpdate {
    State(NetEntityId),
    Delete(NetEntityId),
}

impl OutboundUpdate {
    fn entity_id(self) -> NetEntityId {
        match self {
            OutboundUpdate::State(id) | OutboundUpdate::Delete(id) => id,
        }
    }
}

/// Delta replication for the entities shared with a single remote peer.
pub struct EntityReplicationManager {
    connection: ConnectionId,
    mode: ReplicationMode,
    window: Box<dyn ReplicationWindow>,
    replicators: BTreeMap<NetEntityId, EntityReplicator>,
    settings: ReplicationSettings,
    activation_time_slice: Duration,
    pending_activation: VecDeque<NetEntityId>,
    deferred_reliable_rpcs: VecDeque<EntityRpcMessage>,
    deferred_unreliable_rpcs: VecDeque<EntityRpcMessage>,
    pending_resets: BTreeSet<NetEntityId>,
    orphaned: OrphanedEntityRpcs,
    in_flight: HashMap<PacketId, (Instant, Vec<NetEntityId>)>,
    traffic: ReplicationTraffic,
    latest_client_input_id: Option<ClientInputId>,
}

impl EntityReplicationManager {
    pub fn new(
        connection: ConnectionId,
        mode: ReplicationMode,
        window: Box<dyn ReplicationWindow>,
        settings: ReplicationSettings,
    ) -> Self {
        Self {
            connection,
            mode,
            window,
            replicators: BTreeMap::new(),
            orphaned: OrphanedEntityRpcs::new(settings.orphaned_rpc_timeout),
            settings,
            activation_time_slice: Duration::ZERO,
            pending_activation: VecDeque::new(),
            deferred_reliable_rpcs: VecDeque::new(),
            deferred_unreliable_rpcs: VecDeque::new(),
            pending_resets: BTreeSet::new(),
            in_flight: HashMap::new(),
            traffic: ReplicationTraffic::default(),
            latest_client_input_id: None,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    pub fn window(&self) -> &dyn ReplicationWindow {
        self.window.as_ref()
    }

    /// Zero activates every received entity on the tick it arrives.
    pub fn set_entity_activation_time_slice_ms(&mut self, ms: u64) {
        self.activation_time_slice = Duration::from_millis(ms);
    }

    pub fn entity_activation_time_slice(&self) -> Duration {
        self.activation_time_slice
    }

    pub fn replicates(&self, id: NetEntityId) -> Option<NetEntityRole> {
        self.replicators
            .get(&id)
            .filter(|replicator| !replicator.is_marked_for_removal())
            .map(EntityReplicator::remote_role)
    }

    pub fn replicated_entities(&self) -> impl Iterator<Item = (NetEntityId, NetEntityRole)> + '_ {
        self.replicators
            .values()
            .filter(|replicator| !replicator.is_marked_for_removal())
            .map(|replicator| (replicator.entity_id(), replicator.remote_role()))
    }

    pub fn replicator_count(&self) -> usize {
        self.replicators.len()
    }

    pub fn pending_activation_count(&self) -> usize {
        self.pending_activation.len()
    }

    pub fn orphaned_rpc_count(&self) -> usize {
        self.orphaned.len()
    }

    pub fn latest_client_input_id(&self) -> Option<ClientInputId> {
        self.latest_client_input_id
    }

    pub fn traffic(&self) -> ReplicationTraffic {
        self.traffic
    }

    pub fn add_deferred_rpc(&mut self, message: EntityRpcMessage, reliability: Reliability) {
        match reliability {
            Reliability::Reliable => self.deferred_reliable_rpcs.push_back(message),
            Reliability::Unreliable => self.deferred_unreliable_rpcs.push_back(message),
        }
    }

    pub fn update(&mut self, ctx: &mut UpdateContext<'_>) {
        self.receive_pass(ctx);
        self.send_pass(ctx);
    }

    /// Housekeeping for what the remote sent us: activation, orphan expiry
    /// and reset requests. Runs even while sending is paused.
    pub fn receive_pass(&mut self, ctx: &mut UpdateContext<'_>) {
        let now = Instant::now();
        let deadline =
            (!self.activation_time_slice.is_zero()).then(|| now + self.activation_time_slice);
        self.activate_pending_entities(ctx.entities, deadline);
        self.orphaned.expire(now);
        self.prune(ctx.entities, now);
        self.send_entity_resets(ctx.network);
    }

    pub fn send_pass(&mut self, ctx: &mut UpdateContext<'_>) {
        self.update_window(ctx.entities);
        self.send_entity_updates(ctx, Instant::now());
        self.send_entity_rpcs(ctx.network);
    }

    /// At least one entity activates per call; the rest wait for the next
    /// pass once `deadline` has passed.
    fn activate_pending_entities(
        &mut self,
        entities: &mut NetworkEntityManager,
        deadline: Option<Instant>,
    ) {
        while let Some(id) = self.pending_activation.pop_front() {
            let removed = self
                .replicators
                .get(&id)
                .is_none_or(EntityReplicator::is_marked_for_removal);
            if removed || !entities.activate(id) {
                continue;
            }
            log::trace!("Activated entity {} from connection {}", id, self.connection);
            self.dispatch_orphaned_rpcs(entities, id);

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
        }
    }

    /// Folds the window's current set into the replicators: new entries get a
    /// replicator, role changes reset it, dropped entries start removal.
    fn update_window(&mut self, entities: &NetworkEntityManager) {
        self.window.update_window(entities);
        if !self.window.replication_set_update_ready() {
            return;
        }

        let set = self.window.replication_set();
        for (&id, &role) in set {
            match self.replicators.get_mut(&id) {
                Some(replicator) => {
                    replicator.clear_pending_removal();
                    if replicator.remote_role() != role {
                        replicator.reset(role);
                    }
                }
                None => {
                    if let Some(entity) = entities.get(id) {
                        self.replicators
                            .insert(id, EntityReplicator::publisher(entity, role));
                    }
                }
            }
        }

        for (id, replicator) in self.replicators.iter_mut() {
            if replicator.owns_lifetime() && !set.contains_key(id) {
                replicator.mark_for_removal();
            }
        }
    }

    fn generate_entity_update_list(
        &mut self,
        entities: &NetworkEntityManager,
        now: Instant,
    ) -> Vec<OutboundUpdate> {
        let resend = self.settings.resend_timeout;
        let max_pending = self.settings.max_remote_entities_pending_creation;
        let mut pending_creation = self
            .replicators
            .values()
            .filter(|replicator| replicator.owns_lifetime() && replicator.is_awaiting_creation())
            .count();

        let mut autonomous = Vec::new();
        let mut proxies = Vec::new();
        let mut deletes = Vec::new();
        let mut finished = Vec::new();

        for (&id, replicator) in &self.replicators {
            if !replicator.owns_lifetime() {
                continue;
            }
            if replicator.is_marked_for_removal() {
                if replicator.is_delete_acked() {
                    finished.push(id);
                } else if replicator.requires_delete(now, resend) {
                    deletes.push(OutboundUpdate::Delete(id));
                }
                continue;
            }

            let Some(entity) = entities.get(id) else {
                continue;
            };
            if !replicator.requires_serialization(entity, now, resend) {
                continue;
            }
            if !replicator.is_remote_replicator_established() && !replicator.is_awaiting_creation() {
                if pending_creation >= max_pending {
                    continue;
                }
                pending_creation += 1;
            }

            if replicator.remote_role() == NetEntityRole::Autonomous {
                autonomous.push(OutboundUpdate::State(id));
            } else {
                proxies.push(OutboundUpdate::State(id));
            }
        }

        for id in finished {
            self.replicators.remove(&id);
            log::trace!("Entity {} left connection {}", id, self.connection);
        }

        proxies.truncate(self.window.max_proxy_entity_send_count());
        autonomous.extend(proxies);
        autonomous.extend(deletes);
        autonomous
    }

    fn send_entity_updates(&mut self, ctx: &mut UpdateContext<'_>, now: Instant) {
        let list = self.generate_entity_update_list(ctx.entities, now);
        if list.is_empty() {
            return;
        }

        let mut batch = Vec::new();
        let mut messages = Vec::new();
        let mut size = 0;
        for update in list {
            let Some(replicator) = self.replicators.get_mut(&update.entity_id()) else {
                continue;
            };
            let message = match update {
                OutboundUpdate::State(id) => match ctx.entities.get(id) {
                    Some(entity) => replicator.generate_update(entity),
                    None => continue,
                },
                OutboundUpdate::Delete(_) => replicator.generate_delete(),
            };

            let message_size = message.estimated_size();
            let full = messages.len() >= self.settings.max_entity_updates_per_packet
                || size + message_size > self.settings.max_payload_size;
            if full && !messages.is_empty() {
                self.flush_entity_updates(ctx, &mut batch, std::mem::take(&mut messages), size, now);
                size = 0;
            }
            if messages.is_empty() && message_size > self.settings.max_payload_size {
                log::warn!(
                    "Serializing extremely large entity {} ({} bytes), sending it alone",
                    update.entity_id(),
                    message_size
                );
            }

            size += message_size;
            messages.push(message);
            batch.push(update);
        }

        if !messages.is_empty() {
            self.flush_entity_updates(ctx, &mut batch, messages, size, now);
        }
    }

    fn flush_entity_updates(
        &mut self,
        ctx: &mut UpdateContext<'_>,
        batch: &mut Vec<OutboundUpdate>,
        updates: Vec<EntityUpdateMessage>,
        size: usize,
        now: Instant,
    ) {
        let count = updates.len();
        let packet = Packet::EntityUpdates {
            host_frame_id: ctx.host_frame_id,
            host_time_ms: ctx.host_time_ms,
            updates,
        };

        let packet_id = match ctx.network.send_unreliable(self.connection, &packet) {
            Ok(packet_id) => packet_id,
            Err(e) => {
                log::warn!("Failed to send entity updates to {}: {}", self.connection, e);
                batch.clear();
                return;
            }
        };
        log::trace!(
            "Sent {} entity updates ({} bytes) to {} as packet {}",
            count,
            size,
            self.connection,
            packet_id
        );

        let mut ids = Vec::with_capacity(batch.len());
        for update in batch.drain(..) {
            let id = update.entity_id();
            if let Some(replicator) = self.replicators.get_mut(&id) {
                match update {
                    OutboundUpdate::State(_) => replicator.finalize_serialization(packet_id, now),
                    OutboundUpdate::Delete(_) => replicator.finalize_delete(packet_id, now),
                }
                ids.push(id);
            }
        }
        self.in_flight.insert(packet_id, (now, ids));
        self.traffic.properties_sent.record(size);
    }

    fn send_entity_rpcs(&mut self, network: &mut dyn Networking) {
        let reliable = std::mem::take(&mut self.deferred_reliable_rpcs);
        self.send_rpc_batches(network, reliable, Reliability::Reliable);
        let unreliable = std::mem::take(&mut self.deferred_unreliable_rpcs);
        self.send_rpc_batches(network, unreliable, Reliability::Unreliable);
    }

    fn send_rpc_batches(
        &mut self,
        network: &mut dyn Networking,
        rpcs: VecDeque<EntityRpcMessage>,
        reliability: Reliability,
    ) {
        let mut batch = Vec::new();
        let mut size = 0;
        for rpc in rpcs {
            let rpc_size = rpc.estimated_size();
            let full = batch.len() >= self.settings.max_rpcs_per_packet
                || size + rpc_size > self.settings.max_payload_size;
            if full && !batch.is_empty() {
                self.flush_rpcs(network, std::mem::take(&mut batch), size, reliability);
                size = 0;
            }
            if batch.is_empty() && rpc_size > self.settings.max_payload_size {
                log::warn!(
                    "Serializing extremely large rpc {} for entity {} ({} bytes), sending it alone",
                    rpc.rpc,
                    rpc.entity_id,
                    rpc_size
                );
            }
            size += rpc_size;
            batch.push(rpc);
        }
        if !batch.is_empty() {
            self.flush_rpcs(network, batch, size, reliability);
        }
    }

    fn flush_rpcs(
        &mut self,
        network: &mut dyn Networking,
        rpcs: Vec<EntityRpcMessage>,
        size: usize,
        reliability: Reliability,
    ) {
        let packet = Packet::EntityRpcs { rpcs };
        let result = match reliability {
            Reliability::Reliable => network.send_reliable(self.connection, &packet),
            Reliability::Unreliable => network.send_unreliable(self.connection, &packet),
        };
        match result {
            Ok(_) => self.traffic.rpcs_sent.record(size),
            Err(e) => log::warn!("Failed to send rpcs to {}: {}", self.connection, e),
        }
    }

    fn send_entity_resets(&mut self, network: &mut dyn Networking) {
        if self.pending_resets.is_empty() {
            return;
        }
        let entity_ids: Vec<NetEntityId> = std::mem::take(&mut self.pending_resets)
            .into_iter()
            .collect();
        log::debug!(
            "Requesting reset of {} entities from {}",
            entity_ids.len(),
            self.connection
        );
        if let Err(e) = network.send_reliable(self.connection, &Packet::EntityResets { entity_ids }) {
            log::warn!("Failed to send entity resets to {}: {}", self.connection, e);
        }
    }

    fn prune(&mut self, entities: &NetworkEntityManager, now: Instant) {
        let horizon = self.settings.resend_timeout * IN_FLIGHT_HORIZON;
        self.in_flight
            .retain(|_, (sent, _)| now.duration_since(*sent) < horizon);

        // Removed remote entities keep their replicator a while so that
        // reordered updates cannot resurrect them.
        let linger = self.settings.orphaned_rpc_timeout;
        self.replicators.retain(|id, replicator| {
            replicator.owns_lifetime()
                || entities.contains(*id)
                || replicator
                    .marked_since()
                    .is_none_or(|since| now.duration_since(since) < linger)
        });
    }

    pub fn on_packet_acked(&mut self, packet_id: PacketId) {
        let Some((_, ids)) = self.in_flight.remove(&packet_id) else {
            return;
        };
        for id in ids {
            if let Some(replicator) = self.replicators.get_mut(&id) {
                replicator.on_packet_acked(packet_id);
            }
        }
    }

    fn validate_update(&self, message: &EntityUpdateMessage, packet_id: PacketId) -> UpdateValidation {
        let replicator = self.replicators.get(&message.entity_id);

        if self.mode == ReplicationMode::LocalServerToRemoteClient {
            // A client may only drive the entity it controls.
            let Some(replicator) = replicator else {
                return UpdateValidation::DropAndDisconnect;
            };
            let controlled = !message.is_delete
                && message.network_role == NetEntityRole::Authority
                && replicator.remote_role() == NetEntityRole::Autonomous
                && replicator.bound_local_role() == NetEntityRole::Authority;
            if !controlled {
                return UpdateValidation::DropAndDisconnect;
            }
            if replicator.is_marked_for_removal() {
                return UpdateValidation::Drop;
            }
        }

        match replicator {
            Some(replicator) if !replicator.is_packet_id_valid(packet_id) => UpdateValidation::Drop,
            _ => UpdateValidation::Handle,
        }
    }

    /// Applies one inbound update. Returns false only for messages that must
    /// end the connection.
    pub fn handle_entity_update_message(
        &mut self,
        entities: &mut NetworkEntityManager,
        header: &PacketHeader,
        message: EntityUpdateMessage,
    ) -> bool {
        let packet_id = header.packet_id();
        match self.validate_update(&message, packet_id) {
            UpdateValidation::Handle => {}
            UpdateValidation::Drop => {
                log::debug!(
                    "Dropping stale update for entity {} in packet {}",
                    message.entity_id,
                    packet_id
                );
                return true;
            }
            UpdateValidation::DropAndDisconnect => {
                log::warn!(
                    "Connection {} sent an update for entity {} it does not control",
                    self.connection,
                    message.entity_id
                );
                return false;
            }
        }

        if message.is_delete {
            self.handle_entity_delete_message(entities, packet_id, &message)
        } else {
            self.handle_property_change_message(entities, packet_id, message)
        }
    }

    fn handle_entity_delete_message(
        &mut self,
        entities: &mut NetworkEntityManager,
        packet_id: PacketId,
        message: &EntityUpdateMessage,
    ) -> bool {
        let id = message.entity_id;
        let Some(replicator) = self.replicators.get_mut(&id) else {
            // Never created here, nothing to remove.
            return true;
        };
        if replicator.is_marked_for_removal() {
            log::warn!("Entity {} is already being removed", id);
            return true;
        }
        if replicator.owns_lifetime() {
            log::warn!(
                "Connection {} tried to delete entity {} owned by this host",
                self.connection,
                id
            );
            return false;
        }

        replicator.record_received(packet_id);
        replicator.mark_for_removal();
        entities.mark_for_removal(id);
        self.pending_activation.retain(|pending| *pending != id);
        log::debug!("Entity {} deleted by connection {}", id, self.connection);
        true
    }

    fn handle_property_change_message(
        &mut self,
        entities: &mut NetworkEntityManager,
        packet_id: PacketId,
        message: EntityUpdateMessage,
    ) -> bool {
        let id = message.entity_id;
        let role = message.network_role;
        let size = message.estimated_size();
        let prefab = message
            .prefab
            .clone()
            .or_else(|| self.replicators.get(&id).and_then(|r| r.prefab().cloned()));

        let mut created = false;
        if !entities.contains(id) {
            let Some(prefab) = prefab.as_ref() else {
                log::debug!("Entity {} arrived without a prefab, requesting reset", id);
                self.pending_resets.insert(id);
                return true;
            };
            if let Err(e) = entities.create_replica(prefab, id, role) {
                log::warn!("Dropping update for entity {}: {}", id, e);
                return true;
            }
            created = true;
        }

        let Some(entity) = entities.get_mut(id) else {
            return true;
        };
        entity.owning_connection = Some(self.connection);
        if entity.role != role {
            log::debug!(
                "Entity {} changed role from {} to {}",
                id,
                entity.role.as_str(),
                role.as_str()
            );
            entity.role = role;
        }
        let entity_prefab = entity.prefab.clone();

        let needs_replicator = self.replicators.get(&id).is_none_or(|replicator| {
            replicator.is_marked_for_removal() || replicator.bound_local_role() != role
        });
        if needs_replicator {
            let prefab = prefab.unwrap_or(entity_prefab);
            self.replicators
                .insert(id, EntityReplicator::subscriber(id, role, prefab));
            entities.clear_from_removal_list(id);
            if !created && !self.pending_activation.contains(&id) {
                entities.activate(id);
            }
        }

        if let Some(replicator) = self.replicators.get_mut(&id) {
            replicator.record_received(packet_id);
        }

        let Some(entity) = entities.get_mut(id) else {
            return true;
        };
        if let Some(transform) = message.transform {
            entity.transform = Vec3::from_array(transform);
        }
        for delta in message.properties {
            let applied = entity
                .component_mut(delta.component)
                .is_some_and(|component| component.set_property(delta.property.0 as usize, delta.value));
            if !applied {
                log::warn!(
                    "Dropping property {} of component {} on entity {}",
                    delta.property,
                    delta.component,
                    id
                );
            }
        }
        self.traffic.properties_received.record(size);

        if created {
            self.pending_activation.push_back(id);
        } else if needs_replicator && entity.is_active() {
            self.dispatch_orphaned_rpcs(entities, id);
        }
        true
    }

    pub fn handle_entity_rpc_messages(
        &mut self,
        entities: &mut NetworkEntityManager,
        messages: Vec<EntityRpcMessage>,
    ) -> bool {
        for message in messages {
            self.traffic.rpcs_received.record(message.estimated_size());
            self.handle_entity_rpc_message(entities, message);
        }
        true
    }

    fn handle_entity_rpc_message(
        &mut self,
        entities: &mut NetworkEntityManager,
        message: EntityRpcMessage,
    ) {
        let id = message.entity_id;
        let active = entities.get(id).is_some_and(|entity| entity.is_active());
        let replicated = self
            .replicators
            .get(&id)
            .is_some_and(|replicator| !replicator.is_marked_for_removal());

        if !active || !replicated {
            if self.mode == ReplicationMode::LocalClientToRemoteServer {
                self.orphaned.add(message);
            } else {
                log::warn!(
                    "Dropping rpc {} from {} for entity {} it does not see",
                    message.rpc,
                    self.connection,
                    id
                );
            }
            return;
        }

        let Some(entity) = entities.get_mut(id) else {
            return;
        };
        let Some(descriptor) = entity
            .component(message.component)
            .and_then(|component| component.rpc(message.rpc.0 as usize))
        else {
            log::warn!(
                "Dropping unknown rpc {} of component {} on entity {}",
                message.rpc,
                message.component,
                id
            );
            return;
        };
        let delivery = descriptor.delivery;

        if !delivery.can_handle(entity.role) {
            log::warn!(
                "Ignoring rpc {} on entity {}: a {} copy cannot receive {:?}",
                message.rpc,
                id,
                entity.role.as_str(),
                delivery
            );
            return;
        }

        if delivery == RpcDeliveryType::AutonomousToAuthority {
            let controlled = self.replicates(id) == Some(NetEntityRole::Autonomous)
                && entity.owning_connection == Some(self.connection);
            if !controlled {
                log::warn!(
                    "Connection {} invoked rpc {} on entity {} it does not control",
                    self.connection,
                    message.rpc,
                    id
                );
                return;
            }
            if let Some(input_id) = message.input_id {
                if self.latest_client_input_id.is_none_or(|latest| input_id > latest) {
                    self.latest_client_input_id = Some(input_id);
                }
            }
        }

        entity.push_rpc(ReceivedRpc {
            component: message.component,
            rpc: message.rpc,
            params: message.params,
            input_id: message.input_id,
            from: Some(self.connection),
        });
    }

    fn dispatch_orphaned_rpcs(&mut self, entities: &mut NetworkEntityManager, id: NetEntityId) {
        for message in self.orphaned.take(id) {
            self.handle_entity_rpc_message(entities, message);
        }
    }

    /// The remote lost track of these entities; their next update carries
    /// the prefab and full state again.
    pub fn handle_entity_reset_messages(&mut self, entity_ids: Vec<NetEntityId>) -> bool {
        for id in entity_ids {
            match self.replicators.get_mut(&id) {
                Some(replicator) if replicator.owns_lifetime() => {
                    let role = replicator.remote_role();
                    replicator.reset(role);
                }
                _ => log::debug!("Ignoring reset for entity {} not sent to {}", id, self.connection),
            }
        }
        true
    }

    pub fn clear(&mut self, entities: &mut NetworkEntityManager) {
        for (id, replicator) in std::mem::take(&mut self.replicators) {
            if !replicator.owns_lifetime() {
                entities.mark_for_removal(id);
            }
        }
        self.pending_activation.clear();
        self.deferred_reliable_rpcs.clear();
        self.deferred_unreliable_rpcs.clear();
        self.pending_resets.clear();
        self.orphaned.clear();
        self.in_flight.clear();
    }
}
