use std::time::{Duration, Instant};

use crate::entity::{NetEntityRole, NetworkEntity, PrefabEntityId, PropertyValue};
use crate::ids::{NetComponentId, NetEntityId, PacketId, PropertyIndex};
use crate::net::{EntityUpdateMessage, PropertyDelta};

#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub transform: [f32; 3],
    pub components: Vec<Vec<PropertyValue>>,
}

impl EntitySnapshot {
    pub fn capture(entity: &NetworkEntity) -> Self {
        Self {
            transform: entity.transform.to_array(),
            components: entity
                .components()
                .iter()
                .map(|component| component.properties().to_vec())
                .collect(),
        }
    }

    fn diff(&self, base: Option<&EntitySnapshot>) -> (Option<[f32; 3]>, Vec<PropertyDelta>) {
        let transform = match base {
            Some(base) if base.transform == self.transform => None,
            _ => Some(self.transform),
        };

        let mut deltas = Vec::new();
        for (component, properties) in self.components.iter().enumerate() {
            for (property, value) in properties.iter().enumerate() {
                let previous = base
                    .and_then(|b| b.components.get(component))
                    .and_then(|props| props.get(property));
                if previous != Some(value) {
                    deltas.push(PropertyDelta {
                        component: NetComponentId(component as u16),
                        property: PropertyIndex(property as u16),
                        value: value.clone(),
                    });
                }
            }
        }
        (transform, deltas)
    }
}

/// Per-entity replication state for one connection. The publishing side
/// tracks what the remote has acknowledged; the subscribing side tracks the
/// newest packet it applied.
#[derive(Debug)]
pub struct EntityReplicator {
    entity_id: NetEntityId,
    remote_role: NetEntityRole,
    bound_local_role: NetEntityRole,
    prefab: Option<PrefabEntityId>,
    owns_lifetime: bool,
    marked_for_removal: Option<Instant>,

    established: bool,
    acked: Option<EntitySnapshot>,
    in_flight: Vec<(PacketId, EntitySnapshot)>,
    last_sent: Option<(EntitySnapshot, Instant)>,
    staged: Option<EntitySnapshot>,
    delete_sent: Option<(PacketId, Instant)>,
    delete_acked: bool,

    last_received_packet: Option<PacketId>,
}

impl EntityReplicator {
    pub fn publisher(entity: &NetworkEntity, remote_role: NetEntityRole) -> Self {
        Self::new(entity.id, remote_role, entity.role, Some(entity.prefab.clone()), true)
    }

    pub fn subscriber(
        entity_id: NetEntityId,
        bound_local_role: NetEntityRole,
        prefab: PrefabEntityId,
    ) -> Self {
        Self::new(
            entity_id,
            NetEntityRole::Authority,
            bound_local_role,
            Some(prefab),
            false,
        )
    }

    fn new(
        entity_id: NetEntityId,
        remote_role: NetEntityRole,
        bound_local_role: NetEntityRole,
        prefab: Option<PrefabEntityId>,
        owns_lifetime: bool,
    ) -> Self {
        Self {
            entity_id,
            remote_role,
            bound_local_role,
            prefab,
            owns_lifetime,
            marked_for_removal: None,
            established: false,
            acked: None,
            in_flight: Vec::new(),
            last_sent: None,
            staged: None,
            delete_sent: None,
            delete_acked: false,
            last_received_packet: None,
        }
    }

    pub fn entity_id(&self) -> NetEntityId {
        self.entity_id
    }

    pub fn remote_role(&self) -> NetEntityRole {
        self.remote_role
    }

    pub fn bound_local_role(&self) -> NetEntityRole {
        self.bound_local_role
    }

    pub fn prefab(&self) -> Option<&PrefabEntityId> {
        self.prefab.as_ref()
    }

    pub fn owns_lifetime(&self) -> bool {
        self.owns_lifetime
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.marked_for_removal.is_some()
    }

    pub fn marked_since(&self) -> Option<Instant> {
        self.marked_for_removal
    }

    pub fn mark_for_removal(&mut self) {
        if self.marked_for_removal.is_none() {
            self.marked_for_removal = Some(Instant::now());
        }
    }

    /// The entity re-entered the window before its removal completed.
    pub fn clear_pending_removal(&mut self) {
        if self.marked_for_removal.take().is_some() {
            // The remote may already have dropped its copy.
            if self.delete_sent.take().is_some() {
                self.reset(self.remote_role);
            }
            self.delete_acked = false;
        }
    }

    pub fn is_remote_replicator_established(&self) -> bool {
        self.established
    }

    pub fn is_awaiting_creation(&self) -> bool {
        !self.established && self.last_sent.is_some()
    }

    /// Forgets everything the remote acknowledged; the next update carries the
    /// prefab id and full state again.
    pub fn reset(&mut self, remote_role: NetEntityRole) {
        self.remote_role = remote_role;
        self.established = false;
        self.acked = None;
        self.in_flight.clear();
        self.last_sent = None;
        self.staged = None;
    }

    pub fn is_delete_acked(&self) -> bool {
        self.delete_acked
    }

    pub fn requires_delete(&self, now: Instant, resend_timeout: Duration) -> bool {
        self.owns_lifetime
            && self.marked_for_removal.is_some()
            && !self.delete_acked
            && self
                .delete_sent
                .is_none_or(|(_, sent)| now.duration_since(sent) >= resend_timeout)
    }

    /// True when the entity holds state the remote has not acknowledged and
    /// that is not already in flight within the resend timeout.
    pub fn requires_serialization(
        &self,
        entity: &NetworkEntity,
        now: Instant,
        resend_timeout: Duration,
    ) -> bool {
        let current = EntitySnapshot::capture(entity);
        if self.established && self.acked.as_ref() == Some(&current) {
            return false;
        }
        match &self.last_sent {
            Some((sent, at)) => *sent != current || now.duration_since(*at) >= resend_timeout,
            None => true,
        }
    }

    /// Builds the update for `entity` against the acknowledged state. The
    /// result is staged until [`Self::finalize_serialization`] records its packet.
    pub fn generate_update(&mut self, entity: &NetworkEntity) -> EntityUpdateMessage {
        let current = EntitySnapshot::capture(entity);
        let (transform, properties) = current.diff(self.acked.as_ref());
        self.staged = Some(current);

        EntityUpdateMessage {
            entity_id: self.entity_id,
            network_role: self.remote_role,
            is_delete: false,
            prefab: if self.established {
                None
            } else {
                self.prefab.clone()
            },
            transform,
            properties,
        }
    }

    pub fn generate_delete(&self) -> EntityUpdateMessage {
        EntityUpdateMessage::delete(self.entity_id, self.remote_role)
    }

    pub fn finalize_serialization(&mut self, packet_id: PacketId, now: Instant) {
        if let Some(snapshot) = self.staged.take() {
            self.in_flight.push((packet_id, snapshot.clone()));
            self.last_sent = Some((snapshot, now));
        }
    }

    pub fn finalize_delete(&mut self, packet_id: PacketId, now: Instant) {
        self.delete_sent = Some((packet_id, now));
    }

    pub fn on_packet_acked(&mut self, packet_id: PacketId) {
        if self
            .delete_sent
            .is_some_and(|(sent_id, _)| sent_id == packet_id)
        {
            self.delete_acked = true;
            return;
        }

        let Some(position) = self.in_flight.iter().position(|(id, _)| *id == packet_id) else {
            return;
        };
        // Anything sent before the acknowledged packet is superseded by it.
        let (_, snapshot) = self.in_flight.drain(..=position).last().unzip();
        if let Some(snapshot) = snapshot {
            self.acked = Some(snapshot);
            self.established = true;
        }
    }

    pub fn is_packet_id_valid(&self, packet_id: PacketId) -> bool {
        match self.last_received_packet {
            Some(last) => packet_id == last || packet_id.is_newer_than(last),
            None => true,
        }
    }

    pub fn record_received(&mut self, packet_id: PacketId) {
        if self.is_packet_id_valid(packet_id) {
            self.last_received_packet = Some(packet_id);
        }
    }

    pub fn last_received_packet(&self) -> Option<PacketId> {
        self.last_received_packet
    }
}
