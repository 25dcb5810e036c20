use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use glam::Vec3;

use crate::ids::{ClientInputId, ConnectionId, HostId, NetComponentId, NetEntityId, RpcIndex};
use crate::net::EntityRpcMessage;

use super::component::{
    PrefabDescriptor, PrefabEntityId, PropertyValue, Reliability, RpcDeliveryType,
};
use super::network_entity::{NetEntityRole, NetworkEntity, ReceivedRpc};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EntityError {
    #[error("unknown prefab {0}")]
    UnknownPrefab(String),
    #[error("prefab {prefab} has no entity at offset {offset}")]
    BadPrefabOffset { prefab: String, offset: u32 },
    #[error("entity {0} does not exist")]
    UnknownEntity(NetEntityId),
    #[error("entity {0} already exists")]
    DuplicateEntity(NetEntityId),
    #[error("entity {entity} has no component {component}")]
    UnknownComponent {
        entity: NetEntityId,
        component: NetComponentId,
    },
    #[error("entity {entity} component {component} rejected property {property}")]
    BadProperty {
        entity: NetEntityId,
        component: NetComponentId,
        property: u16,
    },
    #[error("entity {entity} component {component} has no rpc {rpc}")]
    UnknownRpc {
        entity: NetEntityId,
        component: NetComponentId,
        rpc: RpcIndex,
    },
    #[error("entity {entity} with role {role} cannot invoke this rpc")]
    WrongRole {
        entity: NetEntityId,
        role: &'static str,
    },
    #[error("entity {0} is not authoritative here")]
    NotAuthority(NetEntityId),
}

/// Decides which entities a host simulates authoritatively.
pub trait EntityDomain: Send {
    fn is_in_domain(&self, entity: &NetworkEntity) -> bool;
}

#[derive(Debug, Default)]
pub struct FullOwnershipEntityDomain;

impl EntityDomain for FullOwnershipEntityDomain {
    fn is_in_domain(&self, _entity: &NetworkEntity) -> bool {
        true
    }
}

/// An RPC invoked locally that must travel to one or more remote peers.
#[derive(Debug, Clone)]
pub struct OutboundRpc {
    pub message: EntityRpcMessage,
    pub delivery: RpcDeliveryType,
    pub reliability: Reliability,
    pub owning_connection: Option<ConnectionId>,
}

pub struct NetworkEntityManager {
    host_id: HostId,
    domain: Option<Box<dyn EntityDomain>>,
    prefabs: HashMap<String, Arc<PrefabDescriptor>>,
    entities: BTreeMap<NetEntityId, NetworkEntity>,
    next_entity_id: u64,
    dirty: BTreeSet<NetEntityId>,
    changed: BTreeSet<NetEntityId>,
    removal_list: Vec<NetEntityId>,
    removed: Vec<NetEntityId>,
    local_deferred_rpcs: VecDeque<(NetEntityId, ReceivedRpc)>,
    outbound_rpcs: Vec<OutboundRpc>,
}

impl Default for NetworkEntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkEntityManager {
    pub fn new() -> Self {
        Self {
            host_id: HostId::INVALID,
            domain: None,
            prefabs: HashMap::new(),
            entities: BTreeMap::new(),
            next_entity_id: 1,
            dirty: BTreeSet::new(),
            changed: BTreeSet::new(),
            removal_list: Vec::new(),
            removed: Vec::new(),
            local_deferred_rpcs: VecDeque::new(),
            outbound_rpcs: Vec::new(),
        }
    }

    pub fn initialize(&mut self, host_id: HostId, domain: Box<dyn EntityDomain>) {
        self.host_id = host_id;
        self.domain = Some(domain);
    }

    pub fn is_initialized(&self) -> bool {
        self.domain.is_some()
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn set_host_id(&mut self, host_id: HostId) {
        self.host_id = host_id;
    }

    pub fn register_prefab(&mut self, name: impl Into<String>, prefab: PrefabDescriptor) {
        self.prefabs.insert(name.into(), Arc::new(prefab));
    }

    pub fn has_prefab(&self, name: &str) -> bool {
        self.prefabs.contains_key(name)
    }

    /// Spawns an authoritative entity and allocates its id.
    pub fn create_entity(
        &mut self,
        prefab: &PrefabEntityId,
        transform: Vec3,
    ) -> Result<NetEntityId, EntityError> {
        let id = NetEntityId(self.next_entity_id);
        let mut entity = self.instantiate(prefab, id, NetEntityRole::Authority)?;
        self.next_entity_id += 1;

        entity.transform = transform;
        entity.render_transform = transform;
        entity.set_active(true);
        if let Some(domain) = &self.domain {
            if !domain.is_in_domain(&entity) {
                log::warn!("Entity {} spawned outside of the local domain", id);
            }
        }

        self.entities.insert(id, entity);
        self.dirty.insert(id);
        log::debug!("Spawned entity {} from {}", id, prefab.prefab_name);
        Ok(id)
    }

    /// Creates an inactive local copy of a remotely owned entity.
    pub fn create_replica(
        &mut self,
        prefab: &PrefabEntityId,
        id: NetEntityId,
        role: NetEntityRole,
    ) -> Result<&mut NetworkEntity, EntityError> {
        if self.entities.contains_key(&id) {
            return Err(EntityError::DuplicateEntity(id));
        }
        let entity = self.instantiate(prefab, id, role)?;
        Ok(self.entities.entry(id).or_insert(entity))
    }

    fn instantiate(
        &self,
        prefab: &PrefabEntityId,
        id: NetEntityId,
        role: NetEntityRole,
    ) -> Result<NetworkEntity, EntityError> {
        let descriptor = self
            .prefabs
            .get(&prefab.prefab_name)
            .ok_or_else(|| EntityError::UnknownPrefab(prefab.prefab_name.clone()))?;
        let components =
            descriptor
                .entity(prefab.entity_offset)
                .ok_or_else(|| EntityError::BadPrefabOffset {
                    prefab: prefab.prefab_name.clone(),
                    offset: prefab.entity_offset,
                })?;
        Ok(NetworkEntity::new(id, prefab.clone(), role, components))
    }

    pub fn activate(&mut self, id: NetEntityId) -> bool {
        match self.entities.get_mut(&id) {
            Some(entity) if !entity.is_marked_for_removal() => {
                entity.set_active(true);
                entity.render_transform = entity.transform;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: NetEntityId) -> Option<&NetworkEntity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: NetEntityId) -> Option<&mut NetworkEntity> {
        self.entities.get_mut(&id)
    }

    pub fn contains(&self, id: NetEntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &NetworkEntity> {
        self.entities.values()
    }

    pub fn entities_mut(&mut self) -> impl Iterator<Item = &mut NetworkEntity> {
        self.entities.values_mut()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn set_property(
        &mut self,
        id: NetEntityId,
        component: NetComponentId,
        property: u16,
        value: PropertyValue,
    ) -> Result<(), EntityError> {
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(EntityError::UnknownEntity(id))?;
        if entity.role != NetEntityRole::Authority {
            return Err(EntityError::NotAuthority(id));
        }
        let state = entity
            .component_mut(component)
            .ok_or(EntityError::UnknownComponent {
                entity: id,
                component,
            })?;
        if !state.set_property(property as usize, value) {
            return Err(EntityError::BadProperty {
                entity: id,
                component,
                property,
            });
        }
        self.dirty.insert(id);
        Ok(())
    }

    pub fn set_transform(&mut self, id: NetEntityId, transform: Vec3) -> Result<(), EntityError> {
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(EntityError::UnknownEntity(id))?;
        if entity.role != NetEntityRole::Authority {
            return Err(EntityError::NotAuthority(id));
        }
        entity.transform = transform;
        self.dirty.insert(id);
        Ok(())
    }

    /// Queues an RPC; it runs locally on the next tick when this peer is its
    /// receiver, otherwise it is routed to the connections replicating the entity.
    pub fn invoke_rpc(
        &mut self,
        id: NetEntityId,
        component: NetComponentId,
        rpc: RpcIndex,
        params: Vec<PropertyValue>,
        input_id: Option<ClientInputId>,
    ) -> Result<(), EntityError> {
        let entity = self.entities.get(&id).ok_or(EntityError::UnknownEntity(id))?;
        let state = entity
            .component(component)
            .ok_or(EntityError::UnknownComponent {
                entity: id,
                component,
            })?;
        let descriptor = state.rpc(rpc.0 as usize).ok_or(EntityError::UnknownRpc {
            entity: id,
            component,
            rpc,
        })?;
        let delivery = descriptor.delivery;
        let reliability = descriptor.reliability;

        let message = EntityRpcMessage {
            entity_id: id,
            component,
            rpc,
            params,
            input_id,
        };

        // A host-controlled entity is both the autonomous invoker and the authority.
        let local_autonomous = delivery == RpcDeliveryType::AutonomousToAuthority
            && entity.role == NetEntityRole::Authority
            && entity.owning_connection.is_none();
        if local_autonomous {
            self.defer_local_rpc(message, None);
            return Ok(());
        }

        if delivery.invoker_role() != entity.role {
            return Err(EntityError::WrongRole {
                entity: id,
                role: entity.role.as_str(),
            });
        }

        self.outbound_rpcs.push(OutboundRpc {
            message,
            delivery,
            reliability,
            owning_connection: entity.owning_connection,
        });
        Ok(())
    }

    pub(crate) fn defer_local_rpc(&mut self, message: EntityRpcMessage, from: Option<ConnectionId>) {
        self.local_deferred_rpcs.push_back((
            message.entity_id,
            ReceivedRpc {
                component: message.component,
                rpc: message.rpc,
                params: message.params,
                input_id: message.input_id,
                from,
            },
        ));
    }

    pub fn dispatch_local_deferred_rpcs(&mut self) -> usize {
        let mut dispatched = 0;
        while let Some((id, rpc)) = self.local_deferred_rpcs.pop_front() {
            match self.entities.get_mut(&id) {
                Some(entity) => {
                    entity.push_rpc(rpc);
                    dispatched += 1;
                }
                None => log::debug!("Dropping local rpc for removed entity {}", id),
            }
        }
        dispatched
    }

    pub fn drain_outbound_rpcs(&mut self) -> Vec<OutboundRpc> {
        std::mem::take(&mut self.outbound_rpcs)
    }

    /// Publishes this frame's dirty set as the changed set and removes entities
    /// marked for removal.
    pub fn notify_entities_dirtied(&mut self) {
        self.changed = std::mem::take(&mut self.dirty);
        self.removed.clear();
        for id in std::mem::take(&mut self.removal_list) {
            if self.entities.remove(&id).is_some() {
                self.changed.remove(&id);
                self.removed.push(id);
                log::debug!("Removed entity {}", id);
            }
        }
    }

    pub fn changed_entities(&self) -> &BTreeSet<NetEntityId> {
        &self.changed
    }

    pub fn removed_entities(&self) -> &[NetEntityId] {
        &self.removed
    }

    pub fn mark_for_removal(&mut self, id: NetEntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            if !entity.is_marked_for_removal() {
                entity.set_marked_for_removal(true);
                entity.set_active(false);
                self.removal_list.push(id);
            }
        }
    }

    pub fn clear_from_removal_list(&mut self, id: NetEntityId) {
        self.removal_list.retain(|pending| *pending != id);
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.set_marked_for_removal(false);
        }
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.dirty.clear();
        self.changed.clear();
        self.removal_list.clear();
        self.removed.clear();
        self.local_deferred_rpcs.clear();
        self.outbound_rpcs.clear();
        self.next_entity_id = 1;
        self.domain = None;
        self.host_id = HostId::INVALID;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ComponentDescriptor, RpcDescriptor};

    fn manager() -> NetworkEntityManager {
        let mut manager = NetworkEntityManager::new();
        manager.initialize(HostId(1), Box::new(FullOwnershipEntityDomain));
        manager.register_prefab(
            "crate",
            PrefabDescriptor::single(vec![
                ComponentDescriptor::new("Lid")
                    .with_property(PropertyValue::Bool(false))
                    .with_rpc(RpcDescriptor::new(
                        "Open",
                        RpcDeliveryType::AutonomousToAuthority,
                        Reliability::Reliable,
                    ))
                    .with_rpc(RpcDescriptor::new(
                        "Rattle",
                        RpcDeliveryType::AuthorityToClient,
                        Reliability::Unreliable,
                    )),
            ]),
        );
        manager
    }

    #[test]
    fn ids_are_not_reused() {
        let mut manager = manager();
        let prefab = PrefabEntityId::new("crate", 0);
        let first = manager.create_entity(&prefab, Vec3::ZERO).unwrap();
        manager.mark_for_removal(first);
        manager.notify_entities_dirtied();
        let second = manager.create_entity(&prefab, Vec3::ZERO).unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.removed_entities(), &[first]);
        assert!(!manager.contains(first));
    }

    #[test]
    fn dirty_becomes_changed_on_notify() {
        let mut manager = manager();
        let id = manager
            .create_entity(&PrefabEntityId::new("crate", 0), Vec3::ZERO)
            .unwrap();
        manager.notify_entities_dirtied();
        assert!(manager.changed_entities().contains(&id));

        manager.notify_entities_dirtied();
        assert!(manager.changed_entities().is_empty());

        manager
            .set_property(id, NetComponentId(0), 0, PropertyValue::Bool(true))
            .unwrap();
        manager.notify_entities_dirtied();
        assert!(manager.changed_entities().contains(&id));
    }

    #[test]
    fn unknown_prefab_fails() {
        let mut manager = manager();
        let err = manager
            .create_entity(&PrefabEntityId::new("missing", 0), Vec3::ZERO)
            .unwrap_err();
        assert_eq!(err, EntityError::UnknownPrefab("missing".to_string()));
    }

    #[test]
    fn host_owned_autonomous_rpc_runs_locally() {
        let mut manager = manager();
        let id = manager
            .create_entity(&PrefabEntityId::new("crate", 0), Vec3::ZERO)
            .unwrap();
        manager
            .invoke_rpc(id, NetComponentId(0), RpcIndex(0), Vec::new(), None)
            .unwrap();
        assert!(manager.drain_outbound_rpcs().is_empty());
        assert_eq!(manager.dispatch_local_deferred_rpcs(), 1);
        assert_eq!(manager.get_mut(id).unwrap().take_rpcs().len(), 1);
    }

    #[test]
    fn authority_rpc_goes_outbound() {
        let mut manager = manager();
        let id = manager
            .create_entity(&PrefabEntityId::new("crate", 0), Vec3::ZERO)
            .unwrap();
        manager
            .invoke_rpc(id, NetComponentId(0), RpcIndex(1), Vec::new(), None)
            .unwrap();
        let outbound = manager.drain_outbound_rpcs();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].reliability, Reliability::Unreliable);
        assert!(
            manager
                .invoke_rpc(id, NetComponentId(0), RpcIndex(9), Vec::new(), None)
                .is_err()
        );
    }
}
