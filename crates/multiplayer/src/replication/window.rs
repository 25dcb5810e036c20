use std::collections::BTreeMap;

use glam::Vec3;

use crate::entity::{NetEntityRole, NetworkEntity, NetworkEntityManager};
use crate::ids::{ConnectionId, NetEntityId};

/// Entities a connection should currently see, with the role the remote
/// binds each to.
pub type ReplicationSet = BTreeMap<NetEntityId, NetEntityRole>;

/// Relevance policy for one connection.
pub trait ReplicationWindow: Send {
    /// Recomputes the set from the current world.
    fn update_window(&mut self, entities: &NetworkEntityManager);

    fn replication_set_update_ready(&self) -> bool;

    fn replication_set(&self) -> &ReplicationSet;

    /// Non-autonomous entities sent per update pass.
    fn max_proxy_entity_send_count(&self) -> usize;

    fn controlled_entity(&self) -> Option<NetEntityId> {
        None
    }
}

#[derive(Debug, Default)]
pub struct NullReplicationWindow {
    empty: ReplicationSet,
}

impl ReplicationWindow for NullReplicationWindow {
    fn update_window(&mut self, _entities: &NetworkEntityManager) {}

    fn replication_set_update_ready(&self) -> bool {
        false
    }

    fn replication_set(&self) -> &ReplicationSet {
        &self.empty
    }

    fn max_proxy_entity_send_count(&self) -> usize {
        0
    }
}

pub trait RelevanceStrategy: Send {
    fn is_relevant(&self, observer: Option<Vec3>, entity: &NetworkEntity) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllEntitiesRelevance;

impl RelevanceStrategy for AllEntitiesRelevance {
    fn is_relevant(&self, _observer: Option<Vec3>, _entity: &NetworkEntity) -> bool {
        true
    }
}

/// Entities within `radius` of the controlled entity. Without a controlled
/// entity nothing but the controlled entity itself is relevant.
#[derive(Debug, Clone, Copy)]
pub struct RadiusRelevance {
    pub radius: f32,
}

impl RelevanceStrategy for RadiusRelevance {
    fn is_relevant(&self, observer: Option<Vec3>, entity: &NetworkEntity) -> bool {
        observer.is_some_and(|origin| origin.distance_squared(entity.transform) <= self.radius * self.radius)
    }
}

pub fn relevance_for_radius(radius: f32) -> Box<dyn RelevanceStrategy> {
    if radius > 0.0 {
        Box::new(RadiusRelevance { radius })
    } else {
        Box::new(AllEntitiesRelevance)
    }
}

pub struct ServerToClientReplicationWindow {
    controlled_entity: Option<NetEntityId>,
    connection: ConnectionId,
    strategy: Box<dyn RelevanceStrategy>,
    set: ReplicationSet,
    max_entities: usize,
    max_proxy_send: usize,
}

impl ServerToClientReplicationWindow {
    pub fn new(
        controlled_entity: Option<NetEntityId>,
        connection: ConnectionId,
        strategy: Box<dyn RelevanceStrategy>,
    ) -> Self {
        Self {
            controlled_entity,
            connection,
            strategy,
            set: ReplicationSet::new(),
            max_entities: usize::MAX,
            max_proxy_send: 64,
        }
    }

    pub fn with_limits(mut self, max_entities: usize, max_proxy_send: usize) -> Self {
        self.max_entities = max_entities;
        self.max_proxy_send = max_proxy_send;
        self
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

impl ReplicationWindow for ServerToClientReplicationWindow {
    fn update_window(&mut self, entities: &NetworkEntityManager) {
        self.set.clear();

        let controlled = self.controlled_entity.and_then(|id| entities.get(id));
        if let Some(entity) = controlled {
            if !entity.is_marked_for_removal() {
                self.set.insert(entity.id, NetEntityRole::Autonomous);
            }
        }
        let observer = controlled.map(|entity| entity.transform);

        for entity in entities.entities() {
            if self.set.len() >= self.max_entities {
                break;
            }
            if Some(entity.id) == self.controlled_entity
                || entity.role != NetEntityRole::Authority
                || !entity.is_active()
                || entity.is_marked_for_removal()
            {
                continue;
            }
            if self.strategy.is_relevant(observer, entity) {
                self.set.insert(entity.id, NetEntityRole::Client);
            }
        }
    }

    fn replication_set_update_ready(&self) -> bool {
        true
    }

    fn replication_set(&self) -> &ReplicationSet {
        &self.set
    }

    fn max_proxy_entity_send_count(&self) -> usize {
        self.max_proxy_send
    }

    fn controlled_entity(&self) -> Option<NetEntityId> {
        self.controlled_entity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{FullOwnershipEntityDomain, PrefabDescriptor, PrefabEntityId};
    use crate::ids::HostId;

    fn world() -> (NetworkEntityManager, NetEntityId, NetEntityId, NetEntityId) {
        let mut entities = NetworkEntityManager::new();
        entities.initialize(HostId(1), Box::new(FullOwnershipEntityDomain));
        entities.register_prefab("thing", PrefabDescriptor::single(Vec::new()));
        let prefab = PrefabEntityId::new("thing", 0);
        let player = entities.create_entity(&prefab, Vec3::ZERO).unwrap();
        let near = entities.create_entity(&prefab, Vec3::new(3.0, 0.0, 0.0)).unwrap();
        let far = entities.create_entity(&prefab, Vec3::new(300.0, 0.0, 0.0)).unwrap();
        (entities, player, near, far)
    }

    #[test]
    fn controlled_entity_is_autonomous() {
        let (entities, player, near, far) = world();
        let mut window =
            ServerToClientReplicationWindow::new(Some(player), ConnectionId(1), Box::new(AllEntitiesRelevance));
        window.update_window(&entities);

        let set = window.replication_set();
        assert_eq!(set.get(&player), Some(&NetEntityRole::Autonomous));
        assert_eq!(set.get(&near), Some(&NetEntityRole::Client));
        assert_eq!(set.get(&far), Some(&NetEntityRole::Client));
    }

    #[test]
    fn radius_drops_distant_entities() {
        let (entities, player, near, far) = world();
        let mut window =
            ServerToClientReplicationWindow::new(Some(player), ConnectionId(1), relevance_for_radius(10.0));
        window.update_window(&entities);

        let set = window.replication_set();
        assert!(set.contains_key(&player));
        assert!(set.contains_key(&near));
        assert!(!set.contains_key(&far));
    }

    #[test]
    fn null_window_is_empty() {
        let (entities, ..) = world();
        let mut window = NullReplicationWindow::default();
        window.update_window(&entities);
        assert!(!window.replication_set_update_ready());
        assert!(window.replication_set().is_empty());
    }
}
