use std::collections::VecDeque;
use std::sync::Arc;

use glam::Vec3;
use rkyv::{Archive, Deserialize, Serialize};

use crate::ids::{ClientInputId, ConnectionId, NetComponentId, NetEntityId, RpcIndex};

use super::component::{ComponentDescriptor, ComponentState, PrefabEntityId, PropertyValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug, PartialEq, Eq))]
pub enum NetEntityRole {
    /// Simulated-proxy copy on a client.
    Client,
    /// Client copy the local player controls.
    Autonomous,
    /// Owner of the canonical state.
    Authority,
}

impl NetEntityRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetEntityRole::Client => "client",
            NetEntityRole::Autonomous => "autonomous",
            NetEntityRole::Authority => "authority",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedRpc {
    pub component: NetComponentId,
    pub rpc: RpcIndex,
    pub params: Vec<PropertyValue>,
    pub input_id: Option<ClientInputId>,
    pub from: Option<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct NetworkEntity {
    pub id: NetEntityId,
    pub prefab: PrefabEntityId,
    pub role: NetEntityRole,
    pub owning_connection: Option<ConnectionId>,
    pub transform: Vec3,
    pub render_transform: Vec3,
    active: bool,
    marked_for_removal: bool,
    components: Vec<ComponentState>,
    rpc_inbox: VecDeque<ReceivedRpc>,
}

impl NetworkEntity {
    pub fn new(
        id: NetEntityId,
        prefab: PrefabEntityId,
        role: NetEntityRole,
        components: &[Arc<ComponentDescriptor>],
    ) -> Self {
        Self {
            id,
            prefab,
            role,
            owning_connection: None,
            transform: Vec3::ZERO,
            render_transform: Vec3::ZERO,
            active: false,
            marked_for_removal: false,
            components: components
                .iter()
                .cloned()
                .map(ComponentState::new)
                .collect(),
            rpc_inbox: VecDeque::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.marked_for_removal
    }

    pub(crate) fn set_marked_for_removal(&mut self, marked: bool) {
        self.marked_for_removal = marked;
    }

    pub fn components(&self) -> &[ComponentState] {
        &self.components
    }

    pub fn component(&self, id: NetComponentId) -> Option<&ComponentState> {
        self.components.get(id.0 as usize)
    }

    pub(crate) fn component_mut(&mut self, id: NetComponentId) -> Option<&mut ComponentState> {
        self.components.get_mut(id.0 as usize)
    }

    pub fn property(&self, component: NetComponentId, index: usize) -> Option<&PropertyValue> {
        self.component(component).and_then(|c| c.property(index))
    }

    pub(crate) fn push_rpc(&mut self, rpc: ReceivedRpc) {
        self.rpc_inbox.push_back(rpc);
    }

    pub fn pending_rpc_count(&self) -> usize {
        self.rpc_inbox.len()
    }

    /// Hands the RPCs received since the last call to gameplay code.
    pub fn take_rpcs(&mut self) -> Vec<ReceivedRpc> {
        self.rpc_inbox.drain(..).collect()
    }

    pub fn blend_render_transform(&mut self, factor: f32) {
        self.render_transform = self.render_transform.lerp(self.transform, factor.clamp(0.0, 1.0));
    }
}
