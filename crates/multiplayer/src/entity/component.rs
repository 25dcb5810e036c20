use std::sync::Arc;

use rkyv::{Archive, Deserialize, Serialize};

use super::network_entity::NetEntityRole;

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Vec3([f32; 3]),
    Text(String),
}

impl PropertyValue {
    pub fn estimated_size(&self) -> usize {
        1 + match self {
            Self::Bool(_) => 1,
            Self::Int(_) => 8,
            Self::Float(_) => 4,
            Self::Vec3(_) => 12,
            Self::Text(text) => 4 + text.len(),
        }
    }

    pub fn same_kind(&self, other: &PropertyValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

/// Which role invokes an RPC and which role runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcDeliveryType {
    AuthorityToClient,
    AuthorityToAutonomous,
    AutonomousToAuthority,
}

impl RpcDeliveryType {
    pub fn invoker_role(self) -> NetEntityRole {
        match self {
            Self::AuthorityToClient | Self::AuthorityToAutonomous => NetEntityRole::Authority,
            Self::AutonomousToAuthority => NetEntityRole::Autonomous,
        }
    }

    pub fn can_handle(self, local_role: NetEntityRole) -> bool {
        match self {
            Self::AuthorityToClient => {
                matches!(local_role, NetEntityRole::Client | NetEntityRole::Autonomous)
            }
            Self::AuthorityToAutonomous => local_role == NetEntityRole::Autonomous,
            Self::AutonomousToAuthority => local_role == NetEntityRole::Authority,
        }
    }

    pub fn autonomous_only(self) -> bool {
        matches!(self, Self::AuthorityToAutonomous)
    }
}

#[derive(Debug, Clone)]
pub struct RpcDescriptor {
    pub name: String,
    pub delivery: RpcDeliveryType,
    pub reliability: Reliability,
}

impl RpcDescriptor {
    pub fn new(name: impl Into<String>, delivery: RpcDeliveryType, reliability: Reliability) -> Self {
        Self {
            name: name.into(),
            delivery,
            reliability,
        }
    }
}

/// Shape of a replicated component: default property values and its RPC table.
#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    pub name: String,
    pub properties: Vec<PropertyValue>,
    pub rpcs: Vec<RpcDescriptor>,
}

impl ComponentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            rpcs: Vec::new(),
        }
    }

    pub fn with_property(mut self, default: PropertyValue) -> Self {
        self.properties.push(default);
        self
    }

    pub fn with_rpc(mut self, rpc: RpcDescriptor) -> Self {
        self.rpcs.push(rpc);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ComponentState {
    descriptor: Arc<ComponentDescriptor>,
    properties: Vec<PropertyValue>,
}

impl ComponentState {
    pub fn new(descriptor: Arc<ComponentDescriptor>) -> Self {
        let properties = descriptor.properties.clone();
        Self {
            descriptor,
            properties,
        }
    }

    pub fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    pub fn properties(&self) -> &[PropertyValue] {
        &self.properties
    }

    pub fn property(&self, index: usize) -> Option<&PropertyValue> {
        self.properties.get(index)
    }

    /// Returns false when the index is out of range or the value kind does not match.
    pub fn set_property(&mut self, index: usize, value: PropertyValue) -> bool {
        match self.properties.get_mut(index) {
            Some(slot) if slot.same_kind(&value) => {
                *slot = value;
                true
            }
            _ => false,
        }
    }

    pub fn rpc(&self, index: usize) -> Option<&RpcDescriptor> {
        self.descriptor.rpcs.get(index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PrefabEntityId {
    pub prefab_name: String,
    pub entity_offset: u32,
}

impl PrefabEntityId {
    pub fn new(prefab_name: impl Into<String>, entity_offset: u32) -> Self {
        Self {
            prefab_name: prefab_name.into(),
            entity_offset,
        }
    }

    pub fn estimated_size(&self) -> usize {
        8 + self.prefab_name.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrefabDescriptor {
    entities: Vec<Vec<Arc<ComponentDescriptor>>>,
}

impl PrefabDescriptor {
    pub fn single(components: Vec<ComponentDescriptor>) -> Self {
        Self {
            entities: vec![components.into_iter().map(Arc::new).collect()],
        }
    }

    pub fn with_entity(mut self, components: Vec<ComponentDescriptor>) -> Self {
        self.entities
            .push(components.into_iter().map(Arc::new).collect());
        self
    }

    pub fn entity(&self, offset: u32) -> Option<&[Arc<ComponentDescriptor>]> {
        self.entities.get(offset as usize).map(Vec::as_slice)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_property_checks_kind_and_range() {
        let descriptor = ComponentDescriptor::new("Health")
            .with_property(PropertyValue::Int(100))
            .with_property(PropertyValue::Bool(false));
        let mut state = ComponentState::new(Arc::new(descriptor));

        assert!(state.set_property(0, PropertyValue::Int(75)));
        assert!(!state.set_property(0, PropertyValue::Float(1.0)));
        assert!(!state.set_property(5, PropertyValue::Int(1)));
        assert_eq!(state.property(0), Some(&PropertyValue::Int(75)));
    }

    #[test]
    fn rpc_roles() {
        assert!(RpcDeliveryType::AuthorityToClient.can_handle(NetEntityRole::Client));
        assert!(RpcDeliveryType::AuthorityToClient.can_handle(NetEntityRole::Autonomous));
        assert!(!RpcDeliveryType::AuthorityToClient.can_handle(NetEntityRole::Authority));
        assert!(!RpcDeliveryType::AuthorityToAutonomous.can_handle(NetEntityRole::Client));
        assert!(RpcDeliveryType::AutonomousToAuthority.can_handle(NetEntityRole::Authority));
        assert!(!RpcDeliveryType::AutonomousToAuthority.can_handle(NetEntityRole::Autonomous));
    }
}
