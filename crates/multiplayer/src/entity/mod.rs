mod component;
mod manager;
mod network_entity;

pub use component::{
    ComponentDescriptor, ComponentState, PrefabDescriptor, PrefabEntityId, PropertyValue,
    Reliability, RpcDeliveryType, RpcDescriptor,
};
pub use manager::{
    EntityDomain, EntityError, FullOwnershipEntityDomain, NetworkEntityManager, OutboundRpc,
};
pub use network_entity::{NetEntityRole, NetworkEntity, ReceivedRpc};
