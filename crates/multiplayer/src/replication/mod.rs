mod manager;
mod orphaned;
mod replicator;
mod window;

pub use manager::{EntityReplicationManager, ReplicationMode, ReplicationSettings, UpdateContext};
pub use orphaned::OrphanedEntityRpcs;
pub use replicator::{EntityReplicator, EntitySnapshot};
pub use window::{
    AllEntitiesRelevance, NullReplicationWindow, RadiusRelevance, RelevanceStrategy,
    ReplicationSet, ReplicationWindow, ServerToClientReplicationWindow, relevance_for_radius,
};
