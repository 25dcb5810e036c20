use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::ids::NetEntityId;
use crate::net::EntityRpcMessage;

#[derive(Debug)]
struct OrphanedRpcs {
    deadline: Instant,
    messages: Vec<EntityRpcMessage>,
}

/// RPCs that arrived before their entity existed or was active.
#[derive(Debug)]
pub struct OrphanedEntityRpcs {
    timeout: Duration,
    rpcs: HashMap<NetEntityId, OrphanedRpcs>,
}

impl OrphanedEntityRpcs {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            rpcs: HashMap::new(),
        }
    }

    /// The timeout starts with the first RPC held for an entity.
    pub fn add(&mut self, message: EntityRpcMessage) {
        let timeout = self.timeout;
        self.rpcs
            .entry(message.entity_id)
            .or_insert_with(|| OrphanedRpcs {
                deadline: Instant::now() + timeout,
                messages: Vec::new(),
            })
            .messages
            .push(message);
    }

    pub fn take(&mut self, entity: NetEntityId) -> Vec<EntityRpcMessage> {
        self.rpcs
            .remove(&entity)
            .map(|orphaned| orphaned.messages)
            .unwrap_or_default()
    }

    /// Drops held RPCs whose entity never showed up in time.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut dropped = 0;
        self.rpcs.retain(|entity, orphaned| {
            if now < orphaned.deadline {
                return true;
            }
            for message in &orphaned.messages {
                log::info!(
                    "Dropping remote rpc {} of component {}, entity {} never arrived",
                    message.rpc,
                    message.component,
                    entity
                );
            }
            dropped += orphaned.messages.len();
            false
        });
        dropped
    }

    pub fn len(&self) -> usize {
        self.rpcs.values().map(|orphaned| orphaned.messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rpcs.is_empty()
    }

    pub fn clear(&mut self) {
        self.rpcs.clear();
    }
}
