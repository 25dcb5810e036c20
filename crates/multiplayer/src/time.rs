use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};

use crate::ids::{ConnectionId, HostFrameId, NetEntityId};

/// Logical session clock: the host frame id and the host time that goes with it.
#[derive(Debug, Default)]
pub struct NetworkTime {
    host_frame_id: HostFrameId,
    host_time_ms: u64,
    last_source: Option<ConnectionId>,
    unaltered: Option<(HostFrameId, u64)>,
    rewound_entities: BTreeSet<NetEntityId>,
}

impl NetworkTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host_frame_id(&self) -> HostFrameId {
        self.host_frame_id
    }

    pub fn host_time_ms(&self) -> u64 {
        self.host_time_ms
    }

    pub fn time_source(&self) -> Option<ConnectionId> {
        self.last_source
    }

    pub fn increment_host_frame_id(&mut self) {
        self.host_frame_id = self.host_frame_id.next();
    }

    pub fn advance_host_time(&mut self, delta_ms: u64) {
        self.host_time_ms = self.host_time_ms.saturating_add(delta_ms);
    }

    /// Adopts a replicated frame and time. Returns false, changing nothing,
    /// unless `frame` is ahead of the current frame id.
    pub fn alter_time(&mut self, frame: HostFrameId, time_ms: u64, source: ConnectionId) -> bool {
        if frame <= self.host_frame_id {
            return false;
        }
        self.host_frame_id = frame;
        self.host_time_ms = time_ms;
        self.last_source = Some(source);
        true
    }

    pub fn force_set_time(&mut self, frame: HostFrameId, time_ms: u64) {
        self.host_frame_id = frame;
        self.host_time_ms = time_ms;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_time_rewound(&self) -> bool {
        self.unaltered.is_some()
    }

    pub fn unaltered_host_frame_id(&self) -> HostFrameId {
        self.unaltered.map_or(self.host_frame_id, |(frame, _)| frame)
    }

    /// Moves the clock back for input reconciliation until the guard drops.
    pub fn rewind(&mut self, frame: HostFrameId, time_ms: u64) -> RewindGuard<'_> {
        if self.unaltered.is_none() {
            self.unaltered = Some((self.host_frame_id, self.host_time_ms));
        }
        self.host_frame_id = frame;
        self.host_time_ms = time_ms;
        RewindGuard { time: self }
    }

    pub fn sync_entity_to_rewind_state(&mut self, entity: NetEntityId) {
        if self.is_time_rewound() {
            self.rewound_entities.insert(entity);
        }
    }

    pub fn rewound_entity_count(&self) -> usize {
        self.rewound_entities.len()
    }

    /// Forgets entities synced during this tick's rewinds and returns them.
    pub fn clear_rewound_entities(&mut self) -> Vec<NetEntityId> {
        std::mem::take(&mut self.rewound_entities)
            .into_iter()
            .collect()
    }
}

pub struct RewindGuard<'a> {
    time: &'a mut NetworkTime,
}

impl Deref for RewindGuard<'_> {
    type Target = NetworkTime;

    fn deref(&self) -> &NetworkTime {
        self.time
    }
}

impl DerefMut for RewindGuard<'_> {
    fn deref_mut(&mut self) -> &mut NetworkTime {
        self.time
    }
}

impl Drop for RewindGuard<'_> {
    fn drop(&mut self) {
        if let Some((frame, time_ms)) = self.time.unaltered.take() {
            self.time.host_frame_id = frame;
            self.time.host_time_ms = time_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alter_time_never_moves_backwards() {
        let mut time = NetworkTime::new();
        assert!(time.alter_time(HostFrameId(10), 500, ConnectionId(1)));
        assert!(!time.alter_time(HostFrameId(10), 900, ConnectionId(1)));
        assert!(!time.alter_time(HostFrameId(4), 100, ConnectionId(1)));
        assert_eq!(time.host_frame_id(), HostFrameId(10));
        assert_eq!(time.host_time_ms(), 500);

        assert!(time.alter_time(HostFrameId(11), 550, ConnectionId(2)));
        assert_eq!(time.time_source(), Some(ConnectionId(2)));
    }

    #[test]
    fn rewind_restores_on_drop() {
        let mut time = NetworkTime::new();
        time.force_set_time(HostFrameId(20), 1000);
        {
            let mut rewound = time.rewind(HostFrameId(15), 750);
            assert!(rewound.is_time_rewound());
            assert_eq!(rewound.host_frame_id(), HostFrameId(15));
            assert_eq!(rewound.unaltered_host_frame_id(), HostFrameId(20));
            rewound.sync_entity_to_rewind_state(NetEntityId(3));
        }
        assert!(!time.is_time_rewound());
        assert_eq!(time.host_frame_id(), HostFrameId(20));
        assert_eq!(time.host_time_ms(), 1000);

        assert_eq!(time.clear_rewound_entities(), vec![NetEntityId(3)]);
        assert_eq!(time.rewound_entity_count(), 0);
    }

    #[test]
    fn sync_outside_rewind_is_ignored() {
        let mut time = NetworkTime::new();
        time.sync_entity_to_rewind_state(NetEntityId(1));
        assert!(time.clear_rewound_entities().is_empty());
    }
}
