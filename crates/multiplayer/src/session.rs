use std::net::SocketAddr;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::ids::ConnectionId;
use crate::net::{ConnectionRole, DisconnectReason};
use crate::system::AgentType;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionInit {
        agent_type: AgentType,
    },
    SessionShutdown,
    ConnectionAcquired {
        id: ConnectionId,
        role: ConnectionRole,
        remote: SocketAddr,
    },
    ConnectionLost {
        id: ConnectionId,
        role: ConnectionRole,
        reason: DisconnectReason,
    },
    LevelLoadRequested {
        map: String,
    },
}

/// Fans session events out to every live subscriber.
#[derive(Debug, Default)]
pub struct SessionEvents {
    subscribers: Vec<Sender<SessionEvent>>,
}

impl SessionEvents {
    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: SessionEvent) {
        log::debug!("Session event {:?}", event);
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut events = SessionEvents::default();
        let kept = events.subscribe();
        let dropped = events.subscribe();
        drop(dropped);

        events.emit(SessionEvent::SessionShutdown);
        assert_eq!(events.subscriber_count(), 1);
        assert_eq!(kept.try_recv(), Ok(SessionEvent::SessionShutdown));
    }
}
