use std::ops::AddAssign;

/// Bytes and call counts for one direction of one kind of traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounter {
    pub calls: u64,
    pub bytes: u64,
}

impl TrafficCounter {
    pub fn record(&mut self, bytes: usize) {
        self.calls += 1;
        self.bytes += bytes as u64;
    }
}

impl AddAssign for TrafficCounter {
    fn add_assign(&mut self, other: Self) {
        self.calls += other.calls;
        self.bytes += other.bytes;
    }
}

/// Replication traffic recorded by one connection's manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationTraffic {
    pub properties_sent: TrafficCounter,
    pub properties_received: TrafficCounter,
    pub rpcs_sent: TrafficCounter,
    pub rpcs_received: TrafficCounter,
}

impl AddAssign for ReplicationTraffic {
    fn add_assign(&mut self, other: Self) {
        self.properties_sent += other.properties_sent;
        self.properties_received += other.properties_received;
        self.rpcs_sent += other.rpcs_sent;
        self.rpcs_received += other.rpcs_received;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiplayerStats {
    pub entity_count: usize,
    pub client_connection_count: usize,
    pub server_connection_count: usize,
    pub host_frame_id: u64,
    pub traffic: ReplicationTraffic,
    pub console_commands_replicated: u64,
    pub protocol_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traffic_accumulates() {
        let mut total = ReplicationTraffic::default();
        let mut one = ReplicationTraffic::default();
        one.properties_sent.record(40);
        one.rpcs_received.record(12);
        total += one;
        total += one;
        assert_eq!(total.properties_sent, TrafficCounter { calls: 2, bytes: 80 });
        assert_eq!(total.rpcs_received.calls, 2);
    }
}
