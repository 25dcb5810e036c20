use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use crate::ids::{PacketId, sequence_greater_than};

use super::protocol::Packet;

const ACK_BITS: u32 = 32;
const RECEIVE_WINDOW: usize = 256;

fn ack_covers(ack: u32, ack_bitfield: u32, sequence: u32) -> bool {
    if sequence == ack {
        return true;
    }
    if !sequence_greater_than(ack, sequence) {
        return false;
    }
    let distance = ack.wrapping_sub(sequence);
    distance <= ACK_BITS && ack_bitfield & (1 << (distance - 1)) != 0
}

#[derive(Debug, Clone, Copy)]
struct RttEstimator {
    smoothed: f32,
    variance: f32,
}

impl RttEstimator {
    const GAIN: f32 = 1.0 / 8.0;
    const VARIANCE_GAIN: f32 = 1.0 / 4.0;

    fn sample(&mut self, rtt_ms: f32) {
        let error = rtt_ms - self.smoothed;
        self.variance += Self::VARIANCE_GAIN * (error.abs() - self.variance);
        self.smoothed += Self::GAIN * error;
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            smoothed: 100.0,
            variance: 50.0,
        }
    }
}

/// Reliable payload kept for resending, numbered densely per peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReliablePayload {
    pub id: u64,
    pub packet: Packet,
}

#[derive(Debug, Clone)]
pub struct PendingPacket {
    /// Stable id reported to the session layer; survives resends.
    pub packet_id: PacketId,
    pub sequence: u32,
    pub sent_at: Instant,
    pub reliable: Option<ReliablePayload>,
}

#[derive(Debug)]
pub struct AckTracker {
    in_flight: VecDeque<PendingPacket>,
    capacity: usize,
    rtt: RttEstimator,
}

impl AckTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: VecDeque::with_capacity(capacity),
            capacity,
            rtt: RttEstimator::default(),
        }
    }

    pub fn track_packet(&mut self, sequence: u32, reliable: Option<ReliablePayload>) -> PacketId {
        if self.in_flight.len() >= self.capacity {
            let overflow = self.in_flight.len() + 1 - self.capacity;
            for evicted in self.in_flight.drain(..overflow) {
                if let Some(reliable) = evicted.reliable {
                    log::warn!(
                        "Send window full, giving up on reliable payload {}",
                        reliable.id
                    );
                }
            }
        }

        let packet_id = PacketId(sequence);
        self.in_flight.push_back(PendingPacket {
            packet_id,
            sequence,
            sent_at: Instant::now(),
            reliable,
        });
        packet_id
    }

    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32) -> Vec<PacketId> {
        let now = Instant::now();
        let mut confirmed = Vec::new();

        let rtt = &mut self.rtt;
        self.in_flight.retain(|pending| {
            if !ack_covers(ack, ack_bitfield, pending.sequence) {
                return true;
            }
            rtt.sample(now.duration_since(pending.sent_at).as_secs_f32() * 1000.0);
            confirmed.push(pending.packet_id);
            false
        });
        confirmed
    }

    /// Reliable packets unconfirmed for at least `timeout`. The caller sends
    /// each again and reports the new sequence through [`Self::resequence`].
    pub fn due_for_resend(&self, timeout: Duration) -> Vec<(PacketId, ReliablePayload)> {
        self.in_flight
            .iter()
            .filter(|pending| pending.sent_at.elapsed() >= timeout)
            .filter_map(|pending| {
                let reliable = pending.reliable.as_ref()?;
                Some((pending.packet_id, reliable.clone()))
            })
            .collect()
    }

    pub fn oldest_reliable_id(&self) -> Option<u64> {
        self.in_flight
            .iter()
            .filter_map(|pending| pending.reliable.as_ref().map(|reliable| reliable.id))
            .min()
    }

    pub fn resequence(&mut self, packet_id: PacketId, sequence: u32) {
        let pending = self
            .in_flight
            .iter_mut()
            .find(|pending| pending.packet_id == packet_id);
        if let Some(pending) = pending {
            pending.sequence = sequence;
            pending.sent_at = Instant::now();
        }
    }

    pub fn srtt(&self) -> f32 {
        self.rtt.smoothed
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt.variance
    }

    pub fn unacked_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[derive(Debug)]
pub struct ReceiveTracker {
    newest: Option<u32>,
    history: u32,
    seen: Box<[Option<u32>; RECEIVE_WINDOW]>,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            newest: None,
            history: 0,
            seen: Box::new([None; RECEIVE_WINDOW]),
        }
    }

    /// Returns false for a duplicate or for a sequence too old to tell apart
    /// from one.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        let slot = sequence as usize % RECEIVE_WINDOW;
        if self.seen[slot] == Some(sequence) {
            return false;
        }
        let Some(newest) = self.newest else {
            self.seen[slot] = Some(sequence);
            self.newest = Some(sequence);
            return true;
        };

        if sequence_greater_than(sequence, newest) {
            let advance = sequence.wrapping_sub(newest);
            // The previous newest lands on bit `advance - 1`.
            self.history = self.history.checked_shl(advance).unwrap_or(0)
                | 1u32.checked_shl(advance - 1).unwrap_or(0);
            self.newest = Some(sequence);
        } else {
            let distance = newest.wrapping_sub(sequence);
            if distance as usize >= RECEIVE_WINDOW {
                return false;
            }
            if (1..=ACK_BITS).contains(&distance) {
                self.history |= 1 << (distance - 1);
            }
        }
        self.seen[slot] = Some(sequence);
        true
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.newest.unwrap_or(0), self.history)
    }
}

/// Exact record of delivered reliable ids. Everything at or below
/// `delivered_through` is settled; ids above it are kept individually until
/// the gap below them closes or the sender's floor moves past it.
#[derive(Debug, Default)]
pub struct ReliableReceiver {
    delivered_through: u64,
    delivered: BTreeSet<u64>,
}

impl ReliableReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false only for an id that was already delivered or that the
    /// sender no longer transmits.
    pub fn record_delivered(&mut self, id: u64) -> bool {
        if id <= self.delivered_through || !self.delivered.insert(id) {
            return false;
        }
        self.compact();
        true
    }

    pub fn advance_floor(&mut self, floor: u64) {
        let through = floor.saturating_sub(1);
        if through > self.delivered_through {
            self.delivered_through = through;
            self.delivered = self.delivered.split_off(&(through + 1));
        }
        self.compact();
    }

    pub fn delivered_through(&self) -> u64 {
        self.delivered_through
    }

    pub fn out_of_order_count(&self) -> usize {
        self.delivered.len()
    }

    fn compact(&mut self) {
        while self.delivered.remove(&(self.delivered_through + 1)) {
            self.delivered_through += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_sequences_fill_the_history() {
        let mut tracker = ReceiveTracker::new();
        for sequence in 1..=3 {
            assert!(tracker.record_received(sequence));
        }
        assert_eq!(tracker.ack_data(), (3, 0b11));
    }

    #[test]
    fn late_sequences_backfill_the_history() {
        let mut tracker = ReceiveTracker::new();
        tracker.record_received(3);
        tracker.record_received(1);
        tracker.record_received(2);
        assert_eq!(tracker.ack_data(), (3, 0b11));
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record_received(1));
        assert!(!tracker.record_received(1));
        assert!(tracker.record_received(2));
        assert!(!tracker.record_received(1));
    }

    #[test]
    fn sequences_far_behind_are_rejected() {
        let mut tracker = ReceiveTracker::new();
        tracker.record_received(1000);
        assert!(!tracker.record_received(1000 - RECEIVE_WINDOW as u32));
        assert!(tracker.record_received(999));
    }

    #[test]
    fn history_survives_sequence_wrap() {
        let mut tracker = ReceiveTracker::new();
        tracker.record_received(u32::MAX - 1);
        tracker.record_received(u32::MAX);
        tracker.record_received(1);
        let (ack, bits) = tracker.ack_data();
        assert_eq!(ack, 1);
        // 0 sits between u32::MAX and 1, so u32::MAX is two behind.
        assert_eq!(bits & 0b110, 0b110);
    }

    #[test]
    fn acked_reliable_packets_stop_resending() {
        let mut tracker = AckTracker::new(32);
        let reliable = ReliablePayload {
            id: 1,
            packet: Packet::ReadyForEntityUpdates { ready: true },
        };

        tracker.track_packet(1, Some(reliable.clone()));
        tracker.track_packet(2, None);
        assert_eq!(tracker.oldest_reliable_id(), Some(1));

        let due = tracker.due_for_resend(Duration::ZERO);
        assert_eq!(due, vec![(PacketId(1), reliable)]);

        tracker.resequence(PacketId(1), 3);
        let acked = tracker.process_ack(3, 0b1);
        assert_eq!(acked, vec![PacketId(1), PacketId(2)]);
        assert!(tracker.due_for_resend(Duration::ZERO).is_empty());
        assert_eq!(tracker.unacked_count(), 0);
        assert_eq!(tracker.oldest_reliable_id(), None);
        assert!(tracker.srtt() > 0.0);
    }

    #[test]
    fn full_window_evicts_the_oldest() {
        let mut tracker = AckTracker::new(2);
        tracker.track_packet(1, None);
        tracker.track_packet(2, None);
        tracker.track_packet(3, None);
        assert_eq!(tracker.unacked_count(), 2);
        assert_eq!(tracker.process_ack(3, 0b11), vec![PacketId(2), PacketId(3)]);
    }

    #[test]
    fn late_resend_is_delivered_after_newer_reliables() {
        let mut frames = ReceiveTracker::new();
        let mut reliables = ReliableReceiver::new();

        assert!(frames.record_received(300));
        assert!(reliables.record_delivered(300));

        // Resend of reliable 10 arrives in a fresh frame.
        assert!(frames.record_received(301));
        assert!(reliables.record_delivered(10));
        assert!(!reliables.record_delivered(10));
        assert!(!reliables.record_delivered(300));
    }

    #[test]
    fn in_order_reliables_collapse_into_the_watermark() {
        let mut reliables = ReliableReceiver::new();
        assert!(reliables.record_delivered(2));
        assert_eq!(reliables.delivered_through(), 0);
        assert!(reliables.record_delivered(1));
        assert_eq!(reliables.delivered_through(), 2);
        assert_eq!(reliables.out_of_order_count(), 0);
    }

    #[test]
    fn sender_floor_settles_abandoned_ids() {
        let mut reliables = ReliableReceiver::new();
        assert!(reliables.record_delivered(5));
        assert!(reliables.record_delivered(9));

        reliables.advance_floor(6);
        assert_eq!(reliables.delivered_through(), 5);
        assert_eq!(reliables.out_of_order_count(), 1);
        assert!(!reliables.record_delivered(3));
        assert!(reliables.record_delivered(7));
    }
}
