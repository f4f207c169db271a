//! # Reliability Engine
//!
//! Sequencing, acknowledgment and retransmission for every channel of a
//! connection.
//!
//! ## Design
//!
//! - Per-channel sequence counters; sequences are u32 with wrapping
//!   comparison
//! - A 32-bit ack bitfield rides every outgoing header, acknowledging a
//!   burst without one ack per packet
//! - Reliable packets are snapshotted and resent at a fixed interval until
//!   acked or the resend cap is hit; the cap is fatal to the channel only
//! - RTT/jitter via exponential smoothing, TCP-estimator style
//! - Ordered channels buffer out-of-order arrivals and release contiguous
//!   runs; a head-of-line gap is skipped once it outlives the horizon past
//!   which the sender itself would have given up

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::error::DeliveryFailure;
use crate::protocol::{ChannelId, PacketFlags, PacketType, SequenceNumber};

/// Width of the ack bitfield window.
pub const ACK_WINDOW: u32 = 32;

/// Smoothing factor for the RTT mean (1/8, TCP-style).
const RTT_ALPHA: f32 = 0.125;

/// Smoothing factor for the RTT variation (1/4, TCP-style).
const RTT_BETA: f32 = 0.25;

/// Exponentially-smoothed round-trip estimate.
#[derive(Clone, Copy, Debug, Default)]
pub struct RttEstimator {
    smoothed_ms: f32,
    variation_ms: f32,
    has_sample: bool,
}

impl RttEstimator {
    /// Feeds one round-trip sample in milliseconds.
    pub fn observe(&mut self, sample_ms: f32) {
        if self.has_sample {
            let deviation = (sample_ms - self.smoothed_ms).abs();
            self.variation_ms += RTT_BETA * (deviation - self.variation_ms);
            self.smoothed_ms += RTT_ALPHA * (sample_ms - self.smoothed_ms);
        } else {
            self.smoothed_ms = sample_ms;
            self.variation_ms = sample_ms / 2.0;
            self.has_sample = true;
        }
    }

    /// Current smoothed round-trip time in milliseconds.
    #[inline]
    #[must_use]
    pub const fn smoothed_ms(&self) -> f32 {
        self.smoothed_ms
    }

    /// Current jitter (RTT variation) in milliseconds.
    #[inline]
    #[must_use]
    pub const fn jitter_ms(&self) -> f32 {
        self.variation_ms
    }

    /// Returns true once at least one sample has been observed.
    #[inline]
    #[must_use]
    pub const fn has_sample(&self) -> bool {
        self.has_sample
    }
}

/// Bookkeeping for one sent reliable packet awaiting acknowledgment.
#[derive(Clone, Debug)]
pub struct ReliableRecord {
    /// Packet type of the snapshot.
    pub packet_type: PacketType,
    /// Flags of the snapshot.
    pub flags: PacketFlags,
    /// Channel the packet went out on.
    pub channel: ChannelId,
    /// Assigned sequence number.
    pub sequence: SequenceNumber,
    /// Wire payload snapshot (post compression/cipher), resent verbatim.
    pub payload: Vec<u8>,
    /// First send time.
    pub sent_at: Instant,
    /// When the next resend is due.
    pub next_resend: Instant,
    /// Resends performed so far.
    pub resend_count: u32,
}

/// Verdict for an incoming sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// First sighting; process the packet.
    Accept,
    /// Already received inside the ack window.
    Duplicate,
    /// Older than the ack window; treated as a stale duplicate.
    Stale,
}

/// Delivery counters, exposed read-only and reset on request.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtocolStats {
    /// Logical packets registered for sending.
    pub packets_sent: u64,
    /// Logical packets accepted from the wire.
    pub packets_received: u64,
    /// Reliable retransmissions performed.
    pub packets_resent: u64,
    /// Duplicates dropped inside the ack window.
    pub duplicates_dropped: u64,
    /// Stale packets dropped outside the ack window.
    pub stale_dropped: u64,
    /// Reliable records retired by acknowledgment.
    pub packets_acked: u64,
    /// Reliable packets abandoned at the resend cap.
    pub delivery_failures: u64,
    /// Ordered-channel gaps skipped after the wait horizon.
    pub ordered_skipped: u64,
    /// RTT samples fed to the estimator.
    pub rtt_samples: u64,
}

/// A packet buffered on an ordered channel, waiting for its predecessors.
#[derive(Clone, Debug)]
struct OrderedEntry {
    packet_type: PacketType,
    flags: PacketFlags,
    payload: Vec<u8>,
}

/// Per-channel reliability state.
#[derive(Debug)]
struct ChannelState {
    next_send_seq: SequenceNumber,
    last_received_seq: SequenceNumber,
    received_any: bool,
    ack_bitfield: u32,
    /// Ack state changed since the last outgoing packet on this channel.
    ack_dirty: bool,
    outstanding: HashMap<SequenceNumber, ReliableRecord>,
    next_expected_seq: SequenceNumber,
    pending_ordered: BTreeMap<SequenceNumber, OrderedEntry>,
    gap_since: Option<Instant>,
    degraded: bool,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            next_send_seq: 0,
            // Sentinel: a pristine channel must not advertise sequence 0
            // as received.
            last_received_seq: SequenceNumber::MAX,
            received_any: false,
            ack_bitfield: 0,
            ack_dirty: false,
            outstanding: HashMap::new(),
            next_expected_seq: 0,
            pending_ordered: BTreeMap::new(),
            gap_since: None,
            degraded: false,
        }
    }
}

/// Returns true if `a` is newer than `b` under wrapping arithmetic.
#[inline]
const fn seq_newer(a: SequenceNumber, b: SequenceNumber) -> bool {
    a.wrapping_sub(b) < u32::MAX / 2 && a != b
}

/// Reliability engine for one connection.
pub struct ReliabilityEngine {
    channels: HashMap<ChannelId, ChannelState>,
    rtt: RttEstimator,
    resend_interval: Duration,
    max_resends: u32,
    stats: ProtocolStats,
}

impl ReliabilityEngine {
    /// Creates an engine with the given resend policy.
    #[must_use]
    pub fn new(resend_interval: Duration, max_resends: u32) -> Self {
        Self {
            channels: HashMap::new(),
            rtt: RttEstimator::default(),
            resend_interval,
            max_resends,
            stats: ProtocolStats::default(),
        }
    }

    fn channel(&mut self, id: ChannelId) -> &mut ChannelState {
        self.channels.entry(id).or_default()
    }

    /// Assigns the next sequence number for an outgoing packet and, when
    /// the RELIABLE flag is set, snapshots it for retransmission.
    ///
    /// The payload must be the final wire payload (after compression and
    /// cipher) so resends are byte-identical.
    pub fn register_send(
        &mut self,
        channel: ChannelId,
        packet_type: PacketType,
        flags: PacketFlags,
        payload: &[u8],
        now: Instant,
    ) -> SequenceNumber {
        let interval = self.resend_interval;
        let state = self.channel(channel);
        let sequence = state.next_send_seq;
        state.next_send_seq = state.next_send_seq.wrapping_add(1);

        if flags.contains(PacketFlags::RELIABLE) {
            state.outstanding.insert(
                sequence,
                ReliableRecord {
                    packet_type,
                    flags,
                    channel,
                    sequence,
                    payload: payload.to_vec(),
                    sent_at: now,
                    next_resend: now + interval,
                    resend_count: 0,
                },
            );
        }
        self.stats.packets_sent += 1;
        sequence
    }

    /// Current ack state for outgoing headers on `channel`.
    ///
    /// Marks the channel's ack state as flushed; a bare ack packet is only
    /// owed while fresh receives have not ridden out on any header.
    pub fn ack_state(&mut self, channel: ChannelId) -> (SequenceNumber, u32) {
        self.channels.get_mut(&channel).map_or(
            (SequenceNumber::MAX, 0),
            |s| {
                s.ack_dirty = false;
                (s.last_received_seq, s.ack_bitfield)
            },
        )
    }

    /// Channels whose ack state changed since it last rode an outgoing
    /// header; each is owed a bare ack packet.
    #[must_use]
    pub fn dirty_channels(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|(_, s)| s.ack_dirty)
            .map(|(&c, _)| c)
            .collect()
    }

    /// Updates receive-side bookkeeping for an incoming sequence.
    ///
    /// Returns how the packet should be treated. Stale and duplicate
    /// packets must be dropped by the caller without dispatch and without
    /// generating further effects.
    pub fn on_receive(
        &mut self,
        channel: ChannelId,
        sequence: SequenceNumber,
    ) -> Disposition {
        let state = self.channel(channel);

        if !state.received_any {
            state.received_any = true;
            state.last_received_seq = sequence;
            state.ack_bitfield = 0;
            state.ack_dirty = true;
            self.stats.packets_received += 1;
            return Disposition::Accept;
        }

        if sequence == state.last_received_seq {
            // A duplicate usually means our ack was lost; re-offer it.
            state.ack_dirty = true;
            self.stats.duplicates_dropped += 1;
            return Disposition::Duplicate;
        }

        if seq_newer(sequence, state.last_received_seq) {
            let diff = sequence.wrapping_sub(state.last_received_seq);
            state.ack_bitfield = if diff >= ACK_WINDOW {
                0
            } else {
                state.ack_bitfield.checked_shl(diff).unwrap_or(0)
            };
            if diff <= ACK_WINDOW {
                // The previous head is now `diff` behind the new one.
                state.ack_bitfield |= 1 << (diff - 1);
            }
            state.last_received_seq = sequence;
            state.ack_dirty = true;
            self.stats.packets_received += 1;
            return Disposition::Accept;
        }

        let back = state.last_received_seq.wrapping_sub(sequence);
        if back > ACK_WINDOW {
            self.stats.stale_dropped += 1;
            return Disposition::Stale;
        }
        let bit = 1u32 << (back - 1);
        if state.ack_bitfield & bit != 0 {
            state.ack_dirty = true;
            self.stats.duplicates_dropped += 1;
            return Disposition::Duplicate;
        }
        state.ack_bitfield |= bit;
        state.ack_dirty = true;
        self.stats.packets_received += 1;
        Disposition::Accept
    }

    /// Applies the ack state carried by an incoming header, retiring every
    /// covered reliable record on that channel.
    ///
    /// Returns the sequences retired by this update.
    pub fn process_acks(
        &mut self,
        channel: ChannelId,
        ack: SequenceNumber,
        ack_bitfield: u32,
        now: Instant,
    ) -> Vec<SequenceNumber> {
        let mut retired = Vec::new();
        let Some(state) = self.channels.get_mut(&channel) else {
            return retired;
        };
        if state.outstanding.is_empty() {
            return retired;
        }

        let mut retire = |state: &mut ChannelState, seq: SequenceNumber| {
            if let Some(record) = state.outstanding.remove(&seq) {
                // Retransmitted records do not contribute RTT samples.
                if record.resend_count == 0 {
                    let sample = now.duration_since(record.sent_at).as_secs_f32() * 1000.0;
                    self.rtt.observe(sample);
                    self.stats.rtt_samples += 1;
                }
                self.stats.packets_acked += 1;
                retired.push(seq);
            }
        };

        retire(state, ack);
        for bit in 0..ACK_WINDOW {
            if ack_bitfield & (1 << bit) != 0 {
                retire(state, ack.wrapping_sub(bit + 1));
            }
        }
        retired
    }

    /// Collects records due for retransmission and delivery failures.
    ///
    /// Each returned record has already been rescheduled; records past the
    /// resend cap are removed, counted, and reported as failures that mark
    /// the channel degraded.
    pub fn due_resends(&mut self, now: Instant) -> (Vec<ReliableRecord>, Vec<DeliveryFailure>) {
        let mut resends = Vec::new();
        let mut failures = Vec::new();

        for (&channel, state) in &mut self.channels {
            let mut exhausted = Vec::new();
            for record in state.outstanding.values_mut() {
                if now < record.next_resend {
                    continue;
                }
                if record.resend_count >= self.max_resends {
                    exhausted.push(record.sequence);
                    continue;
                }
                record.resend_count += 1;
                record.next_resend = now + self.resend_interval;
                self.stats.packets_resent += 1;
                resends.push(record.clone());
            }
            for sequence in exhausted {
                state.outstanding.remove(&sequence);
                state.degraded = true;
                self.stats.delivery_failures += 1;
                tracing::warn!(channel, sequence, "reliable delivery failed, channel degraded");
                failures.push(DeliveryFailure {
                    channel,
                    sequence,
                    resends: self.max_resends,
                });
            }
        }
        (resends, failures)
    }

    /// Runs a packet through ordered-channel buffering.
    ///
    /// Returns the packets releasable to the application in order. A
    /// contiguous arrival releases itself plus any buffered successors;
    /// anything else is buffered and an empty vec is returned.
    pub fn release_ordered(
        &mut self,
        channel: ChannelId,
        sequence: SequenceNumber,
        packet_type: PacketType,
        flags: PacketFlags,
        payload: Vec<u8>,
        now: Instant,
    ) -> Vec<(PacketType, PacketFlags, Vec<u8>)> {
        let state = self.channel(channel);

        if sequence != state.next_expected_seq && !seq_newer(sequence, state.next_expected_seq) {
            // Predecessor of something already delivered or skipped.
            return Vec::new();
        }

        if sequence != state.next_expected_seq {
            state.pending_ordered.insert(
                sequence,
                OrderedEntry {
                    packet_type,
                    flags,
                    payload,
                },
            );
            if state.gap_since.is_none() {
                state.gap_since = Some(now);
            }
            return Vec::new();
        }

        let mut released = vec![(packet_type, flags, payload)];
        state.next_expected_seq = state.next_expected_seq.wrapping_add(1);
        while let Some(entry) = state.pending_ordered.remove(&state.next_expected_seq) {
            released.push((entry.packet_type, entry.flags, entry.payload));
            state.next_expected_seq = state.next_expected_seq.wrapping_add(1);
        }
        state.gap_since = if state.pending_ordered.is_empty() {
            None
        } else {
            Some(now)
        };
        released
    }

    /// Skips ordered-channel gaps that have outlived the wait horizon.
    ///
    /// The horizon is `max_resends * resend_interval`: past it the sender
    /// has already declared delivery failure, so the missing packet cannot
    /// arrive. Returns packets released by skipping.
    pub fn poll_ordered(&mut self, now: Instant) -> Vec<(ChannelId, PacketType, PacketFlags, Vec<u8>)> {
        let horizon = self.resend_interval * self.max_resends;
        let mut released = Vec::new();

        for (&channel, state) in &mut self.channels {
            let Some(gap_since) = state.gap_since else {
                continue;
            };
            if now.duration_since(gap_since) < horizon {
                continue;
            }
            let Some((&lowest, _)) = state.pending_ordered.iter().next() else {
                state.gap_since = None;
                continue;
            };

            let skipped = lowest.wrapping_sub(state.next_expected_seq);
            self.stats.ordered_skipped += u64::from(skipped);
            tracing::debug!(channel, skipped, "skipping ordered gap past wait horizon");

            state.next_expected_seq = lowest;
            while let Some(entry) = state.pending_ordered.remove(&state.next_expected_seq) {
                released.push((channel, entry.packet_type, entry.flags, entry.payload));
                state.next_expected_seq = state.next_expected_seq.wrapping_add(1);
            }
            state.gap_since = if state.pending_ordered.is_empty() {
                None
            } else {
                Some(now)
            };
        }
        released
    }

    /// Returns true if a delivery failure has degraded the channel.
    #[must_use]
    pub fn is_degraded(&self, channel: ChannelId) -> bool {
        self.channels.get(&channel).is_some_and(|s| s.degraded)
    }

    /// Number of reliable records still awaiting acknowledgment.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.channels.values().map(|s| s.outstanding.len()).sum()
    }

    /// Discards every outstanding reliable record.
    ///
    /// Used when a session dies; the records can no longer be delivered.
    pub fn abandon_all(&mut self) {
        for state in self.channels.values_mut() {
            state.outstanding.clear();
        }
    }

    /// Makes every outstanding record due immediately.
    ///
    /// Called when a link comes back after reconnection, so in-flight
    /// reliable traffic resumes without waiting out stale resend timers.
    pub fn reschedule_all(&mut self, now: Instant) {
        for state in self.channels.values_mut() {
            for record in state.outstanding.values_mut() {
                record.next_resend = now;
            }
        }
    }

    /// Round-trip estimator, shared by every channel of the connection.
    #[must_use]
    pub const fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Feeds an externally measured round-trip sample (heartbeat echo).
    pub fn observe_rtt(&mut self, sample_ms: f32) {
        self.rtt.observe(sample_ms);
        self.stats.rtt_samples += 1;
    }

    /// Current counters.
    #[must_use]
    pub const fn stats(&self) -> &ProtocolStats {
        &self.stats
    }

    /// Resets counters to zero.
    pub fn reset_stats(&mut self) {
        self.stats = ProtocolStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ReliabilityEngine {
        ReliabilityEngine::new(Duration::from_millis(100), 5)
    }

    fn reliable_flags() -> PacketFlags {
        PacketFlags::RELIABLE
    }

    #[test]
    fn test_sequence_assignment() {
        let mut eng = engine();
        let now = Instant::now();
        let a = eng.register_send(0, PacketType(20), reliable_flags(), b"a", now);
        let b = eng.register_send(0, PacketType(20), reliable_flags(), b"b", now);
        let other = eng.register_send(1, PacketType(20), reliable_flags(), b"c", now);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        // Channels count independently.
        assert_eq!(other, 0);
        assert_eq!(eng.outstanding(), 3);
    }

    #[test]
    fn test_ack_bitfield_progression() {
        let mut eng = engine();
        assert_eq!(eng.on_receive(0, 0), Disposition::Accept);
        assert_eq!(eng.on_receive(0, 1), Disposition::Accept);
        assert_eq!(eng.on_receive(0, 2), Disposition::Accept);

        let (ack, bits) = eng.ack_state(0);
        assert_eq!(ack, 2);
        // Sequences 1 and 0 sit one and two behind the head.
        assert_eq!(bits & 0b11, 0b11);
    }

    #[test]
    fn test_out_of_order_receive_fills_bitfield() {
        let mut eng = engine();
        assert_eq!(eng.on_receive(0, 5), Disposition::Accept);
        assert_eq!(eng.on_receive(0, 3), Disposition::Accept);

        let (ack, bits) = eng.ack_state(0);
        assert_eq!(ack, 5);
        assert_ne!(bits & (1 << 1), 0);
    }

    #[test]
    fn test_duplicate_and_stale_detection() {
        let mut eng = engine();
        assert_eq!(eng.on_receive(0, 100), Disposition::Accept);
        assert_eq!(eng.on_receive(0, 100), Disposition::Duplicate);
        assert_eq!(eng.on_receive(0, 99), Disposition::Accept);
        assert_eq!(eng.on_receive(0, 99), Disposition::Duplicate);
        // 100 - 33 is outside the 32-wide window.
        assert_eq!(eng.on_receive(0, 67), Disposition::Stale);
        assert_eq!(eng.stats().stale_dropped, 1);
        assert_eq!(eng.stats().duplicates_dropped, 2);
    }

    #[test]
    fn test_ack_retires_records() {
        let mut eng = engine();
        let now = Instant::now();
        for i in 0..3u8 {
            eng.register_send(0, PacketType(20), reliable_flags(), &[i], now);
        }
        assert_eq!(eng.outstanding(), 3);

        // Peer acks sequence 2 with 0 and 1 covered by the bitfield.
        let retired = eng.process_acks(0, 2, 0b11, now + Duration::from_millis(30));
        assert_eq!(retired.len(), 3);
        assert_eq!(eng.outstanding(), 0);
        assert_eq!(eng.stats().packets_acked, 3);

        // Acking again retires nothing: removal happens exactly once.
        let retired = eng.process_acks(0, 2, 0b11, now + Duration::from_millis(40));
        assert!(retired.is_empty());
    }

    #[test]
    fn test_no_resend_after_ack() {
        let mut eng = engine();
        let now = Instant::now();
        eng.register_send(0, PacketType(20), reliable_flags(), b"x", now);
        eng.process_acks(0, 0, 0, now + Duration::from_millis(10));

        let (resends, failures) = eng.due_resends(now + Duration::from_secs(10));
        assert!(resends.is_empty());
        assert!(failures.is_empty());
    }

    #[test]
    fn test_resend_schedule_and_cap() {
        let mut eng = engine();
        let start = Instant::now();
        eng.register_send(0, PacketType(20), reliable_flags(), b"x", start);

        // Not due yet.
        let (resends, _) = eng.due_resends(start + Duration::from_millis(50));
        assert!(resends.is_empty());

        // Five resends at fixed 100ms intervals.
        let mut t = start;
        for _ in 0..5 {
            t += Duration::from_millis(100);
            let (resends, failures) = eng.due_resends(t);
            assert_eq!(resends.len(), 1);
            assert!(failures.is_empty());
        }

        // The sixth poll reports failure and degrades the channel.
        t += Duration::from_millis(100);
        let (resends, failures) = eng.due_resends(t);
        assert!(resends.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].channel, 0);
        assert_eq!(failures[0].resends, 5);
        assert!(eng.is_degraded(0));
        assert_eq!(eng.stats().packets_resent, 5);
        assert_eq!(eng.stats().delivery_failures, 1);
    }

    #[test]
    fn test_rtt_estimator_smoothing() {
        let mut rtt = RttEstimator::default();
        rtt.observe(100.0);
        assert!((rtt.smoothed_ms() - 100.0).abs() < f32::EPSILON);

        rtt.observe(200.0);
        // 100 + (200-100)/8 = 112.5
        assert!((rtt.smoothed_ms() - 112.5).abs() < 0.01);
        assert!(rtt.jitter_ms() > 0.0);
    }

    #[test]
    fn test_retransmitted_records_skip_rtt() {
        let mut eng = engine();
        let start = Instant::now();
        eng.register_send(0, PacketType(20), reliable_flags(), b"x", start);
        eng.due_resends(start + Duration::from_millis(100));
        eng.process_acks(0, 0, 0, start + Duration::from_millis(150));
        assert_eq!(eng.stats().rtt_samples, 0);
        assert_eq!(eng.stats().packets_acked, 1);
    }

    #[test]
    fn test_ordered_release_contiguous() {
        let mut eng = engine();
        let now = Instant::now();
        let flags = PacketFlags::RELIABLE.with(PacketFlags::ORDERED);

        // Sequence 1 arrives before 0: buffered.
        let released = eng.release_ordered(0, 1, PacketType(20), flags, b"b".to_vec(), now);
        assert!(released.is_empty());

        // Sequence 0 releases both, in order.
        let released = eng.release_ordered(0, 0, PacketType(20), flags, b"a".to_vec(), now);
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].2, b"a");
        assert_eq!(released[1].2, b"b");
    }

    #[test]
    fn test_ordered_gap_skip() {
        let mut eng = engine();
        let start = Instant::now();
        let flags = PacketFlags::ORDERED;

        // 0 delivered; 2 and 3 stuck behind missing 1.
        assert_eq!(
            eng.release_ordered(0, 0, PacketType(20), flags, b"a".to_vec(), start).len(),
            1
        );
        assert!(eng.release_ordered(0, 2, PacketType(20), flags, b"c".to_vec(), start).is_empty());
        assert!(eng.release_ordered(0, 3, PacketType(20), flags, b"d".to_vec(), start).is_empty());

        // Before the horizon nothing moves.
        assert!(eng.poll_ordered(start + Duration::from_millis(100)).is_empty());

        // Past max_resends * resend_interval the gap is skipped.
        let released = eng.poll_ordered(start + Duration::from_millis(600));
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].3, b"c");
        assert_eq!(released[1].3, b"d");
        assert_eq!(eng.stats().ordered_skipped, 1);
    }

    #[test]
    fn test_pristine_channel_acks_nothing() {
        let mut eng = engine();
        let (ack, bits) = eng.ack_state(9);
        assert_eq!(ack, u32::MAX);
        assert_eq!(bits, 0);
        // The sentinel must not retire a real record on the peer.
        let now = Instant::now();
        eng.register_send(9, PacketType(20), PacketFlags::RELIABLE, b"x", now);
        let retired = eng.process_acks(9, u32::MAX, 0, now);
        assert!(retired.is_empty());
        assert_eq!(eng.outstanding(), 1);
    }

    #[test]
    fn test_dirty_channels_track_unflushed_acks() {
        let mut eng = engine();
        assert!(eng.dirty_channels().is_empty());

        eng.on_receive(3, 0);
        assert_eq!(eng.dirty_channels(), vec![3]);

        // Reading the ack state for an outgoing header flushes it.
        let _ = eng.ack_state(3);
        assert!(eng.dirty_channels().is_empty());

        // A duplicate re-arms the bare ack.
        eng.on_receive(3, 0);
        assert_eq!(eng.dirty_channels(), vec![3]);
    }

    #[test]
    fn test_abandon_all() {
        let mut eng = engine();
        let now = Instant::now();
        eng.register_send(0, PacketType(20), reliable_flags(), b"x", now);
        eng.register_send(1, PacketType(20), reliable_flags(), b"y", now);
        eng.abandon_all();
        assert_eq!(eng.outstanding(), 0);
    }

    #[test]
    fn test_wrapping_sequences() {
        let mut eng = engine();
        assert_eq!(eng.on_receive(0, u32::MAX - 1), Disposition::Accept);
        assert_eq!(eng.on_receive(0, u32::MAX), Disposition::Accept);
        // Wraps to zero: still newer.
        assert_eq!(eng.on_receive(0, 0), Disposition::Accept);
        let (ack, bits) = eng.ack_state(0);
        assert_eq!(ack, 0);
        assert_eq!(bits & 0b11, 0b11);
    }
}
