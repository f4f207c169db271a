//! # Traffic Shaper
//!
//! Everything that decides *whether*, *when* and *in what shape* a packet
//! leaves the endpoint.
//!
//! ## Features, each independently toggleable
//!
//! - **Batching**: small unreliable packets accumulate until a size or
//!   delay bound, then flush as one send
//! - **Priority reordering**: higher-priority entries lead the batch so
//!   they survive partial loss preferentially
//! - **Delta encoding**: entity updates ship only changed byte ranges
//!   against the last state the peer confirmed, falling back to a full
//!   snapshot when that is cheaper or no base exists
//! - **Interest management**: updates for entities outside the configured
//!   sphere are dropped before they cost bandwidth
//! - **Frequency control**: per-entity minimum update spacing, newer
//!   updates replace queued ones (latest wins)
//! - **Bandwidth adaptation**: a periodic check scales the shared
//!   `quality_scale_factor` that upstream callers read to shed volume
//!   under congestion

use std::collections::HashMap;
use std::time::{Duration, Instant};

use emberlink_core::{EntityId, Position};

use crate::protocol::{ChannelId, PacketFlags, PacketType};

/// Spherical area of interest for one connection.
#[derive(Clone, Copy, Debug)]
pub struct InterestArea {
    /// Center of the sphere in world space.
    pub center: Position,
    /// Radius in world units.
    pub radius: f32,
}

impl InterestArea {
    /// Returns true if a position falls inside the sphere.
    #[inline]
    #[must_use]
    pub fn contains(&self, position: Position) -> bool {
        self.center.distance_squared(position) <= self.radius * self.radius
    }
}

/// Shaper feature switches and parameters.
#[derive(Clone, Debug)]
pub struct ShaperConfig {
    /// Accumulate small unreliable packets into batches.
    pub enable_batching: bool,
    /// Delta-encode entity updates against confirmed state.
    pub enable_delta: bool,
    /// Enforce per-entity minimum update spacing.
    pub enable_frequency_control: bool,
    /// Scale traffic volume against the bandwidth target.
    pub enable_bandwidth_adaptation: bool,
    /// Batch flush threshold in payload bytes.
    pub batch_size_limit: usize,
    /// Batch flush deadline.
    pub max_batch_delay: Duration,
    /// Bandwidth target in kilobits per second; zero derives one
    /// automatically from observed throughput.
    pub bandwidth_target_kbps: u32,
    /// Number of distinct priority levels.
    pub priority_levels: u8,
    /// Minimum spacing between updates of one entity.
    pub min_entity_update_interval: Duration,
    /// Interest sphere; `None` disables filtering.
    pub interest_area: Option<InterestArea>,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            enable_batching: true,
            enable_delta: true,
            enable_frequency_control: true,
            enable_bandwidth_adaptation: true,
            batch_size_limit: 1024,
            max_batch_delay: Duration::from_millis(50),
            bandwidth_target_kbps: 0,
            priority_levels: 4,
            min_entity_update_interval: Duration::from_millis(50),
            interest_area: None,
        }
    }
}

/// Entity context attached to an update.
#[derive(Clone, Copy, Debug)]
pub struct EntityContext {
    /// Entity being described.
    pub id: EntityId,
    /// Where the entity currently is, for interest filtering.
    pub position: Position,
}

/// A packet handed to the shaper by the send API.
#[derive(Clone, Debug)]
pub struct OutboundPacket {
    /// Application packet type.
    pub packet_type: PacketType,
    /// Logical channel.
    pub channel: ChannelId,
    /// Delivery flags requested by the caller.
    pub flags: PacketFlags,
    /// Priority level, higher is more important.
    pub priority: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Entity context for tracked updates.
    pub entity: Option<EntityContext>,
}

/// A packet the shaper has released toward the compressor.
#[derive(Clone, Debug)]
pub struct ShapedPacket {
    /// Application packet type.
    pub packet_type: PacketType,
    /// Logical channel.
    pub channel: ChannelId,
    /// Delivery flags, including priority markers.
    pub flags: PacketFlags,
    /// Payload bytes (possibly a batch or delta envelope).
    pub payload: Vec<u8>,
    /// When set, the sender should report this entity state version as
    /// confirmed once the packet's sequence is acknowledged.
    pub confirm: Option<(EntityId, u16)>,
}

/// Shaping counters, exposed read-only and reset on request.
#[derive(Clone, Copy, Debug, Default)]
pub struct OptimizationStats {
    /// Packets folded into batches.
    pub packets_batched: u64,
    /// Batches flushed to the wire.
    pub batches_flushed: u64,
    /// Entity updates shipped as deltas.
    pub deltas_sent: u64,
    /// Entity updates shipped as full snapshots.
    pub full_states_sent: u64,
    /// Bytes saved by delta encoding against full snapshots.
    pub bytes_saved_by_delta: u64,
    /// Updates dropped by interest filtering.
    pub packets_filtered: u64,
    /// Updates replaced by a newer one before sending.
    pub updates_coalesced: u64,
    /// Times the quality scale factor was adjusted.
    pub scale_adjustments: u64,
}

/// Marker byte: payload is a full entity snapshot.
const STATE_FULL: u8 = 0;

/// Marker byte: payload is a delta against a confirmed base version.
const STATE_DELTA: u8 = 1;

/// Interval between bandwidth adaptation checks.
const ADAPT_INTERVAL: Duration = Duration::from_secs(1);

/// Floor of the quality scale factor.
const MIN_QUALITY_SCALE: f32 = 0.25;

/// How many in-flight state versions to remember per entity.
const VERSION_WINDOW: usize = 32;

/// Per-entity sender-side tracking.
#[derive(Debug, Default)]
struct EntityTrack {
    /// Last state version the peer confirmed, with its bytes.
    confirmed: Option<(u16, Vec<u8>)>,
    /// States sent but not yet confirmed, by version.
    in_flight: HashMap<u16, Vec<u8>>,
    /// Next version to assign.
    next_version: u16,
    /// Earliest time the next update may go out.
    next_allowed: Option<Instant>,
    /// Update coalesced while waiting for the interval.
    pending: Option<OutboundPacket>,
}

/// One channel's accumulating batch.
#[derive(Debug, Default)]
struct BatchAccum {
    entries: Vec<(u8, PacketType, Vec<u8>)>,
    bytes: usize,
    deadline: Option<Instant>,
}

/// The traffic shaper for one connection.
pub struct TrafficShaper {
    config: ShaperConfig,
    batches: HashMap<ChannelId, BatchAccum>,
    entities: HashMap<EntityId, EntityTrack>,
    ready: Vec<ShapedPacket>,
    quality_scale: f32,
    window_bytes: u64,
    window_started: Option<Instant>,
    auto_target_kbps: f32,
    stats: OptimizationStats,
}

impl TrafficShaper {
    /// Creates a shaper with the given feature configuration.
    #[must_use]
    pub fn new(config: ShaperConfig) -> Self {
        Self {
            config,
            batches: HashMap::new(),
            entities: HashMap::new(),
            ready: Vec::new(),
            quality_scale: 1.0,
            window_bytes: 0,
            window_started: None,
            auto_target_kbps: 0.0,
            stats: OptimizationStats::default(),
        }
    }

    /// Updates the interest sphere (e.g. the player moved).
    pub fn set_interest_area(&mut self, area: Option<InterestArea>) {
        self.config.interest_area = area;
    }

    /// Shared quality scale factor in `0.25..=1.0`.
    ///
    /// Upstream callers read this to cut update volume under congestion
    /// and relax it as conditions improve.
    #[inline]
    #[must_use]
    pub const fn quality_scale_factor(&self) -> f32 {
        self.quality_scale
    }

    /// Accepts a packet from the send API.
    ///
    /// Returns false when the packet was dropped by interest filtering;
    /// queued, coalesced and immediately releasable packets all return
    /// true. Call [`TrafficShaper::poll`] to collect releasable packets.
    pub fn enqueue(&mut self, packet: OutboundPacket, now: Instant) -> bool {
        if let Some(entity) = packet.entity {
            if let Some(area) = &self.config.interest_area {
                if !area.contains(entity.position) {
                    self.stats.packets_filtered += 1;
                    return false;
                }
            }
            self.enqueue_entity(packet, entity, now);
            return true;
        }

        let is_batchable = self.config.enable_batching
            && !packet.flags.contains(PacketFlags::RELIABLE)
            && !packet.flags.contains(PacketFlags::ORDERED)
            && !self.is_critical(packet.priority)
            && packet.payload.len() < self.config.batch_size_limit;

        if is_batchable {
            self.push_to_batch(packet, now);
        } else {
            let shaped = self.finalize_plain(packet);
            self.ready.push(shaped);
        }
        true
    }

    /// Collects every packet that is due to leave.
    ///
    /// Flushes expired batches, releases entity updates whose spacing
    /// interval has elapsed, and runs the periodic bandwidth check.
    pub fn poll(&mut self, now: Instant) -> Vec<ShapedPacket> {
        self.flush_due_batches(now);
        self.release_due_entities(now);
        if self.config.enable_bandwidth_adaptation {
            self.adapt_bandwidth(now);
        }
        std::mem::take(&mut self.ready)
    }

    /// Forces all queued and pending-batch packets out.
    ///
    /// With `immediate` set, frequency-control holds are bypassed as well;
    /// used on shutdown or explicit request.
    pub fn flush_queue(&mut self, immediate: bool, now: Instant) -> Vec<ShapedPacket> {
        let channels: Vec<ChannelId> = self.batches.keys().copied().collect();
        for channel in channels {
            self.flush_batch(channel);
        }
        if immediate {
            let ids: Vec<EntityId> = self
                .entities
                .iter()
                .filter(|(_, t)| t.pending.is_some())
                .map(|(&id, _)| id)
                .collect();
            for id in ids {
                if let Some(pending) = self.entities.get_mut(&id).and_then(|t| t.pending.take()) {
                    if let Some(entity) = pending.entity {
                        self.emit_entity(pending, entity, now);
                    }
                }
            }
        }
        std::mem::take(&mut self.ready)
    }

    /// Records wire bytes actually sent, feeding bandwidth adaptation.
    pub fn record_wire_bytes(&mut self, bytes: usize) {
        self.window_bytes += bytes as u64;
    }

    /// Marks an entity state version as confirmed by the peer.
    ///
    /// Future deltas are encoded against this state.
    pub fn confirm_entity(&mut self, id: EntityId, version: u16) {
        if let Some(track) = self.entities.get_mut(&id) {
            if let Some(state) = track.in_flight.remove(&version) {
                track.confirmed = Some((version, state));
                // Anything older can no longer become the newest base.
                track
                    .in_flight
                    .retain(|&v, _| v.wrapping_sub(version) < u16::MAX / 2 && v != version);
            }
        }
    }

    /// Current counters.
    #[must_use]
    pub const fn stats(&self) -> &OptimizationStats {
        &self.stats
    }

    /// Resets counters to zero.
    pub fn reset_stats(&mut self) {
        self.stats = OptimizationStats::default();
    }

    fn is_critical(&self, priority: u8) -> bool {
        priority >= self.config.priority_levels.saturating_sub(1)
    }

    /// Maps a priority level onto header flags.
    fn priority_flags(&self, priority: u8) -> PacketFlags {
        let levels = self.config.priority_levels;
        if priority >= levels.saturating_sub(1) {
            PacketFlags::CRITICAL.with(PacketFlags::HIGH_PRIORITY)
        } else if levels >= 2 && priority >= levels - 2 {
            PacketFlags::HIGH_PRIORITY
        } else {
            PacketFlags::NONE
        }
    }

    fn finalize_plain(&self, packet: OutboundPacket) -> ShapedPacket {
        let flags = packet.flags.with(self.priority_flags(packet.priority));
        ShapedPacket {
            packet_type: packet.packet_type,
            channel: packet.channel,
            flags,
            payload: packet.payload,
            confirm: None,
        }
    }

    fn push_to_batch(&mut self, packet: OutboundPacket, now: Instant) {
        let channel = packet.channel;
        let limit = self.config.batch_size_limit;
        let deadline = now + self.config.max_batch_delay;

        let batch = self.batches.entry(channel).or_default();
        if batch.deadline.is_none() {
            batch.deadline = Some(deadline);
        }
        batch.bytes += packet.payload.len() + 3;
        batch
            .entries
            .push((packet.priority, packet.packet_type, packet.payload));
        self.stats.packets_batched += 1;

        if batch.bytes >= limit {
            self.flush_batch(channel);
        }
    }

    fn flush_batch(&mut self, channel: ChannelId) {
        let Some(mut batch) = self.batches.remove(&channel) else {
            return;
        };
        if batch.entries.is_empty() {
            return;
        }

        // Stable sort: highest priority first, ties keep queue order. If
        // the batch is fragmented or partially lost, important entries
        // survive preferentially.
        batch.entries.sort_by(|a, b| b.0.cmp(&a.0));

        let top_priority = batch.entries.first().map_or(0, |e| e.0);
        let mut payload = Vec::with_capacity(batch.bytes + 2);
        payload.extend_from_slice(&(batch.entries.len() as u16).to_be_bytes());
        for (_, packet_type, body) in &batch.entries {
            payload.push(packet_type.0);
            payload.extend_from_slice(&(body.len() as u16).to_be_bytes());
            payload.extend_from_slice(body);
        }

        self.stats.batches_flushed += 1;
        let flags = self.priority_flags(top_priority);
        self.ready.push(ShapedPacket {
            packet_type: PacketType::BATCH,
            channel,
            flags,
            payload,
            confirm: None,
        });
    }

    fn flush_due_batches(&mut self, now: Instant) {
        let due: Vec<ChannelId> = self
            .batches
            .iter()
            .filter(|(_, b)| b.deadline.is_some_and(|d| now >= d))
            .map(|(&c, _)| c)
            .collect();
        for channel in due {
            self.flush_batch(channel);
        }
    }

    fn enqueue_entity(&mut self, packet: OutboundPacket, entity: EntityContext, now: Instant) {
        if self.config.enable_frequency_control {
            let interval = self.scaled_interval();
            let track = self.entities.entry(entity.id).or_default();
            if let Some(next_allowed) = track.next_allowed {
                if now < next_allowed {
                    // Latest wins; the replaced update is never sent.
                    if track.pending.replace(packet).is_some() {
                        self.stats.updates_coalesced += 1;
                    }
                    return;
                }
            }
            track.next_allowed = Some(now + interval);
        }
        self.emit_entity(packet, entity, now);
    }

    /// Effective per-entity spacing, widened when quality is scaled down.
    fn scaled_interval(&self) -> Duration {
        let base = self.config.min_entity_update_interval;
        if self.quality_scale >= 1.0 {
            base
        } else {
            Duration::from_secs_f32(base.as_secs_f32() / self.quality_scale)
        }
    }

    fn emit_entity(&mut self, packet: OutboundPacket, entity: EntityContext, _now: Instant) {
        let track = self.entities.entry(entity.id).or_default();
        let version = track.next_version;
        track.next_version = track.next_version.wrapping_add(1);

        let full_len = packet.payload.len();
        let mut encoded: Option<Vec<u8>> = None;
        if self.config.enable_delta {
            if let Some((base_version, base)) = &track.confirmed {
                if let Some(delta) = encode_delta(base, &packet.payload) {
                    // The delta must beat the full snapshot to be worth it.
                    if delta.len() + 2 < full_len {
                        let mut body =
                            Vec::with_capacity(1 + 4 + 2 + 2 + delta.len());
                        body.push(STATE_DELTA);
                        body.extend_from_slice(&entity.id.0.to_be_bytes());
                        body.extend_from_slice(&version.to_be_bytes());
                        body.extend_from_slice(&base_version.to_be_bytes());
                        body.extend_from_slice(&delta);
                        self.stats.deltas_sent += 1;
                        self.stats.bytes_saved_by_delta +=
                            (full_len - delta.len()) as u64;
                        encoded = Some(body);
                    }
                }
            }
        }

        let body = encoded.unwrap_or_else(|| {
            let mut body = Vec::with_capacity(1 + 4 + 2 + full_len);
            body.push(STATE_FULL);
            body.extend_from_slice(&entity.id.0.to_be_bytes());
            body.extend_from_slice(&version.to_be_bytes());
            body.extend_from_slice(&packet.payload);
            self.stats.full_states_sent += 1;
            body
        });

        track.in_flight.insert(version, packet.payload);
        if track.in_flight.len() > VERSION_WINDOW {
            let oldest = version.wrapping_sub(VERSION_WINDOW as u16);
            track
                .in_flight
                .retain(|&v, _| v.wrapping_sub(oldest) < VERSION_WINDOW as u16 * 2);
        }

        let flags = packet.flags.with(self.priority_flags(packet.priority));
        self.ready.push(ShapedPacket {
            packet_type: packet.packet_type,
            channel: packet.channel,
            flags,
            payload: body,
            confirm: Some((entity.id, version)),
        });
    }

    fn release_due_entities(&mut self, now: Instant) {
        let due: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|(_, t)| {
                t.pending.is_some() && t.next_allowed.map_or(true, |next| now >= next)
            })
            .map(|(&id, _)| id)
            .collect();

        for id in due {
            let interval = self.scaled_interval();
            let Some(track) = self.entities.get_mut(&id) else {
                continue;
            };
            let Some(pending) = track.pending.take() else {
                continue;
            };
            track.next_allowed = Some(now + interval);
            if let Some(entity) = pending.entity {
                self.emit_entity(pending, entity, now);
            }
        }
    }

    fn adapt_bandwidth(&mut self, now: Instant) {
        let Some(started) = self.window_started else {
            self.window_started = Some(now);
            return;
        };
        let elapsed = now.duration_since(started);
        if elapsed < ADAPT_INTERVAL {
            return;
        }

        let rate_kbps = (self.window_bytes * 8) as f32 / 1000.0 / elapsed.as_secs_f32();
        self.window_bytes = 0;
        self.window_started = Some(now);

        let target = if self.config.bandwidth_target_kbps > 0 {
            self.config.bandwidth_target_kbps as f32
        } else {
            // Auto mode tracks recent throughput and leaves headroom.
            self.auto_target_kbps = if self.auto_target_kbps == 0.0 {
                rate_kbps.max(64.0)
            } else {
                self.auto_target_kbps * 0.875 + rate_kbps * 0.125
            };
            (self.auto_target_kbps * 1.25).max(64.0)
        };

        let old = self.quality_scale;
        if rate_kbps > target {
            self.quality_scale = (self.quality_scale * 0.85).max(MIN_QUALITY_SCALE);
        } else if rate_kbps < target * 0.7 {
            self.quality_scale = (self.quality_scale * 1.1).min(1.0);
        }
        if (self.quality_scale - old).abs() > f32::EPSILON {
            self.stats.scale_adjustments += 1;
            tracing::debug!(
                rate_kbps,
                target,
                scale = self.quality_scale,
                "bandwidth adaptation adjusted quality scale"
            );
        }
    }
}

/// Encodes the byte ranges of `new` that differ from `base`.
///
/// Layout: `[new_len u16][run_count u16]` then per run
/// `[offset u16][len u16][bytes]`. Returns `None` when the payloads are
/// identical or too large for the envelope.
#[must_use]
pub fn encode_delta(base: &[u8], new: &[u8]) -> Option<Vec<u8>> {
    if new.len() > u16::MAX as usize || base.len() > u16::MAX as usize {
        return None;
    }

    // Collect differing runs over the shared prefix; a trailing length
    // change becomes one final run. Runs separated by fewer than 4 equal
    // bytes merge, trading a few bytes for per-run overhead.
    const MERGE_GAP: usize = 4;
    let shared = base.len().min(new.len());
    let mut spans: Vec<(usize, usize)> = Vec::new(); // (start, end exclusive)
    for idx in 0..shared {
        if base[idx] == new[idx] {
            continue;
        }
        match spans.last_mut() {
            Some((_, end)) if idx - *end < MERGE_GAP => *end = idx + 1,
            _ => spans.push((idx, idx + 1)),
        }
    }
    let mut runs: Vec<(usize, usize)> = spans
        .into_iter()
        .map(|(start, end)| (start, end - start))
        .collect();
    if new.len() != base.len() {
        runs.push((shared, new.len().saturating_sub(shared)));
    }
    if runs.is_empty() {
        // Identical payloads still need an (empty) delta so the version
        // advances on the receiving side.
        let mut out = Vec::with_capacity(4);
        out.extend_from_slice(&(new.len() as u16).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        return Some(out);
    }

    let mut out = Vec::with_capacity(4 + runs.iter().map(|(_, l)| 4 + l).sum::<usize>());
    out.extend_from_slice(&(new.len() as u16).to_be_bytes());
    out.extend_from_slice(&(runs.len() as u16).to_be_bytes());
    for (offset, len) in runs {
        out.extend_from_slice(&(offset as u16).to_be_bytes());
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.extend_from_slice(&new[offset..offset + len]);
    }
    Some(out)
}

/// Applies a delta produced by [`encode_delta`] to its base state.
#[must_use]
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Option<Vec<u8>> {
    if delta.len() < 4 {
        return None;
    }
    let new_len = u16::from_be_bytes([delta[0], delta[1]]) as usize;
    let run_count = u16::from_be_bytes([delta[2], delta[3]]) as usize;

    let mut state = base.to_vec();
    state.resize(new_len, 0);

    let mut cursor = 4;
    for _ in 0..run_count {
        if delta.len() < cursor + 4 {
            return None;
        }
        let offset = u16::from_be_bytes([delta[cursor], delta[cursor + 1]]) as usize;
        let len = u16::from_be_bytes([delta[cursor + 2], delta[cursor + 3]]) as usize;
        cursor += 4;
        if delta.len() < cursor + len || offset + len > new_len {
            return None;
        }
        state[offset..offset + len].copy_from_slice(&delta[cursor..cursor + len]);
        cursor += len;
    }
    Some(state)
}

/// Entity state envelope as decoded on the receiving side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateEnvelope {
    /// Full snapshot.
    Full {
        /// Entity being described.
        entity: EntityId,
        /// Sender's state version.
        version: u16,
        /// Snapshot bytes.
        state: Vec<u8>,
    },
    /// Delta against an earlier version.
    Delta {
        /// Entity being described.
        entity: EntityId,
        /// Sender's state version.
        version: u16,
        /// Version the delta applies to.
        base_version: u16,
        /// Encoded changed ranges.
        delta: Vec<u8>,
    },
}

/// Parses an entity-state payload envelope.
#[must_use]
pub fn decode_state_envelope(payload: &[u8]) -> Option<StateEnvelope> {
    let (&marker, rest) = payload.split_first()?;
    match marker {
        STATE_FULL => {
            if rest.len() < 6 {
                return None;
            }
            let entity = EntityId(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]));
            let version = u16::from_be_bytes([rest[4], rest[5]]);
            Some(StateEnvelope::Full {
                entity,
                version,
                state: rest[6..].to_vec(),
            })
        }
        STATE_DELTA => {
            if rest.len() < 8 {
                return None;
            }
            let entity = EntityId(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]));
            let version = u16::from_be_bytes([rest[4], rest[5]]);
            let base_version = u16::from_be_bytes([rest[6], rest[7]]);
            Some(StateEnvelope::Delta {
                entity,
                version,
                base_version,
                delta: rest[8..].to_vec(),
            })
        }
        _ => None,
    }
}

/// Receiver-side store of last applied entity states.
#[derive(Debug, Default)]
pub struct EntityStateStore {
    states: HashMap<EntityId, (u16, Vec<u8>)>,
    /// Deltas dropped because their base version was not held.
    pub deltas_rejected: u64,
}

impl EntityStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a decoded envelope, returning the entity and its new state.
    ///
    /// A delta whose base this store does not hold is dropped (the next
    /// full snapshot resynchronizes); the drop is counted.
    pub fn apply(&mut self, envelope: StateEnvelope) -> Option<(EntityId, Vec<u8>)> {
        match envelope {
            StateEnvelope::Full {
                entity,
                version,
                state,
            } => {
                self.states.insert(entity, (version, state.clone()));
                Some((entity, state))
            }
            StateEnvelope::Delta {
                entity,
                version,
                base_version,
                delta,
            } => {
                let Some((held_version, base)) = self.states.get(&entity) else {
                    self.deltas_rejected += 1;
                    return None;
                };
                if *held_version != base_version {
                    self.deltas_rejected += 1;
                    return None;
                }
                let Some(state) = apply_delta(base, &delta) else {
                    self.deltas_rejected += 1;
                    return None;
                };
                self.states.insert(entity, (version, state.clone()));
                Some((entity, state))
            }
        }
    }

    /// Forgets an entity (despawned).
    pub fn remove(&mut self, entity: EntityId) {
        self.states.remove(&entity);
    }
}

/// Unpacks a batch payload into its constituent packets.
#[must_use]
pub fn unpack_batch(payload: &[u8]) -> Option<Vec<(PacketType, Vec<u8>)>> {
    if payload.len() < 2 {
        return None;
    }
    let count = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut cursor = 2;
    for _ in 0..count {
        if payload.len() < cursor + 3 {
            return None;
        }
        let packet_type = PacketType(payload[cursor]);
        let len = u16::from_be_bytes([payload[cursor + 1], payload[cursor + 2]]) as usize;
        cursor += 3;
        if payload.len() < cursor + len {
            return None;
        }
        entries.push((packet_type, payload[cursor..cursor + len].to_vec()));
        cursor += len;
    }
    Some(entries)
}
