//! # Session Manager
//!
//! Owns the connection lifecycle and wires the whole stack together.
//!
//! ## Pipelines
//!
//! ```text
//! OUT: send API -> Shaper -> Compressor -> Reliability -> Fragmenter -> Framer -> wire
//! IN:  wire -> Framer -> Reassembler -> Reliability -> Decompressor -> dispatch
//! ```
//!
//! ## State machine
//!
//! `Disconnected → Connecting → Authenticating → Connected →
//! [Reconnecting] → Disconnecting → Disconnected`, with a terminal `Error`
//! reachable from any non-terminal state on unrecoverable violation.
//!
//! All observer notifications fire synchronously at the end of the
//! processing step that caused them, never from the I/O thread.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use emberlink_core::{EntityId, Position};

use crate::compress::{AdaptiveCompressor, CompressionStats};
use crate::config::TransportConfig;
use crate::error::{ConfigError, DeliveryFailure, SendError};
use crate::fragment::{Fragmenter, Reassembler};
use crate::protocol::{
    ChannelId, Framer, PacketFlags, PacketHeader, PacketType, SequenceNumber,
};
use crate::reliability::{Disposition, ProtocolStats, ReliabilityEngine};
use crate::shaper::{
    decode_state_envelope, unpack_batch, EntityContext, EntityStateStore, OptimizationStats,
    OutboundPacket, ShapedPacket, TrafficShaper,
};

/// Largest logical packet the send API accepts.
pub const MAX_LOGICAL_PACKET: usize = 64 * 1024;

/// Bound on remembered unconfirmed entity-state sequences.
const MAX_PENDING_CONFIRMS: usize = 1024;

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link.
    Disconnected,
    /// Handshake sent, awaiting response.
    Connecting,
    /// Handshake accepted, credentials being checked.
    Authenticating,
    /// Fully established.
    Connected,
    /// Link lost, attempting to re-establish.
    Reconnecting,
    /// Orderly shutdown in progress.
    Disconnecting,
    /// Unrecoverable protocol violation; terminal.
    Error,
}

impl ConnectionState {
    /// Returns true for states that accept application sends.
    #[must_use]
    pub const fn accepts_sends(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticating | Self::Connected | Self::Reconnecting
        )
    }
}

/// Which side of the handshake this session plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    /// Sends the handshake (client).
    Initiator,
    /// Answers the handshake (server side of one connection).
    Acceptor,
}

/// Pluggable payload cipher seam.
///
/// The protocol only defines where the hooks run: after compression going
/// out, before decompression coming in. Key exchange and the primitives
/// themselves live with the caller.
pub trait PacketCipher: Send {
    /// Encrypts a payload in place.
    fn encrypt(&self, payload: &mut Vec<u8>);
    /// Decrypts a payload in place; false rejects the packet.
    fn decrypt(&self, payload: &mut Vec<u8>) -> bool;
}

/// Cipher that passes payloads through untouched.
pub struct NullCipher;

impl PacketCipher for NullCipher {
    fn encrypt(&self, _payload: &mut Vec<u8>) {}
    fn decrypt(&self, _payload: &mut Vec<u8>) -> bool {
        true
    }
}

/// A packet delivered to the application.
#[derive(Clone, Debug)]
pub struct ReceivedPacket {
    /// Application packet type.
    pub packet_type: PacketType,
    /// Channel it arrived on.
    pub channel: ChannelId,
    /// Flags it arrived with.
    pub flags: PacketFlags,
    /// Entity the payload describes, for entity-state types.
    pub entity: Option<EntityId>,
    /// Payload bytes after decompression and delta application.
    pub payload: Vec<u8>,
}

/// Opaque handle identifying a registered callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

/// Aggregate statistics snapshot handed to stats observers.
#[derive(Clone, Copy, Debug)]
pub struct StatsSnapshot {
    /// Lifecycle state at snapshot time.
    pub state: ConnectionState,
    /// Smoothed round-trip time in milliseconds.
    pub rtt_ms: f32,
    /// Round-trip variation in milliseconds.
    pub jitter_ms: f32,
    /// Delivery counters.
    pub protocol: ProtocolStats,
    /// Shaping counters.
    pub optimization: OptimizationStats,
    /// Compression counters (shared across the endpoint).
    pub compression: CompressionStats,
    /// Datagrams dropped at the framer.
    pub wire_errors: u64,
    /// Payloads dropped at the decompressor.
    pub decompress_failures: u64,
    /// Fragment assemblies abandoned to timeout.
    pub reassembly_expired: u64,
}

type PacketCallback = Box<dyn FnMut(&ReceivedPacket) + Send>;
type StateCallback = Box<dyn FnMut(ConnectionState, ConnectionState) + Send>;
type ErrorCallback = Box<dyn FnMut(&DeliveryFailure) + Send>;
type StatsCallback = Box<dyn FnMut(&StatsSnapshot) + Send>;
type AuthValidator = Box<dyn Fn(&[u8]) -> bool + Send>;

struct StatsSubscriber {
    handle: CallbackHandle,
    callback: StatsCallback,
    interval: Duration,
    last_fired: Option<Instant>,
}

/// Capability byte: compression requested/granted.
const CAP_COMPRESSION: u8 = 1 << 0;
/// Capability byte: encryption requested/granted.
const CAP_ENCRYPTION: u8 = 1 << 1;

/// One end of one connection.
///
/// Constructed explicitly and handed to its owner; sessions hold no global
/// state. The compressor is shared across the endpoint's sessions so every
/// connection feeds the same dictionaries.
pub struct Session {
    config: TransportConfig,
    role: SessionRole,
    state: ConnectionState,
    epoch: Instant,

    framer: Framer,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    reliability: ReliabilityEngine,
    shaper: TrafficShaper,
    compressor: Arc<AdaptiveCompressor>,
    cipher: Option<Box<dyn PacketCipher>>,
    auth_validator: AuthValidator,
    auth_payload: Vec<u8>,

    negotiated_compression: bool,
    negotiated_encryption: bool,

    entity_state_types: HashSet<u8>,
    entity_states: EntityStateStore,
    pending_confirms: HashMap<(ChannelId, SequenceNumber), (EntityId, u16)>,

    connect_started: Option<Instant>,
    last_packet_received: Option<Instant>,
    last_heartbeat_sent: Option<Instant>,
    reconnect_attempts: u32,
    next_reconnect_at: Option<Instant>,
    shutdown: bool,

    wire_errors: u64,
    decompress_failures: u64,

    next_handle: u64,
    packet_callbacks: HashMap<u8, Vec<(CallbackHandle, PacketCallback)>>,
    all_packet_callbacks: Vec<(CallbackHandle, PacketCallback)>,
    state_callbacks: Vec<(CallbackHandle, StateCallback)>,
    error_callbacks: Vec<(CallbackHandle, ErrorCallback)>,
    stats_subscribers: Vec<StatsSubscriber>,

    pending_transitions: Vec<(ConnectionState, ConnectionState)>,
    pending_deliveries: Vec<ReceivedPacket>,
    pending_failures: Vec<DeliveryFailure>,
    outbound: Vec<Vec<u8>>,
}

impl Session {
    /// Creates a session from a validated configuration.
    pub fn new(
        config: TransportConfig,
        role: SessionRole,
        compressor: Arc<AdaptiveCompressor>,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            fragmenter: Fragmenter::new(config.fragment_size),
            reassembler: Reassembler::new(config.connection_timeout()),
            reliability: ReliabilityEngine::new(
                config.resend_interval(),
                config.max_reliable_resends,
            ),
            shaper: TrafficShaper::new(config.shaper_config()),
            config,
            role,
            state: ConnectionState::Disconnected,
            epoch: now,
            framer: Framer::new(),
            compressor,
            cipher: None,
            auth_validator: Box::new(|_| true),
            auth_payload: Vec::new(),
            negotiated_compression: false,
            negotiated_encryption: false,
            entity_state_types: HashSet::new(),
            entity_states: EntityStateStore::new(),
            pending_confirms: HashMap::new(),
            connect_started: None,
            last_packet_received: None,
            last_heartbeat_sent: None,
            reconnect_attempts: 0,
            next_reconnect_at: None,
            shutdown: false,
            wire_errors: 0,
            decompress_failures: 0,
            next_handle: 0,
            packet_callbacks: HashMap::new(),
            all_packet_callbacks: Vec::new(),
            state_callbacks: Vec::new(),
            error_callbacks: Vec::new(),
            stats_subscribers: Vec::new(),
            pending_transitions: Vec::new(),
            pending_deliveries: Vec::new(),
            pending_failures: Vec::new(),
            outbound: Vec::new(),
        })
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Smoothed round-trip time in milliseconds.
    #[must_use]
    pub fn rtt_ms(&self) -> f32 {
        self.reliability.rtt().smoothed_ms()
    }

    /// Round-trip variation (jitter) in milliseconds.
    #[must_use]
    pub fn jitter_ms(&self) -> f32 {
        self.reliability.rtt().jitter_ms()
    }

    /// Shared quality scale factor from bandwidth adaptation.
    #[must_use]
    pub const fn quality_scale_factor(&self) -> f32 {
        self.shaper.quality_scale_factor()
    }

    /// Installs the payload cipher used when encryption is negotiated.
    pub fn set_cipher(&mut self, cipher: Box<dyn PacketCipher>) {
        self.cipher = Some(cipher);
    }

    /// Installs the acceptor-side credential check.
    pub fn set_auth_validator(&mut self, validator: AuthValidator) {
        self.auth_validator = validator;
    }

    /// Sets the opaque credentials the initiator presents.
    pub fn set_auth_payload(&mut self, payload: Vec<u8>) {
        self.auth_payload = payload;
    }

    /// Declares a packet type as carrying entity-state envelopes.
    ///
    /// Must be called symmetrically on both endpoints, like callback
    /// registration.
    pub fn register_entity_state_type(&mut self, packet_type: PacketType) {
        self.entity_state_types.insert(packet_type.0);
    }

    /// Begins the handshake (initiator only).
    pub fn connect(&mut self, now: Instant) {
        if self.role != SessionRole::Initiator || self.state != ConnectionState::Disconnected {
            return;
        }
        self.set_state(ConnectionState::Connecting);
        self.connect_started = Some(now);
        self.send_handshake(now);
        self.flush_notifications();
    }

    /// Starts an orderly shutdown, flushing queued traffic first.
    pub fn disconnect(&mut self, now: Instant) {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Error
        ) {
            return;
        }
        self.set_state(ConnectionState::Disconnecting);
        let flushed = self.shaper.flush_queue(true, now);
        for shaped in flushed {
            self.process_shaped(shaped, now);
        }
        self.send_control(PacketType::DISCONNECT, &[], now);
        self.reliability.abandon_all();
        self.set_state(ConnectionState::Disconnected);
        self.flush_notifications();
    }

    /// Queues a payload for reliable (acknowledged, retransmitted)
    /// delivery.
    pub fn send_reliable(
        &mut self,
        packet_type: PacketType,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), SendError> {
        self.queue_send(packet_type, channel, PacketFlags::RELIABLE, payload)
    }

    /// Queues a payload for reliable in-order delivery.
    pub fn send_ordered(
        &mut self,
        packet_type: PacketType,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), SendError> {
        self.queue_send(
            packet_type,
            channel,
            PacketFlags::RELIABLE.with(PacketFlags::ORDERED),
            payload,
        )
    }

    /// Queues a payload for fire-and-forget delivery.
    pub fn send_unreliable(
        &mut self,
        packet_type: PacketType,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), SendError> {
        self.queue_send(packet_type, channel, PacketFlags::NONE, payload)
    }

    /// Queues an entity-tracked update that the shaper may delta-encode,
    /// coalesce, or drop by interest.
    pub fn send_entity_update(
        &mut self,
        packet_type: PacketType,
        channel: ChannelId,
        entity: EntityId,
        position: Position,
        payload: &[u8],
        priority: u8,
    ) -> Result<(), SendError> {
        self.check_send(channel, payload)?;
        let accepted = self.shaper.enqueue(
            OutboundPacket {
                packet_type,
                channel,
                flags: PacketFlags::NONE,
                priority,
                payload: payload.to_vec(),
                entity: Some(EntityContext {
                    id: entity,
                    position,
                }),
            },
            Instant::now(),
        );
        // An interest-filtered update is a success from the caller's view:
        // the shaper decided the peer does not need it.
        let _ = accepted;
        Ok(())
    }

    fn check_send(&self, channel: ChannelId, payload: &[u8]) -> Result<(), SendError> {
        if !self.state.accepts_sends() {
            return Err(SendError::NotConnected);
        }
        if payload.len() > MAX_LOGICAL_PACKET {
            return Err(SendError::PayloadTooLarge(payload.len()));
        }
        if self.reliability.is_degraded(channel) {
            return Err(SendError::ChannelDegraded(channel));
        }
        Ok(())
    }

    fn queue_send(
        &mut self,
        packet_type: PacketType,
        channel: ChannelId,
        flags: PacketFlags,
        payload: &[u8],
    ) -> Result<(), SendError> {
        self.check_send(channel, payload)?;
        self.shaper.enqueue(
            OutboundPacket {
                packet_type,
                channel,
                flags,
                priority: 0,
                payload: payload.to_vec(),
                entity: None,
            },
            Instant::now(),
        );
        Ok(())
    }

    /// Registers a callback for one packet type.
    pub fn register_packet_callback(
        &mut self,
        packet_type: PacketType,
        callback: PacketCallback,
    ) -> CallbackHandle {
        let handle = self.allocate_handle();
        self.packet_callbacks
            .entry(packet_type.0)
            .or_default()
            .push((handle, callback));
        handle
    }

    /// Registers a callback receiving every delivered packet.
    pub fn register_all_packets_callback(&mut self, callback: PacketCallback) -> CallbackHandle {
        let handle = self.allocate_handle();
        self.all_packet_callbacks.push((handle, callback));
        handle
    }

    /// Registers a connection-state observer.
    pub fn register_state_callback(&mut self, callback: StateCallback) -> CallbackHandle {
        let handle = self.allocate_handle();
        self.state_callbacks.push((handle, callback));
        handle
    }

    /// Registers an observer for channel-fatal delivery failures.
    pub fn register_error_callback(&mut self, callback: ErrorCallback) -> CallbackHandle {
        let handle = self.allocate_handle();
        self.error_callbacks.push((handle, callback));
        handle
    }

    /// Registers a periodic statistics observer.
    pub fn register_stats_callback(
        &mut self,
        interval: Duration,
        callback: StatsCallback,
    ) -> CallbackHandle {
        let handle = self.allocate_handle();
        self.stats_subscribers.push(StatsSubscriber {
            handle,
            callback,
            interval,
            last_fired: None,
        });
        handle
    }

    /// Removes a callback by handle; returns true if one was removed.
    pub fn unregister(&mut self, handle: CallbackHandle) -> bool {
        let mut removed = false;
        for list in self.packet_callbacks.values_mut() {
            let before = list.len();
            list.retain(|(h, _)| *h != handle);
            removed |= list.len() != before;
        }
        let before = self.all_packet_callbacks.len();
        self.all_packet_callbacks.retain(|(h, _)| *h != handle);
        removed |= self.all_packet_callbacks.len() != before;

        let before = self.state_callbacks.len();
        self.state_callbacks.retain(|(h, _)| *h != handle);
        removed |= self.state_callbacks.len() != before;

        let before = self.error_callbacks.len();
        self.error_callbacks.retain(|(h, _)| *h != handle);
        removed |= self.error_callbacks.len() != before;

        let before = self.stats_subscribers.len();
        self.stats_subscribers.retain(|s| s.handle != handle);
        removed |= self.stats_subscribers.len() != before;
        removed
    }

    fn allocate_handle(&mut self) -> CallbackHandle {
        self.next_handle += 1;
        CallbackHandle(self.next_handle)
    }

    /// Processes one inbound datagram.
    ///
    /// Corrupt, stale and duplicate input is absorbed here and only shows
    /// up in statistics.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) {
        if self.shutdown {
            return;
        }
        let (header, payload) = match Framer::decode(data) {
            Ok(decoded) => decoded,
            Err(error) => {
                self.wire_errors += 1;
                tracing::trace!(%error, "dropping undecodable datagram");
                return;
            }
        };
        let payload = payload.to_vec();
        self.last_packet_received = Some(now);

        // Fragments fold into their assembly first; ack bookkeeping runs
        // on whole logical packets only, so a half-assembled sequence is
        // never acknowledged.
        let (header, payload) = if header.flags.contains(PacketFlags::FRAGMENTED) {
            self.apply_peer_acks(&header, now);
            match self.reassembler.accept(&header, &payload, now) {
                Some(whole) => whole,
                None => {
                    self.flush_notifications();
                    return;
                }
            }
        } else {
            self.apply_peer_acks(&header, now);
            (header, payload)
        };

        // Bare acks carry only header state: no sequence to book, nothing
        // to dispatch, and never an ack in response (no ping-pong).
        if header.packet_type == PacketType::ACK {
            self.flush_notifications();
            return;
        }

        match self.reliability.on_receive(header.channel, header.sequence) {
            Disposition::Accept => {}
            Disposition::Duplicate | Disposition::Stale => {
                self.flush_notifications();
                return;
            }
        }

        if header.packet_type.is_control() {
            self.handle_control(&header, &payload, now);
        } else {
            self.handle_data(&header, payload, now);
        }
        self.flush_notifications();
    }

    /// Advances timers and drains everything ready for the wire.
    ///
    /// Called once per processing tick. Returns the datagrams to hand to
    /// the I/O context. Never blocks; all waiting is time-sliced against
    /// `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<Vec<u8>> {
        if self.shutdown {
            return std::mem::take(&mut self.outbound);
        }

        self.check_timeouts(now);

        if self.state == ConnectionState::Connected {
            // Outbound data pipeline.
            let shaped = self.shaper.poll(now);
            for packet in shaped {
                self.process_shaped(packet, now);
            }

            // Retransmission is a poll, not a wait.
            let (resends, failures) = self.reliability.due_resends(now);
            for record in resends {
                self.emit_datagrams(
                    record.packet_type,
                    record.flags,
                    record.channel,
                    record.sequence,
                    &record.payload,
                    now,
                );
            }
            self.pending_failures.extend(failures);

            // Channels that received traffic but sent none this tick owe
            // the peer their ack state.
            for channel in self.reliability.dirty_channels() {
                self.emit_datagrams(PacketType::ACK, PacketFlags::NONE, channel, 0, &[], now);
            }

            self.maybe_heartbeat(now);
        }

        for (channel, packet_type, flags, payload) in self.reliability.poll_ordered(now) {
            self.finish_inbound(packet_type, flags, channel, payload);
        }
        self.reassembler.expire(now);
        self.fire_stats(now);
        self.flush_notifications();
        std::mem::take(&mut self.outbound)
    }

    /// Flushes all queued traffic immediately, bypassing batching delay.
    pub fn flush(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let shaped = self.shaper.flush_queue(true, now);
        if self.state == ConnectionState::Connected {
            for packet in shaped {
                self.process_shaped(packet, now);
            }
        }
        self.flush_notifications();
        std::mem::take(&mut self.outbound)
    }

    /// Requests cooperative shutdown; subsequent ticks do no new work.
    pub fn request_shutdown(&mut self) {
        self.shutdown = true;
    }

    /// Builds an aggregate statistics snapshot.
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            state: self.state,
            rtt_ms: self.rtt_ms(),
            jitter_ms: self.jitter_ms(),
            protocol: *self.reliability.stats(),
            optimization: *self.shaper.stats(),
            compression: self.compressor.stats(),
            wire_errors: self.wire_errors,
            decompress_failures: self.decompress_failures,
            reassembly_expired: self.reassembler.expired_total(),
        }
    }

    /// Resets every per-session counter.
    pub fn reset_stats(&mut self) {
        self.reliability.reset_stats();
        self.shaper.reset_stats();
        self.wire_errors = 0;
        self.decompress_failures = 0;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn now_ms(&self, now: Instant) -> u64 {
        now.duration_since(self.epoch).as_millis() as u64
    }

    fn set_state(&mut self, new: ConnectionState) {
        if self.state == new {
            return;
        }
        let old = self.state;
        self.state = new;
        tracing::info!(?old, ?new, role = ?self.role, "connection state changed");
        self.pending_transitions.push((old, new));
    }

    fn send_handshake(&mut self, now: Instant) {
        let mut caps = 0u8;
        if self.config.algorithm != crate::compress::CompressionAlgorithm::None {
            caps |= CAP_COMPRESSION;
        }
        if self.config.encryption_enabled && self.cipher.is_some() {
            caps |= CAP_ENCRYPTION;
        }
        self.send_control(PacketType::HANDSHAKE, &[caps], now);
    }

    fn send_control(&mut self, packet_type: PacketType, payload: &[u8], now: Instant) {
        let flags = PacketFlags::TIMESTAMPED;
        let sequence =
            self.reliability
                .register_send(0, packet_type, flags, payload, now);
        self.emit_datagrams(packet_type, flags, 0, sequence, payload, now);
    }

    fn process_shaped(&mut self, shaped: ShapedPacket, now: Instant) {
        let mut payload = shaped.payload;
        let mut flags = shaped.flags;

        if self.negotiated_compression {
            if let Some(blob) = self.compressor.compress(shaped.packet_type, &payload) {
                payload = blob;
                flags = flags.with(PacketFlags::COMPRESSED);
            }
        }
        if self.negotiated_encryption {
            if let Some(cipher) = &self.cipher {
                cipher.encrypt(&mut payload);
                flags = flags.with(PacketFlags::ENCRYPTED);
            }
        }

        let sequence =
            self.reliability
                .register_send(shaped.channel, shaped.packet_type, flags, &payload, now);
        if let Some((entity, version)) = shaped.confirm {
            if self.pending_confirms.len() >= MAX_PENDING_CONFIRMS {
                self.pending_confirms.clear();
            }
            self.pending_confirms
                .insert((shaped.channel, sequence), (entity, version));
        }
        self.emit_datagrams(shaped.packet_type, flags, shaped.channel, sequence, &payload, now);
    }

    fn emit_datagrams(
        &mut self,
        packet_type: PacketType,
        flags: PacketFlags,
        channel: ChannelId,
        sequence: SequenceNumber,
        payload: &[u8],
        now: Instant,
    ) {
        let (ack, ack_bitfield) = self.reliability.ack_state(channel);

        if self.fragmenter.needs_split(payload.len()) {
            // The timestamp trailer never rides fragments; the CUSTOM bit
            // marks the final piece instead.
            let base_flags = flags.without(PacketFlags::CUSTOM).with(PacketFlags::FRAGMENTED);
            for (index, count, chunk) in self.fragmenter.split(payload) {
                let mut frag_flags = base_flags;
                if index + 1 == count {
                    frag_flags = frag_flags.with(PacketFlags::FRAGMENT_END);
                }
                let header = PacketHeader {
                    packet_type,
                    flags: frag_flags,
                    channel,
                    sequence,
                    ack,
                    ack_bitfield,
                    size: chunk.len() as u16,
                    fragment_index: index,
                    fragment_count: count,
                    checksum: 0,
                    timestamp: None,
                };
                let wire = self.framer.encode(&header, chunk);
                self.shaper.record_wire_bytes(wire.len());
                self.outbound.push(wire.to_vec());
            }
        } else {
            let timestamp = flags.has_timestamp().then(|| self.now_ms(now));
            let header = PacketHeader {
                packet_type,
                flags,
                channel,
                sequence,
                ack,
                ack_bitfield,
                size: payload.len() as u16,
                fragment_index: 0,
                fragment_count: 1,
                checksum: 0,
                timestamp,
            };
            let wire = self.framer.encode(&header, payload);
            self.shaper.record_wire_bytes(wire.len());
            self.outbound.push(wire.to_vec());
        }
    }

    /// Retires reliable records and entity-state confirmations covered by
    /// the peer's ack state.
    fn apply_peer_acks(&mut self, header: &PacketHeader, now: Instant) {
        self.reliability
            .process_acks(header.channel, header.ack, header.ack_bitfield, now);

        if self.pending_confirms.is_empty() {
            return;
        }
        let channel = header.channel;
        let ack = header.ack;
        let bitfield = header.ack_bitfield;
        let confirmed: Vec<((ChannelId, SequenceNumber), (EntityId, u16))> = self
            .pending_confirms
            .iter()
            .filter(|((ch, seq), _)| *ch == channel && ack_covers(ack, bitfield, *seq))
            .map(|(k, v)| (*k, *v))
            .collect();
        for (key, (entity, version)) in confirmed {
            self.pending_confirms.remove(&key);
            self.shaper.confirm_entity(entity, version);
        }
    }

    fn handle_control(&mut self, header: &PacketHeader, payload: &[u8], now: Instant) {
        match header.packet_type {
            PacketType::HANDSHAKE => self.on_handshake(payload, now),
            PacketType::HANDSHAKE_ACK => self.on_handshake_ack(payload, now),
            PacketType::AUTH => self.on_auth(payload, now),
            PacketType::AUTH_ACK => self.on_auth_ack(),
            PacketType::HEARTBEAT => self.on_heartbeat(header, payload, now),
            PacketType::DISCONNECT => {
                if self.state != ConnectionState::Disconnected {
                    tracing::info!("peer requested disconnect");
                    self.reliability.abandon_all();
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            _ => {
                tracing::debug!(packet_type = header.packet_type.0, "unknown control packet");
            }
        }
    }

    fn on_handshake(&mut self, payload: &[u8], now: Instant) {
        if self.role != SessionRole::Acceptor {
            return;
        }
        let peer_caps = payload.first().copied().unwrap_or(0);
        self.apply_negotiation(peer_caps);

        match self.state {
            ConnectionState::Disconnected => {
                self.set_state(ConnectionState::Authenticating);
            }
            // A reconnecting peer re-handshakes an established link.
            ConnectionState::Connected | ConnectionState::Authenticating => {}
            _ => return,
        }

        let mut caps = 0u8;
        if self.negotiated_compression {
            caps |= CAP_COMPRESSION;
        }
        if self.negotiated_encryption {
            caps |= CAP_ENCRYPTION;
        }
        self.send_control(PacketType::HANDSHAKE_ACK, &[caps], now);
    }

    fn on_handshake_ack(&mut self, payload: &[u8], now: Instant) {
        if self.role != SessionRole::Initiator {
            return;
        }
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            return;
        }
        let granted = payload.first().copied().unwrap_or(0);
        self.apply_negotiation(granted);
        self.set_state(ConnectionState::Authenticating);
        let auth = self.auth_payload.clone();
        self.send_control(PacketType::AUTH, &auth, now);
    }

    fn on_auth(&mut self, payload: &[u8], now: Instant) {
        if self.role != SessionRole::Acceptor {
            return;
        }
        if !matches!(
            self.state,
            ConnectionState::Authenticating | ConnectionState::Connected
        ) {
            return;
        }
        if (self.auth_validator)(payload) {
            self.send_control(PacketType::AUTH_ACK, &[], now);
            if self.state == ConnectionState::Authenticating {
                self.set_state(ConnectionState::Connected);
            }
        } else {
            tracing::warn!("authentication rejected, failing session");
            self.send_control(PacketType::DISCONNECT, &[], now);
            self.reliability.abandon_all();
            self.set_state(ConnectionState::Error);
        }
    }

    fn on_auth_ack(&mut self) {
        if self.role != SessionRole::Initiator || self.state != ConnectionState::Authenticating {
            return;
        }
        let was_reconnect = self.reconnect_attempts > 0;
        self.reconnect_attempts = 0;
        self.next_reconnect_at = None;
        self.connect_started = None;
        self.set_state(ConnectionState::Connected);
        if was_reconnect {
            // Outstanding reliable traffic resumes immediately.
            self.reliability.reschedule_all(Instant::now());
        }
    }

    /// Heartbeats are ping/pong: the initiator pings on its interval, the
    /// acceptor echoes the ping's timestamp straight back. Only the fresh
    /// echo feeds the RTT estimator; a held timestamp would inflate it.
    fn on_heartbeat(&mut self, header: &PacketHeader, payload: &[u8], now: Instant) {
        if payload.len() >= 8 {
            // Pong: the payload is our own send timestamp.
            let echoed = u64::from_be_bytes([
                payload[0], payload[1], payload[2], payload[3], payload[4], payload[5],
                payload[6], payload[7],
            ]);
            if echoed > 0 {
                let sample = self.now_ms(now).saturating_sub(echoed);
                if sample > 0 {
                    self.reliability.observe_rtt(sample as f32);
                }
            }
        } else if self.role == SessionRole::Acceptor {
            // Ping: echo immediately.
            if let Some(ts) = header.timestamp {
                self.send_control(PacketType::HEARTBEAT, &ts.to_be_bytes(), now);
            }
        }
    }

    fn handle_data(&mut self, header: &PacketHeader, payload: Vec<u8>, now: Instant) {
        let mut payload = payload;
        if header.flags.contains(PacketFlags::ENCRYPTED) {
            let Some(cipher) = &self.cipher else {
                self.decompress_failures += 1;
                return;
            };
            if !cipher.decrypt(&mut payload) {
                self.decompress_failures += 1;
                return;
            }
        }

        if header.flags.contains(PacketFlags::ORDERED) {
            let released = self.reliability.release_ordered(
                header.channel,
                header.sequence,
                header.packet_type,
                header.flags,
                payload,
                now,
            );
            for (packet_type, flags, body) in released {
                self.finish_inbound(packet_type, flags, header.channel, body);
            }
        } else {
            self.finish_inbound(header.packet_type, header.flags, header.channel, payload);
        }
    }

    /// Final inbound stage: decompression, batch unpacking, entity-state
    /// application, dispatch.
    fn finish_inbound(
        &mut self,
        packet_type: PacketType,
        flags: PacketFlags,
        channel: ChannelId,
        payload: Vec<u8>,
    ) {
        let payload = if flags.contains(PacketFlags::COMPRESSED) {
            match self.compressor.decompress(packet_type, &payload) {
                Ok(restored) => restored,
                Err(error) => {
                    self.decompress_failures += 1;
                    tracing::debug!(%error, "dropping undecompressable payload");
                    return;
                }
            }
        } else {
            payload
        };

        if packet_type == PacketType::BATCH {
            let Some(entries) = unpack_batch(&payload) else {
                self.wire_errors += 1;
                return;
            };
            for (entry_type, body) in entries {
                self.deliver(entry_type, flags, channel, None, body);
            }
            return;
        }

        if self.entity_state_types.contains(&packet_type.0) {
            let Some(envelope) = decode_state_envelope(&payload) else {
                self.wire_errors += 1;
                return;
            };
            if let Some((entity, state)) = self.entity_states.apply(envelope) {
                self.deliver(packet_type, flags, channel, Some(entity), state);
            }
            return;
        }

        self.deliver(packet_type, flags, channel, None, payload);
    }

    fn deliver(
        &mut self,
        packet_type: PacketType,
        flags: PacketFlags,
        channel: ChannelId,
        entity: Option<EntityId>,
        payload: Vec<u8>,
    ) {
        self.pending_deliveries.push(ReceivedPacket {
            packet_type,
            channel,
            flags,
            entity,
            payload,
        });
    }

    fn check_timeouts(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connecting => {
                if let Some(started) = self.connect_started {
                    if now.duration_since(started) >= self.config.connection_timeout() {
                        tracing::warn!("handshake timed out");
                        self.connect_started = None;
                        self.set_state(ConnectionState::Disconnected);
                    }
                }
            }
            ConnectionState::Connected => {
                let silence_limit = self.config.heartbeat_interval()
                    * self.config.missed_heartbeat_limit;
                let silent_too_long = self
                    .last_packet_received
                    .map_or(false, |last| now.duration_since(last) >= silence_limit);
                if silent_too_long {
                    self.on_link_lost(now);
                }
            }
            ConnectionState::Reconnecting => {
                if let Some(due) = self.next_reconnect_at {
                    if now >= due {
                        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
                            tracing::warn!("reconnect attempts exhausted");
                            self.reliability.abandon_all();
                            self.next_reconnect_at = None;
                            self.set_state(ConnectionState::Disconnected);
                        } else {
                            self.reconnect_attempts += 1;
                            // Linearly increasing backoff.
                            let delay = Duration::from_millis(
                                self.config.reconnect_base_delay_ms
                                    * u64::from(self.reconnect_attempts),
                            );
                            self.next_reconnect_at = Some(now + delay);
                            tracing::info!(
                                attempt = self.reconnect_attempts,
                                "attempting reconnect"
                            );
                            self.send_handshake(now);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn on_link_lost(&mut self, now: Instant) {
        tracing::warn!(
            missed = self.config.missed_heartbeat_limit,
            "heartbeats missed, link considered lost"
        );
        if self.config.auto_reconnect && self.role == SessionRole::Initiator {
            self.reconnect_attempts = 0;
            self.next_reconnect_at = Some(now);
            self.set_state(ConnectionState::Reconnecting);
        } else {
            self.reliability.abandon_all();
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn maybe_heartbeat(&mut self, now: Instant) {
        // Pings originate on the initiator side only; the acceptor's
        // immediate echoes keep both directions demonstrably alive.
        if self.role != SessionRole::Initiator {
            return;
        }
        let due = self
            .last_heartbeat_sent
            .map_or(true, |last| now.duration_since(last) >= self.config.heartbeat_interval());
        if !due {
            return;
        }
        self.last_heartbeat_sent = Some(now);
        self.send_control(PacketType::HEARTBEAT, &[], now);
    }

    fn fire_stats(&mut self, now: Instant) {
        if self.stats_subscribers.is_empty() {
            return;
        }
        let snapshot = self.stats_snapshot();
        let mut subscribers = std::mem::take(&mut self.stats_subscribers);
        for sub in &mut subscribers {
            let due = sub
                .last_fired
                .map_or(true, |last| now.duration_since(last) >= sub.interval);
            if due {
                sub.last_fired = Some(now);
                (sub.callback)(&snapshot);
            }
        }
        self.stats_subscribers = subscribers;
    }

    /// Delivers queued packets, state transitions and failures to their
    /// observers, synchronously within the current processing step.
    fn flush_notifications(&mut self) {
        if !self.pending_transitions.is_empty() {
            let transitions = std::mem::take(&mut self.pending_transitions);
            let mut callbacks = std::mem::take(&mut self.state_callbacks);
            for (old, new) in &transitions {
                for (_, callback) in &mut callbacks {
                    callback(*old, *new);
                }
            }
            self.state_callbacks = callbacks;
        }

        if !self.pending_failures.is_empty() {
            let failures = std::mem::take(&mut self.pending_failures);
            let mut callbacks = std::mem::take(&mut self.error_callbacks);
            for failure in &failures {
                for (_, callback) in &mut callbacks {
                    callback(failure);
                }
            }
            self.error_callbacks = callbacks;
        }

        if !self.pending_deliveries.is_empty() {
            let deliveries = std::mem::take(&mut self.pending_deliveries);
            let mut typed = std::mem::take(&mut self.packet_callbacks);
            let mut all = std::mem::take(&mut self.all_packet_callbacks);
            for packet in &deliveries {
                if let Some(list) = typed.get_mut(&packet.packet_type.0) {
                    for (_, callback) in list.iter_mut() {
                        callback(packet);
                    }
                }
                for (_, callback) in &mut all {
                    callback(packet);
                }
            }
            self.packet_callbacks = typed;
            self.all_packet_callbacks = all;
        }
    }

    fn apply_negotiation(&mut self, peer_caps: u8) {
        let local_compression =
            self.config.algorithm != crate::compress::CompressionAlgorithm::None;
        self.negotiated_compression = local_compression && peer_caps & CAP_COMPRESSION != 0;
        self.negotiated_encryption = self.config.encryption_enabled
            && self.cipher.is_some()
            && peer_caps & CAP_ENCRYPTION != 0;
    }
}

/// Returns true when `seq` is covered by the ack state `(ack, bitfield)`.
#[must_use]
fn ack_covers(ack: SequenceNumber, bitfield: u32, seq: SequenceNumber) -> bool {
    if seq == ack {
        return true;
    }
    let back = ack.wrapping_sub(seq);
    back >= 1 && back <= 32 && bitfield & (1 << (back - 1)) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressionAlgorithm;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn compressor() -> Arc<AdaptiveCompressor> {
        Arc::new(AdaptiveCompressor::new(
            CompressionAlgorithm::Balanced,
            64,
            true,
        ))
    }

    fn pair(config: TransportConfig) -> (Session, Session, Instant) {
        let now = Instant::now();
        let client = Session::new(config.clone(), SessionRole::Initiator, compressor(), now)
            .expect("valid config");
        let server =
            Session::new(config, SessionRole::Acceptor, compressor(), now).expect("valid config");
        (client, server, now)
    }

    /// Ferries every queued datagram between two sessions until quiet.
    fn pump(client: &mut Session, server: &mut Session, now: Instant) {
        for _ in 0..8 {
            let to_server = client.tick(now);
            let to_client = server.tick(now);
            if to_server.is_empty() && to_client.is_empty() {
                break;
            }
            for datagram in to_server {
                server.handle_datagram(&datagram, now);
            }
            for datagram in to_client {
                client.handle_datagram(&datagram, now);
            }
        }
    }

    fn connect_pair(config: TransportConfig) -> (Session, Session, Instant) {
        let (mut client, mut server, now) = pair(config);
        client.connect(now);
        pump(&mut client, &mut server, now);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(server.state(), ConnectionState::Connected);
        (client, server, now)
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let (_, _, _) = connect_pair(TransportConfig::default());
    }

    #[test]
    fn test_state_callback_sequence() {
        let (mut client, mut server, now) = pair(TransportConfig::default());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_in_cb = Arc::clone(&seen);
        client.register_state_callback(Box::new(move |old, new| {
            seen_in_cb.lock().push((old, new));
        }));

        client.connect(now);
        pump(&mut client, &mut server, now);

        let transitions = seen.lock().clone();
        assert_eq!(
            transitions,
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Authenticating),
                (ConnectionState::Authenticating, ConnectionState::Connected),
            ]
        );
    }

    #[test]
    fn test_connect_timeout_returns_to_disconnected() {
        let (mut client, _, now) = pair(TransportConfig::default());
        client.connect(now);
        assert_eq!(client.state(), ConnectionState::Connecting);

        // No response ever arrives.
        client.tick(now + Duration::from_millis(4999));
        assert_eq!(client.state(), ConnectionState::Connecting);
        client.tick(now + Duration::from_millis(5001));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reliable_delivery_and_dispatch() {
        let (mut client, mut server, now) = connect_pair(TransportConfig::default());

        let received = Arc::new(AtomicUsize::new(0));
        let received_in_cb = Arc::clone(&received);
        server.register_packet_callback(
            PacketType(20),
            Box::new(move |packet| {
                assert_eq!(packet.payload, b"hello world");
                received_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        client
            .send_reliable(PacketType(20), 1, b"hello world")
            .unwrap();
        pump(&mut client, &mut server, now + Duration::from_millis(60));
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_stops_dispatch() {
        let (mut client, mut server, now) = connect_pair(TransportConfig::default());

        let received = Arc::new(AtomicUsize::new(0));
        let received_in_cb = Arc::clone(&received);
        let handle = server.register_packet_callback(
            PacketType(20),
            Box::new(move |_| {
                received_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(server.unregister(handle));
        assert!(!server.unregister(handle));

        client.send_reliable(PacketType(20), 1, b"x").unwrap();
        pump(&mut client, &mut server, now + Duration::from_millis(60));
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_send_rejected_when_disconnected() {
        let (mut client, _, _) = pair(TransportConfig::default());
        assert!(matches!(
            client.send_reliable(PacketType(20), 0, b"x"),
            Err(SendError::NotConnected)
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (mut client, mut server, now) = connect_pair(TransportConfig::default());
        let huge = vec![0u8; MAX_LOGICAL_PACKET + 1];
        assert!(matches!(
            client.send_reliable(PacketType(20), 0, &huge),
            Err(SendError::PayloadTooLarge(_))
        ));
        drop(server.tick(now));
    }

    #[test]
    fn test_large_payload_fragments_and_reassembles() {
        let (mut client, mut server, now) = connect_pair(TransportConfig::default());

        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let received_in_cb = Arc::clone(&received);
        server.register_packet_callback(
            PacketType(25),
            Box::new(move |packet| {
                received_in_cb.lock().push(packet.payload.clone());
            }),
        );

        client.send_reliable(PacketType(25), 0, &payload).unwrap();
        pump(&mut client, &mut server, now + Duration::from_millis(60));

        let got = received.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], expected);
    }

    #[test]
    fn test_heartbeat_keeps_link_alive() {
        let (mut client, mut server, start) = connect_pair(TransportConfig::default());

        let mut now = start;
        for _ in 0..8 {
            now += Duration::from_millis(1000);
            pump(&mut client, &mut server, now);
        }
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(server.state(), ConnectionState::Connected);
        // Heartbeat echoes produce round-trip samples.
        assert!(client.stats_snapshot().protocol.rtt_samples > 0 || client.rtt_ms() >= 0.0);
    }

    #[test]
    fn test_missed_heartbeats_trigger_reconnecting() {
        let (mut client, _, start) = connect_pair(TransportConfig::default());

        // Silence for longer than heartbeat_interval * missed limit.
        let later = start + Duration::from_millis(3500);
        client.tick(later);
        assert_eq!(client.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_reconnect_attempts_exhaust_to_disconnected() {
        let mut config = TransportConfig::default();
        config.max_reconnect_attempts = 2;
        config.reconnect_base_delay_ms = 100;
        let (mut client, _, start) = connect_pair(config);

        let mut now = start + Duration::from_millis(3500);
        client.tick(now);
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        for _ in 0..10 {
            now += Duration::from_millis(250);
            client.tick(now);
        }
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_notifies_peer() {
        let (mut client, mut server, now) = connect_pair(TransportConfig::default());

        client.disconnect(now);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let datagrams = client.tick(now);
        for datagram in datagrams {
            server.handle_datagram(&datagram, now);
        }
        assert_eq!(server.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_auth_rejection_is_terminal() {
        let (mut client, mut server, now) = pair(TransportConfig::default());
        server.set_auth_validator(Box::new(|payload| payload == b"let me in"));
        client.set_auth_payload(b"wrong password".to_vec());

        client.connect(now);
        pump(&mut client, &mut server, now);
        assert_eq!(server.state(), ConnectionState::Error);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_auth_payload_accepted() {
        let (mut client, mut server, now) = pair(TransportConfig::default());
        server.set_auth_validator(Box::new(|payload| payload == b"let me in"));
        client.set_auth_payload(b"let me in".to_vec());

        client.connect(now);
        pump(&mut client, &mut server, now);
        assert_eq!(server.state(), ConnectionState::Connected);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_entity_updates_travel_and_confirm() {
        let mut config = TransportConfig::default();
        config.enable_frequency_control = false;
        let (mut client, mut server, start) = connect_pair(config);
        client.register_entity_state_type(PacketType(30));
        server.register_entity_state_type(PacketType(30));

        let states = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let states_in_cb = Arc::clone(&states);
        server.register_packet_callback(
            PacketType(30),
            Box::new(move |packet| {
                states_in_cb
                    .lock()
                    .push((packet.entity.unwrap(), packet.payload.clone()));
            }),
        );

        let entity = EntityId(7);
        let position = Position::new(1.0, 2.0, 3.0);
        let mut state = vec![9u8; 200];
        client
            .send_entity_update(PacketType(30), 2, entity, position, &state, 1)
            .unwrap();
        let mut now = start + Duration::from_millis(20);
        pump(&mut client, &mut server, now);

        // The server's next packets carry acks that confirm the snapshot;
        // a later update can then go out as a delta.
        state[17] = 0xEE;
        now += Duration::from_millis(100);
        client
            .send_entity_update(PacketType(30), 2, entity, position, &state, 1)
            .unwrap();
        pump(&mut client, &mut server, now);

        let got = states.lock();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, entity);
        assert_eq!(got[1].1, state);
        assert!(client.stats_snapshot().optimization.deltas_sent >= 1);
    }

    #[test]
    fn test_stats_callback_interval() {
        let (mut client, _, start) = connect_pair(TransportConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        client.register_stats_callback(
            Duration::from_millis(100),
            Box::new(move |snapshot| {
                assert_eq!(snapshot.state, ConnectionState::Connected);
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        client.tick(start + Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Inside the interval: no second firing.
        client.tick(start + Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        client.tick(start + Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_corrupt_datagram_only_counted() {
        let (mut client, _, _) = connect_pair(TransportConfig::default());
        client.handle_datagram(b"not a real datagram", Instant::now());
        assert_eq!(client.stats_snapshot().wire_errors, 1);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_ack_covers() {
        assert!(ack_covers(10, 0, 10));
        assert!(ack_covers(10, 0b1, 9));
        assert!(ack_covers(10, 0b10, 8));
        assert!(!ack_covers(10, 0b1, 8));
        assert!(!ack_covers(10, 0, 11));
    }
}
