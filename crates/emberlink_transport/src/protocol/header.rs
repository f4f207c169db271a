//! # Packet Header
//!
//! The fixed header carried by every datagram. Layout is bit-exact and
//! big-endian on the wire; see [`PacketHeader::BASE_SIZE`] for the field
//! order.

use super::{ChannelId, SequenceNumber};

/// Packet type discriminator.
///
/// Values below [`PacketType::FIRST_APPLICATION`] are reserved for the
/// protocol itself; everything above is assigned by the gameplay layer and
/// treated as opaque by the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PacketType(pub u8);

impl PacketType {
    /// Connection request, carries the initiator's capability bytes.
    pub const HANDSHAKE: Self = Self(0);
    /// Connection accepted, carries the negotiated capability bytes.
    pub const HANDSHAKE_ACK: Self = Self(1);
    /// Authentication payload from the initiator.
    pub const AUTH: Self = Self(2);
    /// Authentication accepted.
    pub const AUTH_ACK: Self = Self(3);
    /// Keep-alive, carries the peer's echoed send timestamp.
    pub const HEARTBEAT: Self = Self(4);
    /// Orderly shutdown notification.
    pub const DISCONNECT: Self = Self(5);
    /// Container for several small packets shaped into one send.
    pub const BATCH: Self = Self(6);
    /// Bare acknowledgment for a channel with no return traffic.
    ///
    /// Carries only header ack state; consumes no sequence number and is
    /// never acknowledged itself.
    pub const ACK: Self = Self(7);

    /// First packet type available to the application.
    pub const FIRST_APPLICATION: u8 = 16;

    /// Returns true for protocol-reserved types.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        self.0 < Self::FIRST_APPLICATION
    }
}

/// Flag bitmask carried in the header.
///
/// The `CUSTOM` bit is protocol-reserved and context dependent: on a
/// `FRAGMENTED` packet it marks the final fragment; on an unfragmented
/// packet it announces the trailing 8-byte send timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Delivery is acknowledged and retransmitted until acked.
    pub const RELIABLE: Self = Self(1 << 0);
    /// Delivered to the application in sequence order within the channel.
    pub const ORDERED: Self = Self(1 << 1);
    /// Payload passed through the negotiated cipher hook.
    pub const ENCRYPTED: Self = Self(1 << 2);
    /// Payload passed through the adaptive compressor.
    pub const COMPRESSED: Self = Self(1 << 3);
    /// Placed ahead of normal traffic when shaping.
    pub const HIGH_PRIORITY: Self = Self(1 << 4);
    /// Bypasses batching entirely.
    pub const CRITICAL: Self = Self(1 << 5);
    /// One piece of a larger logical packet.
    pub const FRAGMENTED: Self = Self(1 << 6);
    /// Protocol-reserved context bit, see type docs.
    pub const CUSTOM: Self = Self(1 << 7);

    /// Final fragment of a fragmented set (the `CUSTOM` bit under
    /// `FRAGMENTED`).
    pub const FRAGMENT_END: Self = Self::CUSTOM;
    /// Trailing send timestamp present (the `CUSTOM` bit without
    /// `FRAGMENTED`).
    pub const TIMESTAMPED: Self = Self::CUSTOM;

    /// Returns true if every bit of `other` is set in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of both masks.
    #[inline]
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `self` with every bit of `other` cleared.
    #[inline]
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns true if the trailing timestamp is present.
    #[inline]
    #[must_use]
    pub const fn has_timestamp(self) -> bool {
        self.contains(Self::TIMESTAMPED) && !self.contains(Self::FRAGMENTED)
    }

    /// Returns true if this is the final fragment of a set.
    #[inline]
    #[must_use]
    pub const fn is_fragment_end(self) -> bool {
        self.contains(Self::FRAGMENTED) && self.contains(Self::FRAGMENT_END)
    }
}

/// Logical packet header.
///
/// Wire layout, big-endian, no implicit padding:
///
/// | offset | size | field |
/// |---|---|---|
/// | 0 | 4 | magic |
/// | 4 | 1 | version |
/// | 5 | 1 | type |
/// | 6 | 1 | flags |
/// | 7 | 2 | channel |
/// | 9 | 4 | sequence |
/// | 13 | 4 | ack |
/// | 17 | 4 | ack bitfield |
/// | 21 | 2 | payload size |
/// | 23 | 2 | fragment index |
/// | 25 | 2 | fragment count |
/// | 27 | 4 | checksum |
/// | 31 | 8 | timestamp (only when flag-gated) |
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type discriminator.
    pub packet_type: PacketType,
    /// Flag bitmask.
    pub flags: PacketFlags,
    /// Logical channel id.
    pub channel: ChannelId,
    /// Sender sequence number.
    pub sequence: SequenceNumber,
    /// Last sequence acknowledged by the sender.
    pub ack: SequenceNumber,
    /// Bitmap of the 32 sequences preceding `ack`.
    pub ack_bitfield: u32,
    /// Payload length in bytes. Always equals the serialized payload.
    pub size: u16,
    /// Index within the fragment set; zero when unfragmented.
    pub fragment_index: u16,
    /// Total fragments in the set; one when unfragmented.
    pub fragment_count: u16,
    /// Integrity checksum over header (checksum field zeroed) + payload.
    pub checksum: u32,
    /// Sender send time in milliseconds, present when flag-gated.
    pub timestamp: Option<u64>,
}

impl PacketHeader {
    /// Size of the fixed header portion in bytes.
    pub const BASE_SIZE: usize = 31;

    /// Size of the optional timestamp trailer.
    pub const TIMESTAMP_SIZE: usize = 8;

    /// Byte offset of the checksum field inside the encoded header.
    pub const CHECKSUM_OFFSET: usize = 27;

    /// Creates a header for an unfragmented packet.
    #[must_use]
    pub fn new(
        packet_type: PacketType,
        flags: PacketFlags,
        channel: ChannelId,
        sequence: SequenceNumber,
    ) -> Self {
        Self {
            packet_type,
            flags,
            channel,
            sequence,
            ack: 0,
            ack_bitfield: 0,
            size: 0,
            fragment_index: 0,
            fragment_count: 1,
            checksum: 0,
            timestamp: None,
        }
    }

    /// Encoded size of this header on the wire.
    #[inline]
    #[must_use]
    pub const fn encoded_size(&self) -> usize {
        if self.flags.has_timestamp() {
            Self::BASE_SIZE + Self::TIMESTAMP_SIZE
        } else {
            Self::BASE_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_algebra() {
        let f = PacketFlags::RELIABLE.with(PacketFlags::ORDERED);
        assert!(f.contains(PacketFlags::RELIABLE));
        assert!(f.contains(PacketFlags::ORDERED));
        assert!(!f.contains(PacketFlags::COMPRESSED));
        assert!(!f.without(PacketFlags::ORDERED).contains(PacketFlags::ORDERED));
    }

    #[test]
    fn test_custom_bit_context() {
        let ts = PacketFlags::TIMESTAMPED;
        assert!(ts.has_timestamp());
        assert!(!ts.is_fragment_end());

        let frag_end = PacketFlags::FRAGMENTED.with(PacketFlags::FRAGMENT_END);
        assert!(frag_end.is_fragment_end());
        assert!(!frag_end.has_timestamp());
    }

    #[test]
    fn test_control_range() {
        assert!(PacketType::HANDSHAKE.is_control());
        assert!(PacketType::BATCH.is_control());
        assert!(!PacketType(PacketType::FIRST_APPLICATION).is_control());
        assert!(!PacketType(200).is_control());
    }

    #[test]
    fn test_encoded_size() {
        let mut header = PacketHeader::new(PacketType(20), PacketFlags::NONE, 0, 1);
        assert_eq!(header.encoded_size(), PacketHeader::BASE_SIZE);

        header.flags = PacketFlags::TIMESTAMPED;
        assert_eq!(
            header.encoded_size(),
            PacketHeader::BASE_SIZE + PacketHeader::TIMESTAMP_SIZE
        );
    }
}
