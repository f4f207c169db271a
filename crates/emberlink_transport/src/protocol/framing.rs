//! # Framing
//!
//! Serializes a logical packet into the wire header + payload and the
//! reverse.
//!
//! ## Design
//!
//! - Reused encode buffer, no allocation per packet
//! - Explicit big-endian writes, no struct transmutes
//! - CRC32 over header (checksum field zeroed) + payload
//!
//! Encoding never fails for well-formed input; decoding fails with
//! [`WireError::MalformedHeader`] or [`WireError::ChecksumMismatch`], both
//! of which the caller absorbs by dropping the datagram.

use super::header::{PacketFlags, PacketHeader, PacketType};
use super::{PROTOCOL_MAGIC, PROTOCOL_VERSION};
use crate::error::WireError;

/// Maximum size of a single datagram on the wire.
///
/// Header plus the default fragment payload stays under common path MTU.
pub const MAX_DATAGRAM_SIZE: usize = 1280;

/// Packet framer with a reused encode buffer.
pub struct Framer {
    buffer: [u8; MAX_DATAGRAM_SIZE],
}

impl Framer {
    /// Creates a framer with a fresh buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: [0u8; MAX_DATAGRAM_SIZE],
        }
    }

    /// Encodes a header + payload into a wire datagram.
    ///
    /// The returned slice borrows the internal buffer and is valid until
    /// the next `encode` call. The header's `size` and `checksum` fields
    /// are computed here; values passed in are ignored.
    ///
    /// # Panics
    ///
    /// Debug-asserts that the payload fits the datagram and that fragment
    /// fields are consistent; well-formed input never fails.
    pub fn encode(&mut self, header: &PacketHeader, payload: &[u8]) -> &[u8] {
        let header_len = header.encoded_size();
        debug_assert!(payload.len() <= u16::MAX as usize);
        debug_assert!(header_len + payload.len() <= MAX_DATAGRAM_SIZE);
        debug_assert!(header.fragment_count >= 1);
        debug_assert!(
            !header.flags.contains(PacketFlags::FRAGMENTED)
                || header.fragment_index < header.fragment_count
        );

        let buf = &mut self.buffer;
        buf[0..4].copy_from_slice(&PROTOCOL_MAGIC);
        buf[4] = PROTOCOL_VERSION;
        buf[5] = header.packet_type.0;
        buf[6] = header.flags.0;
        buf[7..9].copy_from_slice(&header.channel.to_be_bytes());
        buf[9..13].copy_from_slice(&header.sequence.to_be_bytes());
        buf[13..17].copy_from_slice(&header.ack.to_be_bytes());
        buf[17..21].copy_from_slice(&header.ack_bitfield.to_be_bytes());
        buf[21..23].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        buf[23..25].copy_from_slice(&header.fragment_index.to_be_bytes());
        buf[25..27].copy_from_slice(&header.fragment_count.to_be_bytes());
        // Checksum field stays zeroed while the digest runs.
        buf[27..31].copy_from_slice(&[0u8; 4]);

        let mut offset = PacketHeader::BASE_SIZE;
        if header.flags.has_timestamp() {
            let ts = header.timestamp.unwrap_or(0);
            buf[offset..offset + 8].copy_from_slice(&ts.to_be_bytes());
            offset += PacketHeader::TIMESTAMP_SIZE;
        }

        buf[offset..offset + payload.len()].copy_from_slice(payload);
        let total = offset + payload.len();

        let checksum = crc32fast::hash(&buf[..total]);
        buf[PacketHeader::CHECKSUM_OFFSET..PacketHeader::CHECKSUM_OFFSET + 4]
            .copy_from_slice(&checksum.to_be_bytes());

        &self.buffer[..total]
    }

    /// Decodes a wire datagram into a header and a borrowed payload.
    pub fn decode(data: &[u8]) -> Result<(PacketHeader, &[u8]), WireError> {
        if data.len() < PacketHeader::BASE_SIZE {
            return Err(WireError::MalformedHeader("datagram shorter than header"));
        }
        if data[0..4] != PROTOCOL_MAGIC {
            return Err(WireError::MalformedHeader("bad magic"));
        }
        if data[4] != PROTOCOL_VERSION {
            return Err(WireError::MalformedHeader("unsupported version"));
        }

        let packet_type = PacketType(data[5]);
        let flags = PacketFlags(data[6]);
        let channel = u16::from_be_bytes([data[7], data[8]]);
        let sequence = u32::from_be_bytes([data[9], data[10], data[11], data[12]]);
        let ack = u32::from_be_bytes([data[13], data[14], data[15], data[16]]);
        let ack_bitfield = u32::from_be_bytes([data[17], data[18], data[19], data[20]]);
        let size = u16::from_be_bytes([data[21], data[22]]);
        let fragment_index = u16::from_be_bytes([data[23], data[24]]);
        let fragment_count = u16::from_be_bytes([data[25], data[26]]);
        let transmitted = u32::from_be_bytes([data[27], data[28], data[29], data[30]]);

        let mut offset = PacketHeader::BASE_SIZE;
        let timestamp = if flags.has_timestamp() {
            if data.len() < offset + PacketHeader::TIMESTAMP_SIZE {
                return Err(WireError::MalformedHeader("truncated timestamp"));
            }
            let ts = u64::from_be_bytes([
                data[31], data[32], data[33], data[34], data[35], data[36], data[37], data[38],
            ]);
            offset += PacketHeader::TIMESTAMP_SIZE;
            Some(ts)
        } else {
            None
        };

        let payload = &data[offset..];
        if payload.len() != size as usize {
            return Err(WireError::MalformedHeader("size field mismatch"));
        }
        if fragment_count == 0 {
            return Err(WireError::MalformedHeader("zero fragment count"));
        }
        if flags.contains(PacketFlags::FRAGMENTED) && fragment_index >= fragment_count {
            return Err(WireError::MalformedHeader("fragment index out of range"));
        }

        // Digest with the checksum bytes substituted by zeros.
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..PacketHeader::CHECKSUM_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&data[PacketHeader::CHECKSUM_OFFSET + 4..]);
        let computed = hasher.finalize();

        if computed != transmitted {
            return Err(WireError::ChecksumMismatch {
                transmitted,
                computed,
            });
        }

        let header = PacketHeader {
            packet_type,
            flags,
            channel,
            sequence,
            ack,
            ack_bitfield,
            size,
            fragment_index,
            fragment_count,
            checksum: transmitted,
            timestamp,
        };
        Ok((header, payload))
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PacketHeader {
        let mut h = PacketHeader::new(
            PacketType(42),
            PacketFlags::RELIABLE.with(PacketFlags::ORDERED),
            3,
            17,
        );
        h.ack = 12;
        h.ack_bitfield = 0b1011;
        h
    }

    #[test]
    fn test_round_trip() {
        let mut framer = Framer::new();
        let header = sample_header();
        let payload = b"the quick brown fox";

        let wire = framer.encode(&header, payload).to_vec();
        let (decoded, body) = Framer::decode(&wire).unwrap();

        assert_eq!(decoded.packet_type, header.packet_type);
        assert_eq!(decoded.flags, header.flags);
        assert_eq!(decoded.channel, 3);
        assert_eq!(decoded.sequence, 17);
        assert_eq!(decoded.ack, 12);
        assert_eq!(decoded.ack_bitfield, 0b1011);
        assert_eq!(decoded.size as usize, payload.len());
        assert_eq!(body, payload);
    }

    #[test]
    fn test_round_trip_with_timestamp() {
        let mut framer = Framer::new();
        let mut header = sample_header();
        header.flags = PacketFlags::TIMESTAMPED;
        header.timestamp = Some(123_456_789);

        let wire = framer.encode(&header, b"hb").to_vec();
        let (decoded, body) = Framer::decode(&wire).unwrap();

        assert_eq!(decoded.timestamp, Some(123_456_789));
        assert_eq!(body, b"hb");
    }

    #[test]
    fn test_empty_payload() {
        let mut framer = Framer::new();
        let header = sample_header();
        let wire = framer.encode(&header, &[]).to_vec();
        let (decoded, body) = Framer::decode(&wire).unwrap();
        assert_eq!(decoded.size, 0);
        assert!(body.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let mut framer = Framer::new();
        let mut wire = framer.encode(&sample_header(), b"x").to_vec();
        wire[0] = b'X';
        assert!(matches!(
            Framer::decode(&wire),
            Err(WireError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_bad_version() {
        let mut framer = Framer::new();
        let mut wire = framer.encode(&sample_header(), b"x").to_vec();
        wire[4] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            Framer::decode(&wire),
            Err(WireError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_corrupt_payload_fails_checksum() {
        let mut framer = Framer::new();
        let mut wire = framer.encode(&sample_header(), b"payload bytes").to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(matches!(
            Framer::decode(&wire),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupt_header_fails_checksum() {
        let mut framer = Framer::new();
        let mut wire = framer.encode(&sample_header(), b"payload bytes").to_vec();
        // Flip a sequence bit; magic/version stay intact.
        wire[9] ^= 0x01;
        assert!(matches!(
            Framer::decode(&wire),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_datagram() {
        let mut framer = Framer::new();
        let wire = framer.encode(&sample_header(), b"payload bytes").to_vec();
        assert!(matches!(
            Framer::decode(&wire[..wire.len() - 3]),
            Err(WireError::MalformedHeader(_))
        ));
        assert!(matches!(
            Framer::decode(&wire[..10]),
            Err(WireError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_fragment_index_validation() {
        let mut framer = Framer::new();
        let mut header = sample_header();
        header.flags = PacketFlags::FRAGMENTED;
        header.fragment_index = 2;
        header.fragment_count = 4;
        let wire = framer.encode(&header, b"frag").to_vec();
        let (decoded, _) = Framer::decode(&wire).unwrap();
        assert_eq!(decoded.fragment_index, 2);
        assert_eq!(decoded.fragment_count, 4);
    }
}
