//! # Fragmentation and Reassembly
//!
//! Splits payloads too large for a single datagram into bounded-size
//! fragments and rebuilds them from out-of-order arrivals.
//!
//! ## Design
//!
//! - All fragments of one logical packet share one sequence number
//! - Each fragment carries its index and the total count; the final one
//!   carries the FRAGMENT_END marker
//! - An assembly that does not complete within the timeout window is
//!   discarded and counted as loss

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{ChannelId, PacketFlags, PacketHeader, SequenceNumber};

/// Splits oversized payloads into fragment-sized chunks.
#[derive(Clone, Copy, Debug)]
pub struct Fragmenter {
    fragment_size: usize,
}

impl Fragmenter {
    /// Creates a fragmenter with the given per-fragment payload bound.
    #[must_use]
    pub const fn new(fragment_size: usize) -> Self {
        Self { fragment_size }
    }

    /// Returns the number of fragments `len` bytes will occupy.
    #[inline]
    #[must_use]
    pub const fn count_for(&self, len: usize) -> usize {
        len.div_ceil(self.fragment_size)
    }

    /// Returns true if a payload of `len` bytes needs fragmenting.
    #[inline]
    #[must_use]
    pub const fn needs_split(&self, len: usize) -> bool {
        len > self.fragment_size
    }

    /// Iterates `(index, count, chunk)` over the payload's fragments.
    ///
    /// A payload that fits one fragment yields a single `(0, 1, payload)`
    /// entry, so callers can treat both cases uniformly.
    pub fn split<'a>(
        &self,
        payload: &'a [u8],
    ) -> impl Iterator<Item = (u16, u16, &'a [u8])> + 'a {
        let count = self.count_for(payload.len()).max(1) as u16;
        let size = self.fragment_size;
        payload
            .chunks(size)
            .enumerate()
            .map(move |(i, chunk)| (i as u16, count, chunk))
            // chunks() yields nothing for an empty payload; keep the
            // uniform single-entry contract.
            .chain(if payload.is_empty() {
                Some((0u16, 1u16, &payload[..]))
            } else {
                None
            })
    }
}

/// One in-progress reassembly.
#[derive(Debug)]
struct FragmentAssembly {
    /// Fragment buffers by index; `None` until received.
    fragments: Vec<Option<Vec<u8>>>,
    /// How many distinct indices have arrived.
    received: u16,
    /// Arrival time of the first fragment.
    first_arrival: Instant,
    /// Header of the first fragment seen, reused for the whole packet.
    template: PacketHeader,
}

/// Rebuilds logical packets from fragment arrivals.
pub struct Reassembler {
    assemblies: HashMap<(ChannelId, SequenceNumber), FragmentAssembly>,
    timeout: Duration,
    expired: u64,
}

impl Reassembler {
    /// Creates a reassembler that abandons assemblies after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            assemblies: HashMap::new(),
            timeout,
            expired: 0,
        }
    }

    /// Accepts one fragment.
    ///
    /// Returns the whole logical packet once every piece is present.
    /// Duplicate fragments are ignored; a completed assembly is removed,
    /// so the packet is produced exactly once.
    pub fn accept(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
        now: Instant,
    ) -> Option<(PacketHeader, Vec<u8>)> {
        let key = (header.channel, header.sequence);
        let count = header.fragment_count;

        let assembly = self.assemblies.entry(key).or_insert_with(|| FragmentAssembly {
            fragments: vec![None; count as usize],
            received: 0,
            first_arrival: now,
            template: *header,
        });

        if assembly.fragments.len() != count as usize {
            // A fragment disagreeing on the set size cannot belong here.
            tracing::debug!(
                channel = header.channel,
                sequence = header.sequence,
                "fragment count mismatch, dropping fragment"
            );
            return None;
        }

        let slot = &mut assembly.fragments[header.fragment_index as usize];
        if slot.is_some() {
            return None;
        }
        *slot = Some(payload.to_vec());
        assembly.received += 1;

        if assembly.received < count {
            return None;
        }

        let assembly = self.assemblies.remove(&key)?;
        let mut whole = Vec::with_capacity(
            assembly
                .fragments
                .iter()
                .map(|f| f.as_ref().map_or(0, Vec::len))
                .sum(),
        );
        for piece in assembly.fragments {
            whole.extend_from_slice(&piece.expect("all fragments received"));
        }

        let mut header = assembly.template;
        header.flags = header
            .flags
            .without(PacketFlags::FRAGMENTED)
            .without(PacketFlags::FRAGMENT_END);
        header.fragment_index = 0;
        header.fragment_count = 1;
        header.size = whole.len() as u16;
        Some((header, whole))
    }

    /// Discards assemblies older than the timeout window.
    ///
    /// Returns how many were abandoned; each counts as loss.
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.assemblies.len();
        self.assemblies.retain(|(channel, sequence), assembly| {
            let keep = now.duration_since(assembly.first_arrival) < timeout;
            if !keep {
                tracing::debug!(channel, sequence, "abandoning incomplete fragment assembly");
            }
            keep
        });
        let dropped = before - self.assemblies.len();
        self.expired += dropped as u64;
        dropped
    }

    /// Number of assemblies currently in progress.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }

    /// Total assemblies abandoned to timeout.
    #[must_use]
    pub const fn expired_total(&self) -> u64 {
        self.expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    fn fragment_header(sequence: u32, index: u16, count: u16) -> PacketHeader {
        let mut flags = PacketFlags::RELIABLE.with(PacketFlags::FRAGMENTED);
        if index + 1 == count {
            flags = flags.with(PacketFlags::FRAGMENT_END);
        }
        let mut h = PacketHeader::new(PacketType(20), flags, 0, sequence);
        h.fragment_index = index;
        h.fragment_count = count;
        h
    }

    #[test]
    fn test_split_sizes() {
        let fragmenter = Fragmenter::new(1200);
        let payload = vec![7u8; 4000];

        let parts: Vec<_> = fragmenter.split(&payload).collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].2.len(), 1200);
        assert_eq!(parts[1].2.len(), 1200);
        assert_eq!(parts[2].2.len(), 1200);
        assert_eq!(parts[3].2.len(), 400);
        assert!(parts.iter().all(|(_, count, _)| *count == 4));
    }

    #[test]
    fn test_small_payload_single_chunk() {
        let fragmenter = Fragmenter::new(1200);
        assert!(!fragmenter.needs_split(1200));
        assert!(fragmenter.needs_split(1201));

        let payload = b"small";
        let parts: Vec<_> = fragmenter.split(payload).collect();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0], (0, 1, &payload[..]));
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let fragmenter = Fragmenter::new(1200);
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let parts: Vec<(u16, u16, Vec<u8>)> = fragmenter
            .split(&payload)
            .map(|(i, c, chunk)| (i, c, chunk.to_vec()))
            .collect();

        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        let now = Instant::now();

        // Delivery order [2, 0, 3, 1].
        let mut whole = None;
        for &idx in &[2usize, 0, 3, 1] {
            let (i, c, chunk) = &parts[idx];
            let header = fragment_header(9, *i, *c);
            if let Some(result) = reassembler.accept(&header, chunk, now) {
                whole = Some(result);
            }
        }

        let (header, bytes) = whole.expect("assembly completed");
        assert_eq!(bytes, payload);
        assert!(!header.flags.contains(PacketFlags::FRAGMENTED));
        assert_eq!(header.fragment_count, 1);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_duplicate_fragments_complete_once() {
        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        let now = Instant::now();

        let first = fragment_header(3, 0, 2);
        let last = fragment_header(3, 1, 2);

        assert!(reassembler.accept(&first, b"aa", now).is_none());
        // Duplicate of the first fragment changes nothing.
        assert!(reassembler.accept(&first, b"aa", now).is_none());
        let (_, bytes) = reassembler.accept(&last, b"bb", now).expect("complete");
        assert_eq!(bytes, b"aabb");
    }

    #[test]
    fn test_assembly_timeout() {
        let mut reassembler = Reassembler::new(Duration::from_millis(10));
        let start = Instant::now();

        let header = fragment_header(5, 0, 3);
        assert!(reassembler.accept(&header, b"x", start).is_none());
        assert_eq!(reassembler.pending(), 1);

        assert_eq!(reassembler.expire(start + Duration::from_millis(5)), 0);
        assert_eq!(reassembler.expire(start + Duration::from_millis(20)), 1);
        assert_eq!(reassembler.pending(), 0);
        assert_eq!(reassembler.expired_total(), 1);
    }
}
