//! # Per-Type Compression Dictionaries
//!
//! Frequency-ranked tables of recurring byte sequences, one per packet
//! type. The compressor samples successfully compressed payloads into the
//! table and periodically freezes it into the dictionary bytes handed to
//! the codec.
//!
//! ## Policy
//!
//! - 8-byte windows sampled every 16 bytes from payloads over 16 bytes
//! - Content-hash keyed table, least-frequency eviction at the size bound
//! - Rebuild (sort by frequency, truncate, bump epoch) every 100
//!   insertions; the previous epoch is kept so the decompress side
//!   tolerates one rebuild of skew

use std::collections::HashMap;

/// Length of a sampled byte sequence.
pub const SEQUENCE_LEN: usize = 8;

/// Sampling stride across a payload.
pub const SAMPLE_STRIDE: usize = 16;

/// Payloads at or below this length are not sampled.
pub const MIN_SAMPLED_LEN: usize = 16;

/// Maximum entries per packet-type table.
pub const MAX_ENTRIES: usize = 1000;

/// Insertions between rebuilds.
pub const REBUILD_INTERVAL: u32 = 100;

/// One recurring byte sequence and its usage record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DictionaryEntry {
    /// The sampled byte sequence.
    pub sequence: [u8; SEQUENCE_LEN],
    /// How often the sequence has been observed.
    pub frequency: u32,
    /// Logical clock stamp of the last observation.
    pub last_used: u64,
}

/// A frozen dictionary snapshot usable by the codec.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrozenDictionary {
    /// Epoch counter, bumped on every rebuild.
    pub epoch: u32,
    /// Concatenated top sequences, most frequent last (codecs weight the
    /// tail of a dictionary highest).
    pub bytes: Vec<u8>,
}

/// Dictionary table for one packet type.
#[derive(Debug, Default)]
pub struct TypeDictionary {
    entries: HashMap<[u8; SEQUENCE_LEN], DictionaryEntry>,
    insertions: u32,
    clock: u64,
    current: Option<FrozenDictionary>,
    previous: Option<FrozenDictionary>,
}

impl TypeDictionary {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples a payload into the table.
    ///
    /// Call only for payloads that actually compressed; short payloads are
    /// ignored. Returns true if the sampling triggered a rebuild.
    pub fn observe(&mut self, payload: &[u8]) -> bool {
        if payload.len() <= MIN_SAMPLED_LEN {
            return false;
        }

        let mut offset = 0;
        while offset + SEQUENCE_LEN <= payload.len() {
            let mut sequence = [0u8; SEQUENCE_LEN];
            sequence.copy_from_slice(&payload[offset..offset + SEQUENCE_LEN]);

            self.clock += 1;
            let clock = self.clock;
            self.entries
                .entry(sequence)
                .and_modify(|e| {
                    e.frequency += 1;
                    e.last_used = clock;
                })
                .or_insert(DictionaryEntry {
                    sequence,
                    frequency: 1,
                    last_used: clock,
                });
            self.insertions += 1;
            offset += SAMPLE_STRIDE;
        }

        if self.insertions >= REBUILD_INTERVAL {
            self.rebuild();
            true
        } else {
            false
        }
    }

    /// Rebuilds the frozen dictionary from the current table.
    ///
    /// Entries are ranked by frequency (ties broken by recency), the table
    /// is truncated to the size bound, and the epoch advances.
    fn rebuild(&mut self) {
        self.insertions = 0;

        let mut ranked: Vec<DictionaryEntry> = self.entries.values().copied().collect();
        ranked.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then(b.last_used.cmp(&a.last_used))
        });
        ranked.truncate(MAX_ENTRIES);

        self.entries = ranked
            .iter()
            .map(|e| (e.sequence, *e))
            .collect();

        // Most frequent sequences go last: LZ backreferences reach the
        // dictionary tail more cheaply.
        let mut bytes = Vec::with_capacity(ranked.len() * SEQUENCE_LEN);
        for entry in ranked.iter().rev() {
            bytes.extend_from_slice(&entry.sequence);
        }

        let epoch = self.current.as_ref().map_or(0, |d| d.epoch) + 1;
        self.previous = self.current.take();
        self.current = Some(FrozenDictionary { epoch, bytes });
    }

    /// Current frozen dictionary, if one has been built.
    #[must_use]
    pub fn current(&self) -> Option<&FrozenDictionary> {
        self.current.as_ref()
    }

    /// Looks up the dictionary bytes for an epoch.
    ///
    /// Only the current and the immediately preceding epoch are held.
    #[must_use]
    pub fn for_epoch(&self, epoch: u32) -> Option<&[u8]> {
        if let Some(current) = &self.current {
            if current.epoch == epoch {
                return Some(&current.bytes);
            }
        }
        if let Some(previous) = &self.previous {
            if previous.epoch == epoch {
                return Some(&previous.bytes);
            }
        }
        None
    }

    /// Number of live entries in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no sequences have been observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
