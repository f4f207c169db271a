//! # Adaptive Compression
//!
//! Decides per payload whether compression pays, picks a codec variant,
//! and guarantees the wire never carries a grown payload.
//!
//! ## Design
//!
//! - Two cheap heuristics run before any real compression: unique-byte
//!   ratio and repeated-trigram count over a fixed sample window
//! - The algorithm family maps onto the LZ4 block codec, plain or
//!   dictionary-assisted
//! - Output not smaller than input ⇒ the original is kept and the attempt
//!   is counted as skipped
//! - Per-packet-type dictionaries learn recurring sequences from every
//!   successfully compressed payload (see [`dictionary`])
//! - Statistics live under their own lock, away from the hot byte path

pub mod dictionary;

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CompressError;
use crate::protocol::PacketType;

use self::dictionary::TypeDictionary;

/// Compression strategy selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Compression disabled entirely.
    None,
    /// Plain LZ4, no dictionary, heuristic-gated.
    Fast,
    /// LZ4 with a warm per-type dictionary, heuristic-gated.
    #[default]
    Balanced,
    /// LZ4 with dictionary, attempted even when heuristics are lukewarm.
    Max,
}

/// Byte count sampled by the heuristics.
const SAMPLE_WINDOW: usize = 256;

/// Unique-byte ratio at or below which a payload looks compressible.
const MAX_UNIQUE_RATIO: f32 = 0.5;

/// Repeated-trigram count at or above which a payload looks compressible.
const MIN_TRIGRAM_REPEATS: usize = 16;

/// Blob method byte: plain LZ4.
const METHOD_PLAIN: u8 = 0;

/// Blob method byte: dictionary-assisted LZ4, followed by the epoch.
const METHOD_DICT: u8 = 1;

/// Compression counters, updated under a dedicated lock.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompressionStats {
    /// Payloads shrunk and sent compressed.
    pub packets_compressed: u64,
    /// Payloads left alone (too small, heuristics declined, or output
    /// would not have been smaller).
    pub packets_skipped: u64,
    /// Payloads successfully decompressed on receive.
    pub packets_decompressed: u64,
    /// Original bytes of every compressed payload.
    pub bytes_original: u64,
    /// Wire bytes of every compressed payload.
    pub bytes_compressed: u64,
    /// Cumulative compression time in microseconds.
    pub total_time_us: u64,
}

impl CompressionStats {
    /// Running average ratio of compressed to original size.
    #[must_use]
    pub fn average_ratio(&self) -> f32 {
        if self.bytes_original == 0 {
            return 1.0;
        }
        self.bytes_compressed as f32 / self.bytes_original as f32
    }

    /// Running average time spent per compressed payload.
    #[must_use]
    pub fn average_time_us(&self) -> f32 {
        if self.packets_compressed == 0 {
            return 0.0;
        }
        self.total_time_us as f32 / self.packets_compressed as f32
    }
}

/// Returns the heuristic sample window of a payload.
#[inline]
fn sample(payload: &[u8]) -> &[u8] {
    &payload[..payload.len().min(SAMPLE_WINDOW)]
}

/// Fraction of distinct byte values inside the sample.
///
/// Low uniqueness implies compressibility.
#[must_use]
fn unique_byte_ratio(sample: &[u8]) -> f32 {
    if sample.is_empty() {
        return 1.0;
    }
    let mut seen = [false; 256];
    let mut unique = 0usize;
    for &byte in sample {
        if !seen[byte as usize] {
            seen[byte as usize] = true;
            unique += 1;
        }
    }
    unique as f32 / sample.len() as f32
}

/// Number of 3-byte sequences inside the sample that repeat an earlier one.
///
/// High repetition implies compressibility.
#[must_use]
fn repeated_trigram_count(sample: &[u8]) -> usize {
    if sample.len() < 3 {
        return 0;
    }
    let mut seen: HashSet<[u8; 3]> = HashSet::with_capacity(sample.len());
    let mut repeats = 0usize;
    for window in sample.windows(3) {
        let trigram = [window[0], window[1], window[2]];
        if !seen.insert(trigram) {
            repeats += 1;
        }
    }
    repeats
}

/// Heuristic-driven payload compressor with per-type dictionaries.
///
/// Shared by every connection of an endpoint; the dictionaries and the
/// statistics are the only contended state, each behind its own lock.
pub struct AdaptiveCompressor {
    algorithm: CompressionAlgorithm,
    min_size: usize,
    use_dictionary: bool,
    dictionaries: Mutex<HashMap<u8, TypeDictionary>>,
    stats: Mutex<CompressionStats>,
}

impl AdaptiveCompressor {
    /// Creates a compressor with the given strategy.
    #[must_use]
    pub fn new(algorithm: CompressionAlgorithm, min_size: usize, use_dictionary: bool) -> Self {
        Self {
            algorithm,
            min_size,
            use_dictionary,
            dictionaries: Mutex::new(HashMap::new()),
            stats: Mutex::new(CompressionStats::default()),
        }
    }

    /// Returns true if the heuristics consider the payload worth a real
    /// compression attempt.
    #[must_use]
    pub fn should_compress(&self, payload: &[u8]) -> bool {
        if payload.len() < self.min_size {
            return false;
        }
        if self.algorithm == CompressionAlgorithm::Max {
            return true;
        }
        let window = sample(payload);
        unique_byte_ratio(window) <= MAX_UNIQUE_RATIO
            || repeated_trigram_count(window) >= MIN_TRIGRAM_REPEATS
    }

    /// Attempts to compress a payload.
    ///
    /// Returns the wire blob when compression shrank the payload, `None`
    /// when the original must be sent instead. Never returns a blob larger
    /// than the input.
    pub fn compress(&self, packet_type: PacketType, payload: &[u8]) -> Option<Vec<u8>> {
        if self.algorithm == CompressionAlgorithm::None {
            return None;
        }
        if !self.should_compress(payload) {
            self.stats.lock().packets_skipped += 1;
            return None;
        }

        let started = Instant::now();
        let blob = self.encode_blob(packet_type, payload);
        let elapsed_us = started.elapsed().as_micros() as u64;

        let mut stats = self.stats.lock();
        if blob.len() >= payload.len() {
            stats.packets_skipped += 1;
            return None;
        }
        stats.packets_compressed += 1;
        stats.bytes_original += payload.len() as u64;
        stats.bytes_compressed += blob.len() as u64;
        stats.total_time_us += elapsed_us;
        drop(stats);

        if self.use_dictionary {
            self.dictionaries
                .lock()
                .entry(packet_type.0)
                .or_default()
                .observe(payload);
        }
        Some(blob)
    }

    /// Builds the compressed blob for a payload.
    fn encode_blob(&self, packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
        let use_dict = self.use_dictionary
            && matches!(
                self.algorithm,
                CompressionAlgorithm::Balanced | CompressionAlgorithm::Max
            );

        if use_dict {
            let dictionaries = self.dictionaries.lock();
            if let Some(frozen) = dictionaries
                .get(&packet_type.0)
                .and_then(TypeDictionary::current)
            {
                let mut blob = Vec::with_capacity(payload.len() / 2 + 9);
                blob.push(METHOD_DICT);
                blob.extend_from_slice(&frozen.epoch.to_be_bytes());
                blob.extend_from_slice(&lz4_flex::block::compress_prepend_size_with_dict(
                    payload,
                    &frozen.bytes,
                ));
                return blob;
            }
        }

        let mut blob = Vec::with_capacity(payload.len() / 2 + 1);
        blob.push(METHOD_PLAIN);
        blob.extend_from_slice(&lz4_flex::block::compress_prepend_size(payload));
        blob
    }

    /// Undoes the compression step of an incoming payload.
    ///
    /// Failures are transport-recoverable: the caller drops the packet and
    /// counts it.
    pub fn decompress(&self, packet_type: PacketType, blob: &[u8]) -> Result<Vec<u8>, CompressError> {
        let (&method, body) = blob.split_first().ok_or(CompressError::Corrupt)?;

        let payload = match method {
            METHOD_PLAIN => lz4_flex::block::decompress_size_prepended(body)
                .map_err(|_| CompressError::Corrupt)?,
            METHOD_DICT => {
                if body.len() < 4 {
                    return Err(CompressError::Corrupt);
                }
                let epoch = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let dictionaries = self.dictionaries.lock();
                let dict = dictionaries
                    .get(&packet_type.0)
                    .and_then(|t| t.for_epoch(epoch))
                    .ok_or(CompressError::UnknownDictionaryEpoch(epoch))?;
                lz4_flex::block::decompress_size_prepended_with_dict(&body[4..], dict)
                    .map_err(|_| CompressError::Corrupt)?
            }
            _ => return Err(CompressError::Corrupt),
        };

        self.stats.lock().packets_decompressed += 1;
        // Mirror the sender's sampling so both ends converge on the same
        // dictionary content.
        if self.use_dictionary {
            self.dictionaries
                .lock()
                .entry(packet_type.0)
                .or_default()
                .observe(&payload);
        }
        Ok(payload)
    }

    /// Snapshot of the compression counters.
    #[must_use]
    pub fn stats(&self) -> CompressionStats {
        *self.stats.lock()
    }

    /// Resets the counters to zero.
    pub fn reset_stats(&self) {
        *self.stats.lock() = CompressionStats::default();
    }

    /// Configured algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor(algorithm: CompressionAlgorithm) -> AdaptiveCompressor {
        AdaptiveCompressor::new(algorithm, 64, true)
    }

    fn patterned(len: usize) -> Vec<u8> {
        // Repeating 4-byte pattern, highly compressible.
        (0..len).map(|i| [0xDE, 0xAD, 0xBE, 0xEF][i % 4]).collect()
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_heuristics() {
        let patterned = patterned(512);
        let window = sample(&patterned);
        assert!(unique_byte_ratio(window) < 0.1);
        assert!(repeated_trigram_count(window) > MIN_TRIGRAM_REPEATS);

        let random = random_bytes(512);
        let window = sample(&random);
        assert!(unique_byte_ratio(window) > MAX_UNIQUE_RATIO);
        assert!(repeated_trigram_count(window) < MIN_TRIGRAM_REPEATS);
    }

    #[test]
    fn test_round_trip_patterned() {
        let comp = compressor(CompressionAlgorithm::Fast);
        let payload = patterned(10_000);

        let blob = comp.compress(PacketType(20), &payload).expect("compressible");
        assert!(blob.len() < payload.len());

        let restored = comp.decompress(PacketType(20), &blob).unwrap();
        assert_eq!(restored, payload);

        let stats = comp.stats();
        assert_eq!(stats.packets_compressed, 1);
        assert!(stats.average_ratio() < 0.5);
    }

    #[test]
    fn test_random_payload_skipped() {
        let comp = compressor(CompressionAlgorithm::Balanced);
        let payload = random_bytes(10_000);

        assert!(comp.compress(PacketType(20), &payload).is_none());
        let stats = comp.stats();
        assert_eq!(stats.packets_compressed, 0);
        assert_eq!(stats.packets_skipped, 1);
    }

    #[test]
    fn test_below_minimum_size_skipped() {
        let comp = compressor(CompressionAlgorithm::Balanced);
        assert!(comp.compress(PacketType(20), &[0u8; 63]).is_none());
        assert_eq!(comp.stats().packets_skipped, 1);
    }

    #[test]
    fn test_algorithm_none_disables() {
        let comp = compressor(CompressionAlgorithm::None);
        let payload = patterned(1024);
        assert!(comp.compress(PacketType(20), &payload).is_none());
        // Disabled is not an attempt.
        assert_eq!(comp.stats().packets_skipped, 0);
    }

    #[test]
    fn test_never_grows() {
        let comp = compressor(CompressionAlgorithm::Max);
        // Max attempts even incompressible input; the result must still
        // never be accepted when it would grow the payload.
        let payload = random_bytes(256);
        if let Some(blob) = comp.compress(PacketType(20), &payload) {
            assert!(blob.len() < payload.len());
        }
    }

    #[test]
    fn test_dictionary_round_trip_after_warmup() {
        let comp = compressor(CompressionAlgorithm::Balanced);
        let payload = patterned(4096);

        // Warm the per-type dictionary past a rebuild.
        for _ in 0..12 {
            let _ = comp.compress(PacketType(30), &payload);
        }

        let blob = comp.compress(PacketType(30), &payload).expect("compressible");
        assert_eq!(blob[0], METHOD_DICT);
        let restored = comp.decompress(PacketType(30), &blob).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_unknown_epoch_rejected() {
        let sender = compressor(CompressionAlgorithm::Balanced);
        let receiver = compressor(CompressionAlgorithm::Balanced);
        let payload = patterned(4096);

        for _ in 0..12 {
            let _ = sender.compress(PacketType(30), &payload);
        }
        let blob = sender.compress(PacketType(30), &payload).expect("compressible");
        assert_eq!(blob[0], METHOD_DICT);

        // The receiver never saw the traffic that built the dictionary.
        assert!(matches!(
            receiver.decompress(PacketType(30), &blob),
            Err(CompressError::UnknownDictionaryEpoch(_))
        ));
    }

    #[test]
    fn test_corrupt_blob_rejected() {
        let comp = compressor(CompressionAlgorithm::Fast);
        assert!(matches!(
            comp.decompress(PacketType(20), &[]),
            Err(CompressError::Corrupt)
        ));
        assert!(matches!(
            comp.decompress(PacketType(20), &[9, 1, 2, 3]),
            Err(CompressError::Corrupt)
        ));
    }

    #[test]
    fn test_mirrored_compressors_stay_in_sync() {
        let a = compressor(CompressionAlgorithm::Balanced);
        let b = compressor(CompressionAlgorithm::Balanced);
        let payload = patterned(4096);

        // Every blob a produces, b decompresses; both observe the same
        // payloads, so dictionary epochs advance in lockstep.
        for _ in 0..30 {
            if let Some(blob) = a.compress(PacketType(40), &payload) {
                let restored = b.decompress(PacketType(40), &blob).unwrap();
                assert_eq!(restored, payload);
            }
        }
    }
}
