//! # Transport Error Types
//!
//! The taxonomy follows how far an error is allowed to travel:
//!
//! - [`WireError`] and [`CompressError`] are transport-recoverable. The
//!   offending packet is dropped and counted; they never cross the public
//!   API boundary.
//! - [`DeliveryFailure`] is fatal to one channel and is surfaced through the
//!   error callback, never thrown.
//! - [`ConfigError`] is rejected synchronously at the configuration call
//!   with no side effects.

use thiserror::Error;

use crate::protocol::{ChannelId, SequenceNumber};

/// Errors produced while decoding a datagram into a packet.
///
/// All variants are per-packet and non-fatal: the packet is silently
/// dropped, no ack is generated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Magic or version mismatch, truncated header, or inconsistent
    /// fragment fields.
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    /// The checksum computed over header+payload differs from the
    /// transmitted one.
    #[error("checksum mismatch: transmitted {transmitted:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header.
        transmitted: u32,
        /// Checksum computed by the receiver.
        computed: u32,
    },
}

/// Errors produced while undoing the adaptive compression step.
///
/// Transport-recoverable: the payload is dropped and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressError {
    /// The compressed blob is truncated or does not decode.
    #[error("corrupt compressed payload")]
    Corrupt,

    /// The blob references a dictionary epoch this endpoint no longer
    /// (or does not yet) hold.
    #[error("unknown dictionary epoch {0}")]
    UnknownDictionaryEpoch(u32),
}

/// A reliable packet exhausted its resend budget.
///
/// Fatal to the channel, not to the connection; delivered through the
/// error callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("reliable delivery failed on channel {channel}: sequence {sequence} exceeded {resends} resends")]
pub struct DeliveryFailure {
    /// Channel that lost the packet.
    pub channel: ChannelId,
    /// Sequence number of the abandoned packet.
    pub sequence: SequenceNumber,
    /// Number of resend attempts made.
    pub resends: u32,
}

/// Errors rejected synchronously when applying configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Fragment size must leave room for the header inside a datagram.
    #[error("fragment size {0} outside supported range")]
    InvalidFragmentSize(usize),

    /// Zero or out-of-range priority level count.
    #[error("priority levels {0} outside supported range 1..=8")]
    InvalidPriorityLevels(u8),

    /// A timer was configured to zero or to a nonsensical relation.
    #[error("invalid timing: {0}")]
    InvalidTiming(&'static str),

    /// Batch size limit larger than what a single send can carry.
    #[error("batch size limit {0} outside supported range")]
    InvalidBatchLimit(usize),

    /// Interest radius must be positive when an area is configured.
    #[error("interest radius must be positive, got {0}")]
    InvalidInterestRadius(f32),

    /// Minimum compress size below the dictionary sampling floor.
    #[error("minimum compress size {0} below floor of 16 bytes")]
    InvalidMinCompressSize(usize),
}

/// Errors returned by the queued send API.
///
/// A send is accepted or rejected immediately; acceptance means queued,
/// not delivered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The session is not in a state that accepts application traffic.
    #[error("session not connected")]
    NotConnected,

    /// Payload larger than the maximum logical packet size.
    #[error("payload of {0} bytes exceeds maximum logical packet size")]
    PayloadTooLarge(usize),

    /// The channel was marked degraded after a delivery failure.
    #[error("channel {0} is degraded")]
    ChannelDegraded(ChannelId),
}
