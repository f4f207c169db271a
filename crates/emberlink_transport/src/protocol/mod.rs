//! # Wire Protocol
//!
//! The fixed binary header every Ember Protocol datagram starts with, and
//! the framer that moves packets on and off the wire.
//!
//! ## Modules
//!
//! - `header`: field layout, packet types, flag bitmask
//! - `framing`: encode/decode with CRC32 integrity verification

mod framing;
mod header;

pub use framing::{Framer, MAX_DATAGRAM_SIZE};
pub use header::{PacketFlags, PacketHeader, PacketType};

/// Sequence number type alias.
pub type SequenceNumber = u32;

/// Logical channel identifier type alias.
pub type ChannelId = u16;

/// Fixed signature identifying the Ember Protocol.
pub const PROTOCOL_MAGIC: [u8; 4] = *b"EMBR";

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;
