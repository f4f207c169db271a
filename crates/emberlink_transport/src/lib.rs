//! # EMBERLINK Transport - The Ember Protocol
//!
//! Reliable, fragmented, compressed, priority-aware transport over raw
//! UDP. Every subsystem of the game - combat, inventory, persistence,
//! voice, admin tooling - talks through this one stack and never touches
//! a header field directly.
//!
//! ## Architecture
//!
//! - **Protocol**: fixed 31-byte big-endian header, CRC32 integrity
//! - **Reliability**: sequence numbers, 32-bit ack bitfields,
//!   fixed-interval retransmission, RTT/jitter estimation
//! - **Fragmentation**: bounded-size fragments, out-of-order reassembly,
//!   timeout-based abandonment
//! - **Compression**: heuristic-gated LZ4 with per-type dictionaries;
//!   never grows a payload
//! - **Shaping**: batching, priority ordering, delta encoding, interest
//!   filtering, frequency control, bandwidth adaptation
//! - **Sessions**: handshake, heartbeat, reconnection with backoff,
//!   callback registries, queued send API
//!
//! ## Execution model
//!
//! Two contexts per endpoint: an I/O thread pushing raw datagrams through
//! bounded queues, and a processing context invoked once per tick that
//! drains them through the stack. Nothing on the tick path blocks; all
//! waiting is time-sliced polling against the tick timestamp.
//!
//! ## Example
//!
//! ```rust,ignore
//! use emberlink_transport::{Endpoint, TransportConfig};
//!
//! let config = TransportConfig::default();
//! let mut server = Endpoint::server("0.0.0.0:7777".parse()?, config)?;
//! loop {
//!     server.tick(std::time::Instant::now());
//!     // ... game tick ...
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod compress;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fragment;
pub mod protocol;
pub mod reliability;
pub mod session;
pub mod shaper;
pub mod sim;
pub mod tick;
pub mod transport;

// Re-exports for convenience
pub use compress::{AdaptiveCompressor, CompressionAlgorithm, CompressionStats};
pub use config::{InterestAreaConfig, TransportConfig};
pub use endpoint::Endpoint;
pub use error::{CompressError, ConfigError, DeliveryFailure, SendError, WireError};
pub use protocol::{
    ChannelId, Framer, PacketFlags, PacketHeader, PacketType, SequenceNumber, MAX_DATAGRAM_SIZE,
    PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use reliability::{ProtocolStats, ReliabilityEngine, RttEstimator};
pub use session::{
    CallbackHandle, ConnectionState, NullCipher, PacketCipher, ReceivedPacket, Session,
    SessionRole, StatsSnapshot,
};
pub use shaper::{InterestArea, OptimizationStats, ShapedPacket, TrafficShaper};
pub use sim::{LinkedPair, NetworkConditions, SimulatedLink};
pub use tick::{TickLoop, TickStats};
pub use transport::{IoPump, SocketStats, UdpTransport};
