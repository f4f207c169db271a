//! # Transport Configuration
//!
//! Typed configuration for every tunable of the stack, loadable from TOML
//! at startup. `validate` rejects bad settings synchronously with no side
//! effects; a config object that validated once never fails later.

use std::time::Duration;

use emberlink_core::Position;
use serde::{Deserialize, Serialize};

use crate::compress::CompressionAlgorithm;
use crate::error::ConfigError;
use crate::protocol::{PacketHeader, MAX_DATAGRAM_SIZE};
use crate::shaper::{InterestArea, ShaperConfig};

/// Serializable interest sphere.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterestAreaConfig {
    /// Sphere center as `[x, y, z]`.
    pub center: [f32; 3],
    /// Sphere radius in world units.
    pub radius: f32,
}

impl InterestAreaConfig {
    /// Converts into the shaper's runtime form.
    #[must_use]
    pub fn to_area(self) -> InterestArea {
        InterestArea {
            center: Position::new(self.center[0], self.center[1], self.center[2]),
            radius: self.radius,
        }
    }
}

/// Complete transport configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Compression strategy.
    pub algorithm: CompressionAlgorithm,
    /// Payloads below this size are never compressed.
    pub min_size_to_compress: usize,
    /// Maintain per-type dictionaries of recurring sequences.
    pub use_dictionary_compression: bool,
    /// Resend attempts before a reliable packet is abandoned.
    pub max_reliable_resends: u32,
    /// Fixed interval between resends of one reliable packet.
    pub resend_interval_ms: u64,
    /// Interval between keep-alive heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before the link is considered lost.
    pub missed_heartbeat_limit: u32,
    /// Handshake and fragment-assembly timeout.
    pub connection_timeout_ms: u64,
    /// Attempt to reconnect after a lost link.
    pub auto_reconnect: bool,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; later attempts stretch linearly.
    pub reconnect_base_delay_ms: u64,
    /// Per-fragment payload bound.
    pub fragment_size: usize,
    /// Batch flush threshold in bytes.
    pub batch_size_limit: usize,
    /// Batch flush deadline.
    pub max_batch_delay_ms: u64,
    /// Bandwidth target in kbps; zero derives one from observed traffic.
    pub bandwidth_target_kbps: u32,
    /// Number of distinct priority levels.
    pub priority_levels: u8,
    /// Minimum spacing between updates of one entity.
    pub min_entity_update_interval_ms: u64,
    /// Interest sphere; absent disables filtering.
    pub interest_area: Option<InterestAreaConfig>,
    /// Run payloads through the negotiated cipher hook.
    pub encryption_enabled: bool,
    /// Accumulate small unreliable packets into batches.
    pub enable_batching: bool,
    /// Delta-encode entity updates.
    pub enable_delta_encoding: bool,
    /// Enforce per-entity update spacing.
    pub enable_frequency_control: bool,
    /// Scale traffic against the bandwidth target.
    pub enable_bandwidth_adaptation: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Balanced,
            min_size_to_compress: 64,
            use_dictionary_compression: true,
            max_reliable_resends: 5,
            resend_interval_ms: 100,
            heartbeat_interval_ms: 1000,
            missed_heartbeat_limit: 3,
            connection_timeout_ms: 5000,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 500,
            fragment_size: 1200,
            batch_size_limit: 1024,
            max_batch_delay_ms: 50,
            bandwidth_target_kbps: 0,
            priority_levels: 4,
            min_entity_update_interval_ms: 50,
            interest_area: None,
            encryption_enabled: false,
            enable_batching: true,
            enable_delta_encoding: true,
            enable_frequency_control: true,
            enable_bandwidth_adaptation: true,
        }
    }
}

impl TransportConfig {
    /// Checks every setting, rejecting invalid combinations.
    ///
    /// Called before a config is applied; a failure leaves the running
    /// stack untouched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let header_room = PacketHeader::BASE_SIZE + PacketHeader::TIMESTAMP_SIZE;
        if self.fragment_size < 64 || self.fragment_size + header_room > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::InvalidFragmentSize(self.fragment_size));
        }
        if self.priority_levels == 0 || self.priority_levels > 8 {
            return Err(ConfigError::InvalidPriorityLevels(self.priority_levels));
        }
        if self.resend_interval_ms == 0 {
            return Err(ConfigError::InvalidTiming("resend interval must be nonzero"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidTiming("heartbeat interval must be nonzero"));
        }
        if self.connection_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::InvalidTiming(
                "connection timeout must exceed the heartbeat interval",
            ));
        }
        if self.missed_heartbeat_limit == 0 {
            return Err(ConfigError::InvalidTiming("missed heartbeat limit must be nonzero"));
        }
        if self.batch_size_limit < 16 || self.batch_size_limit > self.fragment_size {
            return Err(ConfigError::InvalidBatchLimit(self.batch_size_limit));
        }
        if self.min_size_to_compress < 16 {
            return Err(ConfigError::InvalidMinCompressSize(self.min_size_to_compress));
        }
        if let Some(area) = &self.interest_area {
            if area.radius <= 0.0 || !area.radius.is_finite() {
                return Err(ConfigError::InvalidInterestRadius(area.radius));
            }
        }
        Ok(())
    }

    /// Parses a TOML document into a validated configuration.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)
            .map_err(|_| ConfigError::InvalidTiming("unparseable configuration document"))?;
        config.validate()?;
        Ok(config)
    }

    /// Resend interval as a duration.
    #[must_use]
    pub const fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    /// Heartbeat interval as a duration.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Connection timeout as a duration.
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Builds the shaper's view of this configuration.
    #[must_use]
    pub fn shaper_config(&self) -> ShaperConfig {
        ShaperConfig {
            enable_batching: self.enable_batching,
            enable_delta: self.enable_delta_encoding,
            enable_frequency_control: self.enable_frequency_control,
            enable_bandwidth_adaptation: self.enable_bandwidth_adaptation,
            batch_size_limit: self.batch_size_limit,
            max_batch_delay: Duration::from_millis(self.max_batch_delay_ms),
            bandwidth_target_kbps: self.bandwidth_target_kbps,
            priority_levels: self.priority_levels,
            min_entity_update_interval: Duration::from_millis(self.min_entity_update_interval_ms),
            interest_area: self.interest_area.map(InterestAreaConfig::to_area),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn test_fragment_size_bounds() {
        let mut config = TransportConfig::default();
        config.fragment_size = 32;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFragmentSize(32))
        ));

        config.fragment_size = MAX_DATAGRAM_SIZE;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timing_relations() {
        let mut config = TransportConfig::default();
        config.connection_timeout_ms = 500;
        config.heartbeat_interval_ms = 1000;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTiming(_))));
    }

    #[test]
    fn test_priority_levels_range() {
        let mut config = TransportConfig::default();
        config.priority_levels = 0;
        assert!(config.validate().is_err());
        config.priority_levels = 9;
        assert!(config.validate().is_err());
        config.priority_levels = 8;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_interest_radius() {
        let mut config = TransportConfig::default();
        config.interest_area = Some(InterestAreaConfig {
            center: [0.0, 0.0, 0.0],
            radius: -5.0,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidInterestRadius(_))
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let text = r#"
            algorithm = "fast"
            fragment_size = 900
            batch_size_limit = 512
            heartbeat_interval_ms = 250
            connection_timeout_ms = 2000

            [interest_area]
            center = [0.0, 10.0, 0.0]
            radius = 250.0
        "#;
        let config = TransportConfig::from_toml_str(text).unwrap();
        assert_eq!(config.algorithm, CompressionAlgorithm::Fast);
        assert_eq!(config.fragment_size, 900);
        assert_eq!(config.heartbeat_interval_ms, 250);
        // Unspecified fields keep their defaults.
        assert_eq!(config.max_reliable_resends, 5);
        assert!((config.interest_area.unwrap().radius - 250.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(TransportConfig::from_toml_str("algorithm = \"quantum\"").is_err());
        assert!(TransportConfig::from_toml_str("fragment_size = 1").is_err());
    }
}
