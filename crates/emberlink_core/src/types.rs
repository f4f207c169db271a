//! # Shared Types
//!
//! Identity and spatial types referenced on both sides of the transport
//! boundary. They must stay `Pod`: the traffic shaper snapshots them and
//! the interest filter compares them without any conversion step.

use bytemuck::{Pod, Zeroable};

/// Unique identifier for a replicated entity.
///
/// Assigned by the gameplay layer; the transport treats it as opaque and
/// only uses it to key per-entity shaping state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct EntityId(pub u32);

impl EntityId {
    /// Invalid/null entity ID.
    pub const NULL: Self = Self(u32::MAX);

    /// Returns true if this is the null ID.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u32::MAX
    }
}

/// Position in world space.
///
/// Padded to 16 bytes so arrays of positions stay SIMD-friendly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Position {
    /// X coordinate in world space.
    pub x: f32,
    /// Y coordinate in world space.
    pub y: f32,
    /// Z coordinate in world space.
    pub z: f32,
    /// Padding for alignment.
    pub _padding: f32,
}

impl Position {
    /// Creates a new position.
    #[inline]
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            x,
            y,
            z,
            _padding: 0.0,
        }
    }

    /// Returns the squared distance to another position.
    ///
    /// Avoids the sqrt call for radius comparisons.
    #[inline]
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_null() {
        assert!(EntityId::NULL.is_null());
        assert!(!EntityId(0).is_null());
    }

    #[test]
    fn test_distance_squared() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert!((a.distance_squared(b) - 25.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_position_layout() {
        assert_eq!(std::mem::size_of::<Position>(), 16);
    }
}
