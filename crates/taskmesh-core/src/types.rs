//! Core scalar types and protocol constants.

use serde::{Deserialize, Serialize};

/// Fixed-point value (×10,000 internally) used for reputation scores and
/// reward amounts. Integer arithmetic keeps settlement reproducible across
/// peers; floats never enter protocol computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixedPoint(i64);

impl FixedPoint {
    pub const SCALE: i64 = 10_000;
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(10_000);

    /// Create from float, truncating (not rounding).
    pub fn from_f64(val: f64) -> Self {
        Self((val * Self::SCALE as f64) as i64)
    }

    /// Create from raw scaled integer.
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Get the raw scaled integer value.
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Convert to f64 (for display/debugging only).
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Multiply two fixed-point values. Intermediate uses i128 to avoid
    /// overflow; truncation only on the final result.
    pub fn mul(self, other: Self) -> Self {
        let result = (self.0 as i128 * other.0 as i128) / Self::SCALE as i128;
        Self(result as i64)
    }

    /// Clamp to [min, max].
    pub fn clamp(self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }
}

impl std::fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.to_f64())
    }
}

/// Node identity — hex-encoded Ed25519 public key. Unique network-wide,
/// immutable once generated.
pub type NodeId = String;

/// Task identifier — SHA-256 hex digest of the canonical envelope body.
pub type TaskHash = String;

/// Message ID — SHA-256 hex digest of the signing body.
pub type MessageId = String;

/// Unix timestamp in milliseconds.
pub type Timestamp = i64;

/// Protocol constants. Values marked "policy" resolve Open Questions in the
/// design and are taken as configurable defaults by the structures that use
/// them.
pub mod constants {
    use super::FixedPoint;

    // Message format
    pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024; // 8 MiB
    pub const TIMESTAMP_TOLERANCE_MS: i64 = 5 * 60 * 1000; // 5 minutes
    pub const INLINE_PAYLOAD_LIMIT: usize = 1024 * 1024; // 1 MiB

    // Peer directory
    pub const PEER_ANNOUNCE_INTERVAL_MS: i64 = 5 * 60 * 1000; // 5 minutes
    pub const PEER_EXPIRY_MS: i64 = 30 * 60 * 1000; // 30 minutes

    // Gossip
    pub const DEDUP_CACHE_SIZE: usize = 100_000;
    pub const GOSSIP_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000; // 24 hours

    // Distribution
    pub const CHUNK_SIZE: usize = 64 * 1024; // 64 KiB
    /// Claims allowed per task = ceil(redundancy × overcommit). Policy: 1.0,
    /// so accepted claims never exceed the redundancy factor.
    pub const OVERCOMMIT_MARGIN: FixedPoint = FixedPoint::from_raw(10_000);
    pub const DEFAULT_REDUNDANCY: u32 = 3;
    pub const DEFAULT_QUORUM: u32 = 2;
    /// Settled envelopes are garbage-collected after this retention window.
    pub const SETTLEMENT_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

    // Sandbox defaults
    pub const DEFAULT_WALL_CLOCK_MS: u64 = 300_000; // 5 minutes
    pub const DEFAULT_CPU_MS: u64 = 300_000;
    pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 512 * 1024 * 1024; // 512 MiB

    // Reputation
    pub const INITIAL_REPUTATION: FixedPoint = FixedPoint::from_raw(5_000); // 0.5
    pub const NEUTRAL_REPUTATION: FixedPoint = FixedPoint::from_raw(5_000); // decay target
    pub const REPUTATION_FLOOR: FixedPoint = FixedPoint::ZERO;
    pub const REPUTATION_CAP: FixedPoint = FixedPoint::ONE;
    pub const WINNER_INCREMENT: FixedPoint = FixedPoint::from_raw(200); // 0.02
    pub const DISSENT_PENALTY: FixedPoint = FixedPoint::from_raw(500); // 0.05
    pub const NO_SHOW_PENALTY: FixedPoint = FixedPoint::from_raw(1_000); // 0.10
    pub const INACTIVITY_DECAY: FixedPoint = FixedPoint::from_raw(200); // 0.02/month
    pub const INACTIVITY_THRESHOLD_MS: i64 = 30 * 24 * 60 * 60 * 1000;
    /// Trust floor applied when claiming high-value tasks.
    pub const ELIGIBILITY_FLOOR: FixedPoint = FixedPoint::from_raw(2_500); // 0.25
    /// Reward at or above which a task counts as high-value.
    pub const HIGH_VALUE_REWARD: FixedPoint = FixedPoint::from_raw(1_000_000); // 100.0

    // Error handling
    pub const BACKOFF_INITIAL_MS: i64 = 500;
    pub const BACKOFF_MAX_MS: i64 = 10 * 60 * 1000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_point_from_f64_truncates() {
        assert_eq!(FixedPoint::from_f64(0.67891).raw(), 6789);
        assert_eq!(FixedPoint::from_f64(0.5).raw(), 5000);
        assert_eq!(FixedPoint::from_f64(1.0).raw(), 10000);
        assert_eq!(FixedPoint::from_f64(0.0).raw(), 0);
    }

    #[test]
    fn fixed_point_mul() {
        let a = FixedPoint::from_f64(0.6);
        let b = FixedPoint::from_f64(0.5);
        assert_eq!(a.mul(b).raw(), 3000); // 0.6 × 0.5 = 0.3
    }

    #[test]
    fn fixed_point_clamp() {
        let val = FixedPoint::from_f64(1.5);
        let clamped = val.clamp(constants::REPUTATION_FLOOR, constants::REPUTATION_CAP);
        assert_eq!(clamped, constants::REPUTATION_CAP);

        let val = FixedPoint::from_f64(-0.3);
        let clamped = val.clamp(constants::REPUTATION_FLOOR, constants::REPUTATION_CAP);
        assert_eq!(clamped, constants::REPUTATION_FLOOR);
    }

    #[test]
    fn overcommit_margin_is_unity() {
        // Claim bound = redundancy × 1.0, so claims never exceed redundancy.
        assert_eq!(constants::OVERCOMMIT_MARGIN, FixedPoint::ONE);
    }
}
