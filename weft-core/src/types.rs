//! Fundamental identifier types used throughout the mesh.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use uuid::Uuid;

/// System-wide-unique identifier of an endpoint in the mesh.
///
/// Equality is bytewise; the ordering is total and used for tie-breaking
/// between routes of equal length.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct EndpointId(Uuid);

impl EndpointId {
    /// Generate a new unique endpoint ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an endpoint ID from a UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to the 16-byte wire representation.
    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Create from the 16-byte wire representation.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EndpointId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Per-link message sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Create a sequence number with the given value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The next sequence number, wrapping on overflow.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Compares two 64-bit version counters, treating the value space as a ring.
///
/// Returns `true` if `a` is newer than `b`. Wraparound never occurs in
/// practice; the modular comparison keeps the behavior defined if it does.
pub fn version_newer(a: u64, b: u64) -> bool {
    a != b && a.wrapping_sub(b) < u64::MAX / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_id_roundtrip() {
        let id = EndpointId::generate();
        assert_eq!(id, EndpointId::from_bytes(id.to_bytes()));
    }

    #[test]
    fn endpoint_id_order_is_total() {
        let a = EndpointId::generate();
        let b = EndpointId::generate();
        assert_ne!(a, b);
        assert!(a < b || b < a);
    }

    #[test]
    fn sequence_number_next() {
        let seq = SequenceNumber::new(41);
        assert_eq!(seq.next().value(), 42);
        assert_eq!(SequenceNumber::new(u64::MAX).next().value(), 0);
    }

    #[test]
    fn version_comparison_wraps() {
        assert!(version_newer(2, 1));
        assert!(!version_newer(1, 2));
        assert!(!version_newer(7, 7));
        assert!(version_newer(1, u64::MAX));
    }
}
