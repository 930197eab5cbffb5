//! Core types used throughout the system
//!
//! Identifiers shared by the coordinator, the transaction history and the
//! transfer sagas.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Transaction ID - unique across every transaction kind in the process.
///
/// # Constraints:
/// - **Monotonic**: assigned by the id provider, never reused across restarts
/// - **Zero**: means "not yet logged"
pub type TransactionId = u64;

/// Per-kind log sequence (monotonic within one transaction log)
pub type LogSequence = u64;

/// Machine-local device identifier recorded on every transaction
pub type DeviceId = u32;

/// Concrete transaction record kinds, one transaction log each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Wager account transfer off the EGM
    WatOff,
    /// Wager account transfer onto the EGM
    WatOn,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::WatOff => "WatOff",
            TransactionKind::WatOn => "WatOn",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque reservation ("bank transaction") token issued by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken(Ulid);

impl ReservationToken {
    /// Generate a fresh token
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn inner(&self) -> Ulid {
        self.0
    }
}

impl Default for ReservationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReservationToken {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

const FAMILY_MASK: u128 = u64::MAX as u128;

/// Stable identity of a coordinator client
///
/// Requestors keep the same id across restarts so they can find a
/// reservation they held before power was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestorId(Ulid);

impl RequestorId {
    /// Well-known id from a fixed 128-bit value
    pub const fn from_u128(value: u128) -> Self {
        Self(Ulid(value))
    }

    /// Random id for short-lived requestors
    pub fn random() -> Self {
        Self(Ulid::new())
    }

    /// Fresh id belonging to `family`
    ///
    /// The low 64 bits carry the family, the high 64 bits are random, so
    /// every instance is distinct but can still be traced back to its owner.
    pub fn instance_of(family: RequestorId) -> Self {
        let nonce = (Ulid::new().0 as u64).max(1) as u128;
        Self(Ulid((nonce << 64) | (family.0.0 & FAMILY_MASK)))
    }

    /// Whether this id is `family` itself or an instance of it
    #[inline]
    pub fn belongs_to(&self, family: RequestorId) -> bool {
        self.0.0 & FAMILY_MASK == family.0.0 & FAMILY_MASK
    }

    /// The empty id, rejected by the coordinator
    pub const fn nil() -> Self {
        Self(Ulid(0))
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.0.0 == 0
    }
}

impl fmt::Display for RequestorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of one grant handoff (dispatcher → requestor → retrieve)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrantId(Ulid);

impl GrantId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for GrantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
