//! WAT Transfer State Definitions
//!
//! Status ids are stable; they are persisted with every record.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transfer lifecycle status
///
/// Terminal states: COMPLETE (40), REJECTED (-10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum WatStatus {
    /// Logged, reservation held, host handshake not started
    RequestReceived = 0,

    /// Handshake with the validator in progress (persist-before-call)
    Initiated = 10,

    /// Validator returned the authorized amounts; ledger untouched
    Authorized = 20,

    /// Host cancelled before commit; pending amounts zeroed
    CancelReceived = 25,

    /// Ledger mutation durable; awaiting host acknowledgement
    Committed = 30,

    /// Terminal: acknowledged
    Complete = 40,

    /// Terminal: validator refused, nothing moved
    Rejected = -10,
}

impl WatStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, WatStatus::Complete | WatStatus::Rejected)
    }

    /// Ledger not yet settled; such a record is forced to COMMITTED on restart
    #[inline]
    pub fn is_unsettled(&self) -> bool {
        matches!(
            self,
            WatStatus::RequestReceived
                | WatStatus::Initiated
                | WatStatus::Authorized
                | WatStatus::CancelReceived
        )
    }

    /// States in which a host cancel is accepted
    #[inline]
    pub fn is_cancellable(&self) -> bool {
        matches!(self, WatStatus::RequestReceived | WatStatus::Initiated)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(WatStatus::RequestReceived),
            10 => Some(WatStatus::Initiated),
            20 => Some(WatStatus::Authorized),
            25 => Some(WatStatus::CancelReceived),
            30 => Some(WatStatus::Committed),
            40 => Some(WatStatus::Complete),
            -10 => Some(WatStatus::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WatStatus::RequestReceived => "REQUEST_RECEIVED",
            WatStatus::Initiated => "INITIATED",
            WatStatus::Authorized => "AUTHORIZED",
            WatStatus::CancelReceived => "CANCEL_RECEIVED",
            WatStatus::Committed => "COMMITTED",
            WatStatus::Complete => "COMPLETE",
            WatStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for WatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for WatStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        WatStatus::from_id(value).ok_or(())
    }
}

/// Why a transfer moved less than requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WatExceptionCode {
    #[default]
    None,
    /// Unsettled at restart; forced to COMMITTED with nothing transferred
    PowerFailure,
    /// Host cancel carrying the protocol's own reason code
    HostCancelled(u16),
    ValidatorRejected,
    InsufficientFunds,
    /// ON transfer would exceed the configured credit limit
    CreditLimitExceeded,
    /// Host authorized a reduced amount although reduction was not allowed
    ReductionNotAllowed,
}

impl WatExceptionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatExceptionCode::None => "NONE",
            WatExceptionCode::PowerFailure => "POWER_FAILURE",
            WatExceptionCode::HostCancelled(_) => "HOST_CANCELLED",
            WatExceptionCode::ValidatorRejected => "VALIDATOR_REJECTED",
            WatExceptionCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            WatExceptionCode::CreditLimitExceeded => "CREDIT_LIMIT_EXCEEDED",
            WatExceptionCode::ReductionNotAllowed => "REDUCTION_NOT_ALLOWED",
        }
    }
}

impl fmt::Display for WatExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatExceptionCode::HostCancelled(code) => write!(f, "HOST_CANCELLED({})", code),
            other => write!(f, "{}", other.as_str()),
        }
    }
}
