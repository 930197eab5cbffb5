//! WAT Core Types
//!
//! Transaction records for transfers off and onto the EGM.
//!
//! # Amount invariant
//!
//! Per category, at every observable state:
//!
//! ```text
//! 0 <= transferred <= authorized <= requested
//! ```
//!
//! [`TransferAmounts`] is the only way to change the three amount sets, and
//! every mutator preserves the ordering.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::state::{WatExceptionCode, WatStatus};
use crate::core_types::{DeviceId, ReservationToken, TransactionId, TransactionKind};
use crate::history::{LoggedTransaction, TransactionBase, TransactionEntry};
use crate::money::Amounts;

/// Who started the transfer
///
/// Derived from the host request id: empty means machine-initiated. Never
/// stored, and fixed for the lifetime of a record because the request id
/// cannot change after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    MachineInitiated,
    HostInitiated,
}

/// Reason for moving value off the EGM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransferOutReason {
    /// Patron cash-out from the credit meter
    #[default]
    CashOut,
    /// Bonus award paid straight to the account
    BonusPay,
    /// Jackpot-sized win paid to the account
    LargeWin,
    /// Game win paid to the account instead of the credit meter
    CashWin,
}

impl TransferOutReason {
    /// Whether the transfer draws from the patron's credit balance
    ///
    /// Wins and bonuses are paid to the account without passing through the
    /// credit meter, so they leave the ledger untouched.
    #[inline]
    pub fn affects_balance(&self) -> bool {
        matches!(self, TransferOutReason::CashOut)
    }
}

/// Requested / authorized / transferred amounts of one transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAmounts {
    requested: Amounts,
    authorized: Amounts,
    transferred: Amounts,
}

impl TransferAmounts {
    pub fn new(requested: Amounts) -> Self {
        Self {
            requested,
            authorized: Amounts::ZERO,
            transferred: Amounts::ZERO,
        }
    }

    pub fn requested(&self) -> Amounts {
        self.requested
    }

    pub fn authorized(&self) -> Amounts {
        self.authorized
    }

    pub fn transferred(&self) -> Amounts {
        self.transferred
    }

    /// Set the authorized amounts, clamped to the request
    ///
    /// Returns `false` when clamping was needed.
    pub fn authorize(&mut self, amounts: Amounts) -> bool {
        let clamped = amounts.min(&self.requested);
        self.authorized = clamped;
        self.transferred = self.transferred.min(&self.authorized);
        clamped == amounts
    }

    /// Zero what is pending (authorized and anything derived from it)
    pub(crate) fn clear_authorized(&mut self) {
        self.authorized = Amounts::ZERO;
        self.transferred = Amounts::ZERO;
    }

    pub(crate) fn clear_transferred(&mut self) {
        self.transferred = Amounts::ZERO;
    }

    /// Ledger mutation applied: transferred = authorized
    pub(crate) fn settle(&mut self) {
        self.transferred = self.authorized;
    }

    /// Reduce the request to what is available
    pub(crate) fn cap_requested(&mut self, available: &Amounts) {
        self.requested = self.requested.min(available);
        self.authorized = self.authorized.min(&self.requested);
        self.transferred = self.transferred.min(&self.authorized);
    }

    pub fn holds_invariant(&self) -> bool {
        self.authorized.fits_within(&self.requested)
            && self.transferred.fits_within(&self.authorized)
    }
}

// ============================================================================
// WAT Off
// ============================================================================

/// Transfer of value off the EGM to the wager account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatOffTransaction {
    pub base: TransactionBase,
    request_id: String,
    pub reason: TransferOutReason,
    /// Host accepts less than requested
    pub reduce_allowed: bool,
    amounts: TransferAmounts,
    status: WatStatus,
    pub exception_code: WatExceptionCode,
}

impl WatOffTransaction {
    /// Machine-initiated transfer, logged directly as INITIATED
    ///
    /// The caller already holds `bank_transaction`; the saga never releases it.
    pub fn machine_initiated(
        device_id: DeviceId,
        bank_transaction: ReservationToken,
        requested: Amounts,
        reason: TransferOutReason,
        associated_transactions: Vec<TransactionId>,
        trace_id: Option<Ulid>,
    ) -> Self {
        let mut base = TransactionBase::new(device_id);
        base.bank_transaction_id = Some(bank_transaction);
        base.owns_bank_transaction = false;
        base.associated_transactions = associated_transactions;
        base.trace_id = trace_id;

        Self {
            base,
            request_id: String::new(),
            reason,
            reduce_allowed: false,
            amounts: TransferAmounts::new(requested),
            status: WatStatus::Initiated,
            exception_code: WatExceptionCode::None,
        }
    }

    /// Host-initiated transfer in REQUEST_RECEIVED
    ///
    /// Returns `None` for an empty request id: an empty id would make the
    /// record machine-initiated.
    pub fn host_initiated(
        device_id: DeviceId,
        request_id: impl Into<String>,
        requested: Amounts,
        reduce_allowed: bool,
    ) -> Option<Self> {
        let request_id = request_id.into();
        if request_id.is_empty() {
            return None;
        }

        Some(Self {
            base: TransactionBase::new(device_id),
            request_id,
            reason: TransferOutReason::CashOut,
            reduce_allowed,
            amounts: TransferAmounts::new(requested),
            status: WatStatus::RequestReceived,
            exception_code: WatExceptionCode::None,
        })
    }

    pub fn direction(&self) -> TransferDirection {
        if self.request_id.is_empty() {
            TransferDirection::MachineInitiated
        } else {
            TransferDirection::HostInitiated
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn status(&self) -> WatStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: WatStatus) {
        self.status = status;
    }

    pub fn amounts(&self) -> &TransferAmounts {
        &self.amounts
    }

    pub(crate) fn amounts_mut(&mut self) -> &mut TransferAmounts {
        &mut self.amounts
    }

    pub fn requested(&self) -> Amounts {
        self.amounts.requested()
    }

    pub fn authorized(&self) -> Amounts {
        self.amounts.authorized()
    }

    pub fn transferred(&self) -> Amounts {
        self.amounts.transferred()
    }

    /// Record the host's authorization; see [`TransferAmounts::authorize`]
    pub fn authorize(&mut self, amounts: Amounts) -> bool {
        self.amounts.authorize(amounts)
    }
}

impl LoggedTransaction for WatOffTransaction {
    const KIND: TransactionKind = TransactionKind::WatOff;

    fn base(&self) -> &TransactionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TransactionBase {
        &mut self.base
    }

    fn into_entry(self) -> TransactionEntry {
        TransactionEntry::WatOff(self)
    }
}

impl fmt::Display for WatOffTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WatOff[{}] request_id={:?} reason={:?} status={} requested=({}) authorized=({}) transferred=({})",
            self.base.transaction_id,
            self.request_id,
            self.reason,
            self.status,
            self.requested(),
            self.authorized(),
            self.transferred()
        )
    }
}

// ============================================================================
// WAT On
// ============================================================================

/// Transfer of value from the wager account onto the EGM (always host-initiated)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatOnTransaction {
    pub base: TransactionBase,
    request_id: String,
    amounts: TransferAmounts,
    status: WatStatus,
    pub exception_code: WatExceptionCode,
}

impl WatOnTransaction {
    /// Returns `None` for an empty request id
    pub fn new(device_id: DeviceId, request_id: impl Into<String>, requested: Amounts) -> Option<Self> {
        let request_id = request_id.into();
        if request_id.is_empty() {
            return None;
        }

        Some(Self {
            base: TransactionBase::new(device_id),
            request_id,
            amounts: TransferAmounts::new(requested),
            status: WatStatus::RequestReceived,
            exception_code: WatExceptionCode::None,
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn status(&self) -> WatStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: WatStatus) {
        self.status = status;
    }

    pub fn amounts(&self) -> &TransferAmounts {
        &self.amounts
    }

    pub(crate) fn amounts_mut(&mut self) -> &mut TransferAmounts {
        &mut self.amounts
    }

    pub fn requested(&self) -> Amounts {
        self.amounts.requested()
    }

    pub fn authorized(&self) -> Amounts {
        self.amounts.authorized()
    }

    pub fn transferred(&self) -> Amounts {
        self.amounts.transferred()
    }

    pub fn authorize(&mut self, amounts: Amounts) -> bool {
        self.amounts.authorize(amounts)
    }
}

impl LoggedTransaction for WatOnTransaction {
    const KIND: TransactionKind = TransactionKind::WatOn;

    fn base(&self) -> &TransactionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TransactionBase {
        &mut self.base
    }

    fn into_entry(self) -> TransactionEntry {
        TransactionEntry::WatOn(self)
    }
}

impl fmt::Display for WatOnTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WatOn[{}] request_id={:?} status={} requested=({}) authorized=({}) transferred=({})",
            self.base.transaction_id,
            self.request_id,
            self.status,
            self.requested(),
            self.authorized(),
            self.transferred()
        )
    }
}

/// Result of a machine-initiated transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub success: bool,
    /// Set once the attempt was logged
    pub transaction_id: Option<TransactionId>,
    pub transferred: Amounts,
}

impl TransferOutcome {
    pub fn failed(transaction_id: Option<TransactionId>) -> Self {
        Self {
            success: false,
            transaction_id,
            transferred: Amounts::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_request_id() {
        let machine = WatOffTransaction::machine_initiated(
            1,
            ReservationToken::new(),
            Amounts::cashable(500),
            TransferOutReason::CashOut,
            vec![],
            None,
        );
        assert_eq!(machine.direction(), TransferDirection::MachineInitiated);
        assert_eq!(machine.status(), WatStatus::Initiated);
        assert!(!machine.base.owns_bank_transaction);

        let host = WatOffTransaction::host_initiated(1, "H-1", Amounts::cashable(500), false).unwrap();
        assert_eq!(host.direction(), TransferDirection::HostInitiated);
        assert_eq!(host.status(), WatStatus::RequestReceived);

        assert!(WatOffTransaction::host_initiated(1, "", Amounts::cashable(1), true).is_none());
        assert!(WatOnTransaction::new(1, "", Amounts::cashable(1)).is_none());
    }

    #[test]
    fn test_authorize_clamps_to_request() {
        let mut amounts = TransferAmounts::new(Amounts::new(500, 100, 0));

        assert!(amounts.authorize(Amounts::new(400, 100, 0)));
        assert_eq!(amounts.authorized(), Amounts::new(400, 100, 0));

        assert!(!amounts.authorize(Amounts::new(900, 0, 50)));
        assert_eq!(amounts.authorized(), Amounts::new(500, 0, 0));
        assert!(amounts.holds_invariant());
    }

    #[test]
    fn test_settle_and_clear() {
        let mut amounts = TransferAmounts::new(Amounts::new(500, 100, 0));
        amounts.authorize(Amounts::new(500, 50, 0));
        amounts.settle();
        assert_eq!(amounts.transferred(), Amounts::new(500, 50, 0));
        assert!(amounts.holds_invariant());

        amounts.clear_transferred();
        assert_eq!(amounts.transferred(), Amounts::ZERO);
        assert_eq!(amounts.authorized(), Amounts::new(500, 50, 0));

        amounts.clear_authorized();
        assert_eq!(amounts.authorized(), Amounts::ZERO);
        assert!(amounts.holds_invariant());
    }

    #[test]
    fn test_cap_requested_keeps_ordering() {
        let mut amounts = TransferAmounts::new(Amounts::new(500, 100, 20));
        amounts.authorize(Amounts::new(500, 100, 20));
        amounts.cap_requested(&Amounts::new(300, 100, 0));

        assert_eq!(amounts.requested(), Amounts::new(300, 100, 0));
        assert_eq!(amounts.authorized(), Amounts::new(300, 100, 0));
        assert!(amounts.holds_invariant());
    }

    #[test]
    fn test_reason_affects_balance() {
        assert!(TransferOutReason::CashOut.affects_balance());
        assert!(!TransferOutReason::BonusPay.affects_balance());
        assert!(!TransferOutReason::LargeWin.affects_balance());
        assert!(!TransferOutReason::CashWin.affects_balance());
    }
}
