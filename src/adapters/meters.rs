//! Meter registry seam and WAT meter names

use crate::core_types::TransactionKind;
use crate::money::AccountCategory;
use crate::storage::{ScopedTransaction, StorageError};

pub const WAT_OFF_CASHABLE_AMOUNT: &str = "WatOffCashableAmount";
pub const WAT_OFF_CASHABLE_COUNT: &str = "WatOffCashableCount";
pub const WAT_OFF_PROMO_AMOUNT: &str = "WatOffCashablePromoAmount";
pub const WAT_OFF_PROMO_COUNT: &str = "WatOffCashablePromoCount";
pub const WAT_OFF_NON_CASHABLE_AMOUNT: &str = "WatOffNonCashableAmount";
pub const WAT_OFF_NON_CASHABLE_COUNT: &str = "WatOffNonCashableCount";

pub const WAT_ON_CASHABLE_AMOUNT: &str = "WatOnCashableAmount";
pub const WAT_ON_CASHABLE_COUNT: &str = "WatOnCashableCount";
pub const WAT_ON_PROMO_AMOUNT: &str = "WatOnCashablePromoAmount";
pub const WAT_ON_PROMO_COUNT: &str = "WatOnCashablePromoCount";
pub const WAT_ON_NON_CASHABLE_AMOUNT: &str = "WatOnNonCashableAmount";
pub const WAT_ON_NON_CASHABLE_COUNT: &str = "WatOnNonCashableCount";

/// Named counters maintained by the platform
pub trait MeterRegistry: Send + Sync {
    /// Stage `amount` onto meter `name`; applied when `scope` commits
    fn increment(
        &self,
        scope: &mut ScopedTransaction,
        name: &str,
        amount: u64,
    ) -> Result<(), StorageError>;
}

/// (amount meter, count meter) for a transfer direction and category
pub fn transfer_meters(
    kind: TransactionKind,
    category: AccountCategory,
) -> (&'static str, &'static str) {
    match (kind, category) {
        (TransactionKind::WatOff, AccountCategory::Cashable) => {
            (WAT_OFF_CASHABLE_AMOUNT, WAT_OFF_CASHABLE_COUNT)
        }
        (TransactionKind::WatOff, AccountCategory::Promo) => {
            (WAT_OFF_PROMO_AMOUNT, WAT_OFF_PROMO_COUNT)
        }
        (TransactionKind::WatOff, AccountCategory::NonCashable) => {
            (WAT_OFF_NON_CASHABLE_AMOUNT, WAT_OFF_NON_CASHABLE_COUNT)
        }
        (TransactionKind::WatOn, AccountCategory::Cashable) => {
            (WAT_ON_CASHABLE_AMOUNT, WAT_ON_CASHABLE_COUNT)
        }
        (TransactionKind::WatOn, AccountCategory::Promo) => {
            (WAT_ON_PROMO_AMOUNT, WAT_ON_PROMO_COUNT)
        }
        (TransactionKind::WatOn, AccountCategory::NonCashable) => {
            (WAT_ON_NON_CASHABLE_AMOUNT, WAT_ON_NON_CASHABLE_COUNT)
        }
    }
}
