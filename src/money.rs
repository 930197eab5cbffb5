//! Money Module
//!
//! Balances and transfer amounts in minor currency units (cents).
//!
//! ## Categories
//! - **Cashable**: redeemable credit
//! - **Promo**: cashable promotional credit
//! - **NonCashable**: playable-only promotional credit
//!
//! Amounts are unsigned; a negative amount cannot be represented.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ledger account category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccountCategory {
    Cashable,
    Promo,
    NonCashable,
}

impl AccountCategory {
    pub const ALL: [AccountCategory; 3] = [
        AccountCategory::Cashable,
        AccountCategory::Promo,
        AccountCategory::NonCashable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountCategory::Cashable => "Cashable",
            AccountCategory::Promo => "Promo",
            AccountCategory::NonCashable => "NonCashable",
        }
    }
}

impl fmt::Display for AccountCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One amount per account category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amounts {
    pub cashable: u64,
    pub promo: u64,
    pub non_cashable: u64,
}

impl Amounts {
    pub const ZERO: Amounts = Amounts {
        cashable: 0,
        promo: 0,
        non_cashable: 0,
    };

    pub const fn new(cashable: u64, promo: u64, non_cashable: u64) -> Self {
        Self {
            cashable,
            promo,
            non_cashable,
        }
    }

    pub const fn cashable(amount: u64) -> Self {
        Self::new(amount, 0, 0)
    }

    #[inline]
    pub fn get(&self, category: AccountCategory) -> u64 {
        match category {
            AccountCategory::Cashable => self.cashable,
            AccountCategory::Promo => self.promo,
            AccountCategory::NonCashable => self.non_cashable,
        }
    }

    #[inline]
    pub fn set(&mut self, category: AccountCategory, amount: u64) {
        match category {
            AccountCategory::Cashable => self.cashable = amount,
            AccountCategory::Promo => self.promo = amount,
            AccountCategory::NonCashable => self.non_cashable = amount,
        }
    }

    /// Sum over all categories, saturating at `u64::MAX`
    pub fn total(&self) -> u64 {
        self.cashable
            .saturating_add(self.promo)
            .saturating_add(self.non_cashable)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Amounts::ZERO
    }

    /// Per-category minimum
    pub fn min(&self, other: &Amounts) -> Amounts {
        Amounts::new(
            self.cashable.min(other.cashable),
            self.promo.min(other.promo),
            self.non_cashable.min(other.non_cashable),
        )
    }

    /// True when every category is `<=` the same category of `limit`
    pub fn fits_within(&self, limit: &Amounts) -> bool {
        AccountCategory::ALL
            .iter()
            .all(|c| self.get(*c) <= limit.get(*c))
    }

    /// (category, amount) pairs in a fixed order
    pub fn iter(&self) -> impl Iterator<Item = (AccountCategory, u64)> + '_ {
        AccountCategory::ALL.into_iter().map(|c| (c, self.get(c)))
    }
}

impl fmt::Display for Amounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cashable={} promo={} non_cashable={}",
            self.cashable, self.promo, self.non_cashable
        )
    }
}
