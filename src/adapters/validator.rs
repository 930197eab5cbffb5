//! Host validator seams
//!
//! A validator is the host-protocol side of a transfer. It negotiates amounts
//! with the remote host; the saga owns persistence and ledger mutation.

use async_trait::async_trait;

use crate::wat::{WatOffTransaction, WatOnTransaction};

/// Host-protocol validator for transfers off the EGM
#[async_trait]
pub trait WatOffValidator: Send + Sync {
    /// Get validator name for logging
    fn name(&self) -> &'static str;

    /// Whether the host link is currently able to take a transfer
    fn can_transfer(&self) -> bool;

    /// Negotiate with the host
    ///
    /// On `true` the validator has set the authorized amounts on
    /// `transaction` (see [`WatOffTransaction::authorize`]). Amounts above the
    /// request are clamped by the saga.
    async fn initiate_transfer(&self, transaction: &mut WatOffTransaction) -> bool;

    /// Report the committed (durable) outcome to the host
    async fn commit_transfer(&self, transaction: &WatOffTransaction);
}

/// Host-protocol validator for transfers onto the EGM
#[async_trait]
pub trait WatOnValidator: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_transfer(&self) -> bool;

    /// Negotiate with the host; see [`WatOffValidator::initiate_transfer`]
    async fn initiate_transfer(&self, transaction: &mut WatOnTransaction) -> bool;

    async fn commit_transfer(&self, transaction: &WatOnTransaction);
}
