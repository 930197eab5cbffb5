//! Wager Account Transfers (WAT)
//!
//! Sagas moving value off the EGM to a wager account ([`WatOffProvider`])
//! and from the account onto the EGM ([`WatOnProvider`]).
//!
//! # State Machine
//!
//! ```text
//! REQUEST_RECEIVED → INITIATED → AUTHORIZED → COMMITTED → COMPLETE
//!        │               │                        ▲
//!        │               ├──► REJECTED            │
//!        └───────────────┴──► CANCEL_RECEIVED ────┘ (zeroed)
//!
//! restart: any unsettled state ──► COMMITTED (POWER_FAILURE, nothing moved)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Reservation first**: the ledger is only touched under a coordinator
//!    reservation
//! 2. **Persist-Before-Call**: the record is durable before the validator is
//!    asked anything
//! 3. **One scope**: ledger mutation, meters, log status and reservation
//!    release commit together or not at all
//! 4. **Host notified after commit**: the validator hears about a commit only
//!    once it is durable

pub mod error;
pub mod off;
pub mod on;
pub mod state;
pub mod types;

#[cfg(test)]
pub mod mock;


pub use error::WatError;
pub use off::WatOffProvider;
pub use on::WatOnProvider;
pub use state::{WatExceptionCode, WatStatus};
pub use types::{
    TransferAmounts, TransferDirection, TransferOutReason, TransferOutcome, WatOffTransaction,
    WatOnTransaction,
};

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::adapters::{EventBus, Ledger, MessageDisplay, MeterRegistry};
use crate::coordinator::{TransactionCoordinator, TransactionType};
use crate::core_types::{RequestorId, ReservationToken};
use crate::storage::{PersistentStorage, ScopedTransaction};

/// Shared collaborators of both sagas
#[derive(Clone)]
pub struct WatContext {
    pub coordinator: Arc<TransactionCoordinator>,
    pub storage: Arc<dyn PersistentStorage>,
    pub ledger: Arc<dyn Ledger>,
    pub meters: Arc<dyn MeterRegistry>,
    pub events: Arc<dyn EventBus>,
    pub display: Arc<dyn MessageDisplay>,
}

impl WatContext {
    /// Take the reservation for a saga
    ///
    /// Each call requests under a fresh instance of `family`, so concurrent
    /// requests of one saga never stand in for each other. Tries an immediate
    /// grant first and only then parks a blocking-pool thread on the
    /// coordinator for up to `timeout`.
    pub(crate) async fn acquire_reservation(
        &self,
        family: RequestorId,
        timeout: Duration,
        jump_queue: bool,
    ) -> Result<Option<ReservationToken>, WatError> {
        let requestor = RequestorId::instance_of(family);
        let immediate = self.coordinator.request_transaction(
            requestor,
            Duration::ZERO,
            TransactionType::Write,
            jump_queue,
        )?;
        if immediate.is_some() || timeout.is_zero() {
            return Ok(immediate);
        }

        let coordinator = self.coordinator.clone();
        let token = tokio::task::spawn_blocking(move || {
            coordinator.request_transaction(requestor, timeout, TransactionType::Write, jump_queue)
        })
        .await
        .map_err(|e| WatError::TaskFailed(e.to_string()))??;
        Ok(token)
    }

    /// Release a reservation left to `family` by a restart
    ///
    /// Covers a crash between taking the reservation and logging the record
    /// that owns it.
    pub(crate) fn release_orphaned(&self, family: RequestorId) -> Result<(), WatError> {
        if let Some((token, holder)) = self.coordinator.current_holder() {
            if holder.belongs_to(family) {
                warn!(token = %token, requestor = %holder, "Releasing reservation left by restart");
                self.coordinator.release_transaction(token)?;
            }
        }
        Ok(())
    }

    /// Stage the release of a reservation the saga owns
    pub(crate) fn stage_release(
        &self,
        scope: &mut ScopedTransaction,
        token: Option<ReservationToken>,
        owned: bool,
    ) -> Result<(), WatError> {
        if let (true, Some(token)) = (owned, token) {
            if !self.coordinator.release_transaction_in(scope, token)? {
                warn!(token = %token, "Owned reservation no longer active");
            }
        }
        Ok(())
    }
}
