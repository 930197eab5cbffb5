//! WAT Off Saga
//!
//! Moves value off the EGM. Host-initiated requests are logged and answered
//! right away; the host handshake then runs on a background task.
//!
//! ```text
//! request_transfer ──► reserve ──► log REQUEST_RECEIVED ──► return true
//!                                          │ (spawned)
//!                                          ▼
//!            INITIATED ──validator.initiate──► AUTHORIZED ──► COMMITTED
//!                                                   (debit + meters + release)
//!                                                          │
//!                               validator.commit ◄─────────┘
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::error::WatError;
use super::state::{WatExceptionCode, WatStatus};
use super::types::{TransferOutReason, TransferOutcome, WatOffTransaction};
use super::WatContext;
use crate::adapters::meters::transfer_meters;
use crate::adapters::{TransferEvent, TransferPhase, WatEvent, WatOffValidator};
use crate::config::WatConfig;
use crate::core_types::{DeviceId, RequestorId, ReservationToken, TransactionId, TransactionKind};
use crate::history::TransactionLog;
use crate::money::Amounts;
use crate::storage::ScopedTransaction;

/// Coordinator family of the Off saga; each request runs under its own instance
pub const WAT_OFF_REQUESTOR: RequestorId = RequestorId::from_u128(0x5741_5430_4646);

const DISPLAY_KEY: &str = "wat-off";

pub struct WatOffProvider {
    ctx: WatContext,
    log: Arc<TransactionLog<WatOffTransaction>>,
    device_id: DeviceId,
    reservation_timeout: Duration,
    allow_reduced_amounts: bool,
    validator: RwLock<Option<Arc<dyn WatOffValidator>>>,
    /// Serializes record mutation between the request, background and host
    /// cancel paths; never held across an await
    phase_lock: Mutex<()>,
}

/// Where the saga stands after the validator answered
enum Settlement {
    Committed(WatOffTransaction),
    Stopped,
}

impl WatOffProvider {
    pub fn new(
        ctx: WatContext,
        log: Arc<TransactionLog<WatOffTransaction>>,
        config: &WatConfig,
    ) -> Self {
        Self {
            ctx,
            log,
            device_id: config.device_id,
            reservation_timeout: Duration::from_millis(config.reservation_timeout_ms),
            allow_reduced_amounts: config.allow_reduced_off_amounts,
            validator: RwLock::new(None),
            phase_lock: Mutex::new(()),
        }
    }

    pub fn set_validator(&self, validator: Option<Arc<dyn WatOffValidator>>) {
        if let Some(v) = &validator {
            info!(validator = v.name(), "WAT off validator registered");
        }
        *self.validator.write().unwrap_or_else(PoisonError::into_inner) = validator;
    }

    pub fn validator(&self) -> Option<Arc<dyn WatOffValidator>> {
        self.validator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn log(&self) -> &Arc<TransactionLog<WatOffTransaction>> {
        &self.log
    }

    fn lock_phase(&self) -> MutexGuard<'_, ()> {
        self.phase_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self, transaction_id: TransactionId) -> Result<WatOffTransaction, WatError> {
        self.log
            .get(transaction_id)
            .ok_or(WatError::TransactionNotFound(transaction_id))
    }

    fn publish(&self, phase: TransferPhase, record: &WatOffTransaction, amounts: Amounts) {
        self.ctx.events.publish(WatEvent::Transfer(TransferEvent {
            kind: TransactionKind::WatOff,
            phase,
            transaction_id: record.base.transaction_id,
            request_id: record.request_id().to_string(),
            amounts,
        }));
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Most recent record for a host request id
    pub fn find_by_request_id(&self, request_id: &str) -> Option<WatOffTransaction> {
        if request_id.is_empty() {
            return None;
        }
        self.log.find(|r| r.request_id() == request_id)
    }

    /// The transfer that has not reached its ledger settlement yet, if any
    pub fn pending_transfer(&self) -> Option<WatOffTransaction> {
        self.log.find(|r| r.status().is_unsettled())
    }

    pub fn get(&self, transaction_id: TransactionId) -> Option<WatOffTransaction> {
        self.log.get(transaction_id)
    }

    pub fn recall_all(&self) -> Vec<WatOffTransaction> {
        self.log.recall_all()
    }

    // ========================================================================
    // Machine-initiated
    // ========================================================================

    /// Transfer off under a reservation the caller already holds
    ///
    /// Runs the whole handshake before returning. Refusals come back as a
    /// failed outcome.
    pub async fn transfer(
        &self,
        bank_transaction: ReservationToken,
        amounts: Amounts,
        reason: TransferOutReason,
        associated_transactions: Vec<TransactionId>,
        trace_id: Option<Ulid>,
    ) -> Result<TransferOutcome, WatError> {
        let validator = match self.validator() {
            Some(v) if v.can_transfer() => v,
            _ => {
                warn!(amounts = %amounts, "WAT off transfer without an available validator");
                return Ok(TransferOutcome::failed(None));
            }
        };
        if !self.ctx.coordinator.verify_current_transaction(bank_transaction) {
            warn!(token = %bank_transaction, "WAT off transfer under an inactive reservation");
            return Ok(TransferOutcome::failed(None));
        }

        let mut record = WatOffTransaction::machine_initiated(
            self.device_id,
            bank_transaction,
            amounts,
            reason,
            associated_transactions,
            trace_id,
        );
        record.reduce_allowed = self.allow_reduced_amounts;

        let record = {
            let _guard = self.lock_phase();
            let record = self.log.add(record)?;
            info!(transaction_id = record.base.transaction_id, reason = ?reason, "WAT off initiated");
            self.publish(TransferPhase::Initiated, &record, record.requested());
            record
        };

        let transaction_id = record.base.transaction_id;
        let mut working = record;
        let accepted = validator.initiate_transfer(&mut working).await;

        match self.settle(transaction_id, &working, accepted)? {
            Settlement::Committed(committed) => {
                validator.commit_transfer(&committed).await;
                self.publish(TransferPhase::Committed, &committed, committed.transferred());
                Ok(TransferOutcome {
                    success: committed.exception_code == WatExceptionCode::None,
                    transaction_id: Some(transaction_id),
                    transferred: committed.transferred(),
                })
            }
            Settlement::Stopped => Ok(TransferOutcome::failed(Some(transaction_id))),
        }
    }

    // ========================================================================
    // Host-initiated
    // ========================================================================

    /// Accept a host request to move value off the EGM
    ///
    /// Returns `true` once the request is durably logged; settlement is
    /// reported on the event bus. Without `bank_transaction` the saga takes
    /// the reservation itself (jumping the queue) and releases it on commit.
    pub async fn request_transfer(
        self: &Arc<Self>,
        bank_transaction: Option<ReservationToken>,
        request_id: &str,
        amounts: Amounts,
        reduce_allowed: bool,
    ) -> Result<bool, WatError> {
        let Some(mut record) =
            WatOffTransaction::host_initiated(self.device_id, request_id, amounts, reduce_allowed)
        else {
            warn!("WAT off request without a host request id");
            return Ok(false);
        };
        if self.find_by_request_id(request_id).is_some() {
            warn!(request_id = %request_id, "Duplicate WAT off request");
            return Ok(false);
        }

        let (token, owned) = match bank_transaction {
            Some(token) if self.ctx.coordinator.verify_current_transaction(token) => (token, false),
            Some(token) => {
                warn!(request_id = %request_id, token = %token, "WAT off request under an inactive reservation");
                return Ok(false);
            }
            None => {
                match self
                    .ctx
                    .acquire_reservation(WAT_OFF_REQUESTOR, self.reservation_timeout, true)
                    .await?
                {
                    Some(token) => (token, true),
                    None => {
                        warn!(request_id = %request_id, "WAT off request could not reserve the ledger");
                        return Ok(false);
                    }
                }
            }
        };

        record.base.bank_transaction_id = Some(token);
        record.base.owns_bank_transaction = owned;
        if reduce_allowed && record.reason.affects_balance() {
            let available = self.ctx.ledger.balances();
            record.amounts_mut().cap_requested(&available);
        }

        let added = {
            let _guard = self.lock_phase();
            self.log.add(record)
        };
        let record = match added {
            Ok(record) => record,
            Err(e) => {
                if owned {
                    self.ctx.coordinator.release_transaction(token)?;
                }
                return Err(e.into());
            }
        };

        info!(
            transaction_id = record.base.transaction_id,
            request_id = %request_id,
            requested = %record.requested(),
            "WAT off request received"
        );
        self.publish(TransferPhase::Requested, &record, record.requested());

        let this = Arc::clone(self);
        let transaction_id = record.base.transaction_id;
        tokio::spawn(async move {
            if let Err(e) = this.run_host_transfer(transaction_id).await {
                error!(transaction_id, error = %e, code = e.code(), "WAT off transfer failed");
            }
        });
        Ok(true)
    }

    async fn run_host_transfer(&self, transaction_id: TransactionId) -> Result<(), WatError> {
        let Some((mut working, validator)) = self.begin_host_transfer(transaction_id)? else {
            return Ok(());
        };

        let accepted = validator.initiate_transfer(&mut working).await;

        if let Settlement::Committed(committed) = self.settle(transaction_id, &working, accepted)? {
            validator.commit_transfer(&committed).await;
            self.publish(TransferPhase::Committed, &committed, committed.transferred());
            self.ctx
                .display
                .display_message(DISPLAY_KEY, "Transfer to account complete");
        }
        Ok(())
    }

    /// REQUEST_RECEIVED → INITIATED, or REJECTED when no validator can serve
    #[allow(clippy::type_complexity)]
    fn begin_host_transfer(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<(WatOffTransaction, Arc<dyn WatOffValidator>)>, WatError> {
        let _guard = self.lock_phase();
        let mut record = self.load(transaction_id)?;
        if record.status() != WatStatus::RequestReceived {
            debug!(transaction_id, status = %record.status(), "WAT off no longer awaiting initiation");
            return Ok(None);
        }

        let validator = match self.validator() {
            Some(v) if v.can_transfer() => v,
            _ => {
                self.reject_locked(&mut record, WatExceptionCode::ValidatorRejected)?;
                return Ok(None);
            }
        };

        if !record.reduce_allowed
            && record.reason.affects_balance()
            && !record.requested().fits_within(&self.ctx.ledger.balances())
        {
            self.reject_locked(&mut record, WatExceptionCode::InsufficientFunds)?;
            return Ok(None);
        }

        record.set_status(WatStatus::Initiated);
        self.log.update(&record)?;
        debug!(transaction_id, validator = validator.name(), "WAT off initiated");
        self.publish(TransferPhase::Initiated, &record, record.requested());
        self.ctx
            .display
            .display_message(DISPLAY_KEY, "Transfer to account pending");
        Ok(Some((record, validator)))
    }

    /// Apply the validator's answer: INITIATED → AUTHORIZED → COMMITTED
    fn settle(
        &self,
        transaction_id: TransactionId,
        answered: &WatOffTransaction,
        accepted: bool,
    ) -> Result<Settlement, WatError> {
        let _guard = self.lock_phase();
        let mut record = self.load(transaction_id)?;
        if record.status() != WatStatus::Initiated {
            // cancelled meanwhile; the cancel path finishes the record
            debug!(transaction_id, status = %record.status(), "WAT off changed during validation");
            return Ok(Settlement::Stopped);
        }

        if !accepted {
            self.reject_locked(&mut record, WatExceptionCode::ValidatorRejected)?;
            return Ok(Settlement::Stopped);
        }

        let offered = answered.authorized();
        if !record.authorize(offered) {
            warn!(transaction_id, offered = %offered, "Authorized amounts clamped to the request");
        }
        if !record.reduce_allowed && record.authorized() != record.requested() {
            warn!(
                transaction_id,
                authorized = %record.authorized(),
                requested = %record.requested(),
                "Reduced authorization refused"
            );
            record.amounts_mut().clear_authorized();
            record.exception_code = WatExceptionCode::ReductionNotAllowed;
        }
        record.set_status(WatStatus::Authorized);
        self.publish(TransferPhase::Authorized, &record, record.authorized());

        self.commit_locked(&mut record)?;
        Ok(Settlement::Committed(record))
    }

    /// The single durable scope of a settlement
    fn commit_locked(&self, record: &mut WatOffTransaction) -> Result<(), WatError> {
        let transaction_id = record.base.transaction_id;
        let debits = record.reason.affects_balance();

        if debits && !record.authorized().fits_within(&self.ctx.ledger.balances()) {
            warn!(transaction_id, authorized = %record.authorized(), "Balance below authorized amounts");
            record.amounts_mut().clear_authorized();
            record.exception_code = WatExceptionCode::InsufficientFunds;
        }

        let mut scope = ScopedTransaction::new(self.ctx.storage.clone());
        let authorized = record.authorized();
        for (category, amount) in authorized.iter().filter(|(_, amount)| *amount > 0) {
            if debits {
                self.ctx.ledger.debit(&mut scope, category, amount, transaction_id)?;
            }
            let (amount_meter, count_meter) = transfer_meters(TransactionKind::WatOff, category);
            self.ctx.meters.increment(&mut scope, amount_meter, amount)?;
            self.ctx.meters.increment(&mut scope, count_meter, 1)?;
        }

        record.amounts_mut().settle();
        record.set_status(WatStatus::Committed);
        self.log.update_in(&mut scope, record)?;
        self.ctx.stage_release(
            &mut scope,
            record.base.bank_transaction_id,
            record.base.owns_bank_transaction,
        )?;
        scope.commit()?;

        info!(
            transaction_id,
            transferred = %record.transferred(),
            exception = %record.exception_code,
            "WAT off committed"
        );
        Ok(())
    }

    fn reject_locked(
        &self,
        record: &mut WatOffTransaction,
        code: WatExceptionCode,
    ) -> Result<(), WatError> {
        record.amounts_mut().clear_authorized();
        record.set_status(WatStatus::Rejected);
        record.exception_code = code;

        let mut scope = ScopedTransaction::new(self.ctx.storage.clone());
        self.log.update_in(&mut scope, record)?;
        self.ctx.stage_release(
            &mut scope,
            record.base.bank_transaction_id,
            record.base.owns_bank_transaction,
        )?;
        scope.commit()?;

        info!(transaction_id = record.base.transaction_id, exception = %code, "WAT off rejected");
        self.publish(TransferPhase::Rejected, record, Amounts::ZERO);
        self.ctx.display.remove_message(DISPLAY_KEY);
        Ok(())
    }

    // ========================================================================
    // Host cancel / acknowledge
    // ========================================================================

    /// Host cancel; accepted only before authorization started
    pub async fn cancel_transfer(
        self: &Arc<Self>,
        request_id: &str,
        code: WatExceptionCode,
    ) -> Result<bool, WatError> {
        match self.find_by_request_id(request_id) {
            Some(record) => self.cancel_transaction(record.base.transaction_id, code).await,
            None => {
                debug!(request_id = %request_id, "Cancel for an unknown WAT off request");
                Ok(false)
            }
        }
    }

    pub async fn cancel_transaction(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        code: WatExceptionCode,
    ) -> Result<bool, WatError> {
        let record = {
            let _guard = self.lock_phase();
            let mut record = self.load(transaction_id)?;
            if !record.status().is_cancellable() {
                debug!(transaction_id, status = %record.status(), "WAT off cancel refused");
                return Ok(false);
            }
            record.amounts_mut().clear_authorized();
            record.set_status(WatStatus::CancelReceived);
            record.exception_code = code;
            self.log.update(&record)?;
            record
        };

        info!(transaction_id, exception = %code, "WAT off cancel received");
        self.publish(TransferPhase::CancelRequested, &record, record.requested());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.finish_cancelled(transaction_id).await {
                error!(transaction_id, error = %e, code = e.code(), "WAT off cancel failed");
            }
        });
        Ok(true)
    }

    async fn finish_cancelled(&self, transaction_id: TransactionId) -> Result<(), WatError> {
        let committed = {
            let _guard = self.lock_phase();
            let mut record = self.load(transaction_id)?;
            if record.status() != WatStatus::CancelReceived {
                return Ok(());
            }
            self.commit_locked(&mut record)?;
            record
        };

        if let Some(validator) = self.validator() {
            validator.commit_transfer(&committed).await;
        }
        self.publish(TransferPhase::Committed, &committed, committed.transferred());
        self.ctx.display.remove_message(DISPLAY_KEY);
        Ok(())
    }

    /// Host acknowledgement: COMMITTED → COMPLETE, anything else is a no-op
    pub fn acknowledge_transfer(&self, request_id: &str) -> Result<bool, WatError> {
        match self.find_by_request_id(request_id) {
            Some(record) => self.acknowledge_transaction(record.base.transaction_id),
            None => Ok(false),
        }
    }

    pub fn acknowledge_transaction(&self, transaction_id: TransactionId) -> Result<bool, WatError> {
        let record = {
            let _guard = self.lock_phase();
            let mut record = self.load(transaction_id)?;
            if record.status() != WatStatus::Committed {
                debug!(transaction_id, status = %record.status(), "WAT off acknowledge ignored");
                return Ok(false);
            }
            record.set_status(WatStatus::Complete);
            self.log.update(&record)?;
            record
        };

        debug!(transaction_id, "WAT off complete");
        self.publish(TransferPhase::Completed, &record, record.transferred());
        self.ctx.display.remove_message(DISPLAY_KEY);
        Ok(true)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Force every unsettled record to COMMITTED with nothing transferred
    ///
    /// Runs once at startup before any request is accepted. The ledger is
    /// never touched. Returns the number of records changed.
    pub fn recover(&self) -> Result<usize, WatError> {
        let _guard = self.lock_phase();
        let mut recovered = 0;

        for mut record in self.log.recall_all() {
            if !record.status().is_unsettled() {
                continue;
            }
            let from = record.status();

            let mut scope = ScopedTransaction::new(self.ctx.storage.clone());
            record.amounts_mut().clear_transferred();
            record.set_status(WatStatus::Committed);
            record.exception_code = WatExceptionCode::PowerFailure;
            self.log.update_in(&mut scope, &record)?;
            self.ctx.stage_release(
                &mut scope,
                record.base.bank_transaction_id,
                record.base.owns_bank_transaction,
            )?;
            scope.commit()?;

            warn!(
                transaction_id = record.base.transaction_id,
                from = %from,
                "WAT off forced to COMMITTED after power failure"
            );
            recovered += 1;
        }

        self.ctx.release_orphaned(WAT_OFF_REQUESTOR)?;
        Ok(recovered)
    }
}
