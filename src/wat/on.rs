//! WAT On Saga
//!
//! Moves value from the wager account onto the EGM. Always host-initiated;
//! mirrors the Off saga with credits instead of debits.
//!
//! A transfer that would push the credit meter past the configured maximum
//! is committed with nothing transferred; it is never partially credited.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::error::WatError;
use super::state::{WatExceptionCode, WatStatus};
use super::types::WatOnTransaction;
use super::WatContext;
use crate::adapters::meters::transfer_meters;
use crate::adapters::{TransferEvent, TransferPhase, WatEvent, WatOnValidator};
use crate::config::WatConfig;
use crate::core_types::{DeviceId, RequestorId, ReservationToken, TransactionId, TransactionKind};
use crate::history::TransactionLog;
use crate::money::Amounts;
use crate::storage::ScopedTransaction;

/// Coordinator family of the On saga; each request runs under its own instance
pub const WAT_ON_REQUESTOR: RequestorId = RequestorId::from_u128(0x5741_5430_4e);

const DISPLAY_KEY: &str = "wat-on";

pub struct WatOnProvider {
    ctx: WatContext,
    log: Arc<TransactionLog<WatOnTransaction>>,
    device_id: DeviceId,
    reservation_timeout: Duration,
    max_credit_meter: Option<u64>,
    validator: RwLock<Option<Arc<dyn WatOnValidator>>>,
    phase_lock: Mutex<()>,
}

impl WatOnProvider {
    pub fn new(ctx: WatContext, log: Arc<TransactionLog<WatOnTransaction>>, config: &WatConfig) -> Self {
        Self {
            ctx,
            log,
            device_id: config.device_id,
            reservation_timeout: Duration::from_millis(config.reservation_timeout_ms),
            max_credit_meter: config.max_credit_meter,
            validator: RwLock::new(None),
            phase_lock: Mutex::new(()),
        }
    }

    pub fn set_validator(&self, validator: Option<Arc<dyn WatOnValidator>>) {
        if let Some(v) = &validator {
            info!(validator = v.name(), "WAT on validator registered");
        }
        *self.validator.write().unwrap_or_else(PoisonError::into_inner) = validator;
    }

    pub fn validator(&self) -> Option<Arc<dyn WatOnValidator>> {
        self.validator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn log(&self) -> &Arc<TransactionLog<WatOnTransaction>> {
        &self.log
    }

    fn lock_phase(&self) -> MutexGuard<'_, ()> {
        self.phase_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self, transaction_id: TransactionId) -> Result<WatOnTransaction, WatError> {
        self.log
            .get(transaction_id)
            .ok_or(WatError::TransactionNotFound(transaction_id))
    }

    fn publish(&self, phase: TransferPhase, record: &WatOnTransaction, amounts: Amounts) {
        self.ctx.events.publish(WatEvent::Transfer(TransferEvent {
            kind: TransactionKind::WatOn,
            phase,
            transaction_id: record.base.transaction_id,
            request_id: record.request_id().to_string(),
            amounts,
        }));
    }

    pub fn find_by_request_id(&self, request_id: &str) -> Option<WatOnTransaction> {
        if request_id.is_empty() {
            return None;
        }
        self.log.find(|r| r.request_id() == request_id)
    }

    pub fn pending_transfer(&self) -> Option<WatOnTransaction> {
        self.log.find(|r| r.status().is_unsettled())
    }

    pub fn get(&self, transaction_id: TransactionId) -> Option<WatOnTransaction> {
        self.log.get(transaction_id)
    }

    pub fn recall_all(&self) -> Vec<WatOnTransaction> {
        self.log.recall_all()
    }

    /// Accept a host request to move value onto the EGM
    ///
    /// Same contract as the Off request: `true` means durably logged, the
    /// handshake continues in the background.
    pub async fn request_transfer(
        self: &Arc<Self>,
        bank_transaction: Option<ReservationToken>,
        request_id: &str,
        amounts: Amounts,
    ) -> Result<bool, WatError> {
        let Some(mut record) = WatOnTransaction::new(self.device_id, request_id, amounts) else {
            warn!("WAT on request without a host request id");
            return Ok(false);
        };
        if self.find_by_request_id(request_id).is_some() {
            warn!(request_id = %request_id, "Duplicate WAT on request");
            return Ok(false);
        }

        let (token, owned) = match bank_transaction {
            Some(token) if self.ctx.coordinator.verify_current_transaction(token) => (token, false),
            Some(token) => {
                warn!(request_id = %request_id, token = %token, "WAT on request under an inactive reservation");
                return Ok(false);
            }
            None => {
                match self
                    .ctx
                    .acquire_reservation(WAT_ON_REQUESTOR, self.reservation_timeout, false)
                    .await?
                {
                    Some(token) => (token, true),
                    None => {
                        warn!(request_id = %request_id, "WAT on request could not reserve the ledger");
                        return Ok(false);
                    }
                }
            }
        };

        record.base.bank_transaction_id = Some(token);
        record.base.owns_bank_transaction = owned;

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
            "WAT on request received"
        );
        self.publish(TransferPhase::Requested, &record, record.requested());

        let this = Arc::clone(self);
        let transaction_id = record.base.transaction_id;
        tokio::spawn(async move {
            if let Err(e) = this.run_host_transfer(transaction_id).await {
                error!(transaction_id, error = %e, code = e.code(), "WAT on transfer failed");
            }
        });
        Ok(true)
    }

    async fn run_host_transfer(&self, transaction_id: TransactionId) -> Result<(), WatError> {
        let Some((mut working, validator)) = self.begin_transfer(transaction_id)? else {
            return Ok(());
        };

        let accepted = validator.initiate_transfer(&mut working).await;

        if let Some(committed) = self.settle(transaction_id, &working, accepted)? {
            validator.commit_transfer(&committed).await;
            self.publish(TransferPhase::Completed, &committed, committed.transferred());
            self.ctx
                .display
                .display_message(DISPLAY_KEY, "Transfer from account complete");
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn begin_transfer(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<(WatOnTransaction, Arc<dyn WatOnValidator>)>, WatError> {
        let _guard = self.lock_phase();
        let mut record = self.load(transaction_id)?;
        if record.status() != WatStatus::RequestReceived {
            debug!(transaction_id, status = %record.status(), "WAT on no longer awaiting initiation");
            return Ok(None);
        }

        let validator = match self.validator() {
            Some(v) if v.can_transfer() => v,
            _ => {
                self.abort_locked(&mut record)?;
                return Ok(None);
            }
        };

        record.set_status(WatStatus::Initiated);
        self.log.update(&record)?;
        debug!(transaction_id, validator = validator.name(), "WAT on started");
        self.publish(TransferPhase::Started, &record, record.requested());
        self.ctx
            .display
            .display_message(DISPLAY_KEY, "Transfer from account pending");
        Ok(Some((record, validator)))
    }

    fn settle(
        &self,
        transaction_id: TransactionId,
        answered: &WatOnTransaction,
        accepted: bool,
    ) -> Result<Option<WatOnTransaction>, WatError> {
        let _guard = self.lock_phase();
        let mut record = self.load(transaction_id)?;
        if record.status() != WatStatus::Initiated {
            debug!(transaction_id, status = %record.status(), "WAT on changed during validation");
            return Ok(None);
        }

        if !accepted {
            self.abort_locked(&mut record)?;
            return Ok(None);
        }

        let offered = answered.authorized();
        if !record.authorize(offered) {
            warn!(transaction_id, offered = %offered, "Authorized amounts clamped to the request");
        }
        record.set_status(WatStatus::Authorized);
        self.publish(TransferPhase::Authorized, &record, record.authorized());

        if let Some(limit) = self.max_credit_meter {
            let credit_after = self
                .ctx
                .ledger
                .balances()
                .total()
                .saturating_add(record.authorized().total());
            if credit_after > limit {
                warn!(transaction_id, limit, credit_after, "WAT on would exceed the credit limit");
                record.amounts_mut().clear_authorized();
                record.exception_code = WatExceptionCode::CreditLimitExceeded;
            }
        }

        self.commit_locked(&mut record)?;
        Ok(Some(record))
    }

    fn commit_locked(&self, record: &mut WatOnTransaction) -> Result<(), WatError> {
        let transaction_id = record.base.transaction_id;
        let mut scope = ScopedTransaction::new(self.ctx.storage.clone());

        let authorized = record.authorized();
        for (category, amount) in authorized.iter().filter(|(_, amount)| *amount > 0) {
            self.ctx.ledger.credit(&mut scope, category, amount, transaction_id)?;
            let (amount_meter, count_meter) = transfer_meters(TransactionKind::WatOn, category);
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
            "WAT on committed"
        );
        Ok(())
    }

    /// Initiation failed: zero everything and finish
    fn abort_locked(&self, record: &mut WatOnTransaction) -> Result<(), WatError> {
        record.amounts_mut().cap_requested(&Amounts::ZERO);
        record.set_status(WatStatus::Complete);
        record.exception_code = WatExceptionCode::ValidatorRejected;

        let mut scope = ScopedTransaction::new(self.ctx.storage.clone());
        self.log.update_in(&mut scope, record)?;
        self.ctx.stage_release(
            &mut scope,
            record.base.bank_transaction_id,
            record.base.owns_bank_transaction,
        )?;
        scope.commit()?;

        info!(transaction_id = record.base.transaction_id, "WAT on refused by validator");
        self.publish(TransferPhase::Completed, record, Amounts::ZERO);
        self.ctx.display.remove_message(DISPLAY_KEY);
        Ok(())
    }

    pub async fn cancel_transfer(
        self: &Arc<Self>,
        request_id: &str,
        code: WatExceptionCode,
    ) -> Result<bool, WatError> {
        match self.find_by_request_id(request_id) {
            Some(record) => self.cancel_transaction(record.base.transaction_id, code).await,
            None => {
                debug!(request_id = %request_id, "Cancel for an unknown WAT on request");
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
                debug!(transaction_id, status = %record.status(), "WAT on cancel refused");
                return Ok(false);
            }
            record.amounts_mut().clear_authorized();
            record.set_status(WatStatus::CancelReceived);
            record.exception_code = code;
            self.log.update(&record)?;
            record
        };

        info!(transaction_id, exception = %code, "WAT on cancel received");
        self.publish(TransferPhase::CancelRequested, &record, record.requested());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.finish_cancelled(transaction_id).await {
                error!(transaction_id, error = %e, code = e.code(), "WAT on cancel failed");
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
        self.publish(TransferPhase::Completed, &committed, committed.transferred());
        self.ctx.display.remove_message(DISPLAY_KEY);
        Ok(())
    }

    pub fn acknowledge_transfer(&self, request_id: &str) -> Result<bool, WatError> {
        match self.find_by_request_id(request_id) {
            Some(record) => self.acknowledge_transaction(record.base.transaction_id),
            None => Ok(false),
        }
    }

    pub fn acknowledge_transaction(&self, transaction_id: TransactionId) -> Result<bool, WatError> {
        let _guard = self.lock_phase();
        let mut record = self.load(transaction_id)?;
        if record.status() != WatStatus::Committed {
            debug!(transaction_id, status = %record.status(), "WAT on acknowledge ignored");
            return Ok(false);
        }
        record.set_status(WatStatus::Complete);
        self.log.update(&record)?;
        debug!(transaction_id, "WAT on complete");
        self.ctx.display.remove_message(DISPLAY_KEY);
        Ok(true)
    }

    /// Startup recovery; see [`WatOffProvider::recover`](super::WatOffProvider::recover)
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
                "WAT on forced to COMMITTED after power failure"
            );
            recovered += 1;
        }

        self.ctx.release_orphaned(WAT_ON_REQUESTOR)?;
        Ok(recovered)
    }
}
