//! Mock collaborators for saga tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{Notify, broadcast};

use super::types::{WatOffTransaction, WatOnTransaction};
use crate::adapters::{
    Ledger, LedgerError, MessageDisplay, MeterRegistry, TransferEvent, TransferPhase, WatEvent,
    WatOffValidator, WatOnValidator,
};
use crate::core_types::{TransactionId, TransactionKind};
use crate::money::{AccountCategory, Amounts};
use crate::storage::{ScopedTransaction, StorageError};

/// Ledger whose balances move only when the caller's scope commits
#[derive(Default)]
pub struct MockLedger {
    balances: Arc<Mutex<Amounts>>,
    ops: Arc<Mutex<Vec<(&'static str, AccountCategory, u64, TransactionId)>>>,
}

impl MockLedger {
    pub fn with_balances(balances: Amounts) -> Self {
        Self {
            balances: Arc::new(Mutex::new(balances)),
            ops: Arc::default(),
        }
    }

    pub fn balance_of(&self, category: AccountCategory) -> u64 {
        self.balances.lock().unwrap().get(category)
    }

    /// Committed (op, category, amount, correlation) in order
    pub fn ops(&self) -> Vec<(&'static str, AccountCategory, u64, TransactionId)> {
        self.ops.lock().unwrap().clone()
    }

    fn stage(
        &self,
        scope: &mut ScopedTransaction,
        op: &'static str,
        category: AccountCategory,
        amount: u64,
        correlation: TransactionId,
    ) {
        let balances = self.balances.clone();
        let ops = self.ops.clone();
        scope.on_commit(move || {
            let mut balances = balances.lock().unwrap();
            let current = balances.get(category);
            let next = if op == "debit" {
                current - amount
            } else {
                current + amount
            };
            balances.set(category, next);
            ops.lock().unwrap().push((op, category, amount, correlation));
        });
    }
}

impl Ledger for MockLedger {
    fn balance(&self, category: AccountCategory) -> u64 {
        self.balances.lock().unwrap().get(category)
    }

    fn debit(
        &self,
        scope: &mut ScopedTransaction,
        category: AccountCategory,
        amount: u64,
        correlation: TransactionId,
    ) -> Result<(), LedgerError> {
        let available = self.balance(category);
        if amount > available {
            return Err(LedgerError::InsufficientFunds {
                category,
                requested: amount,
                available,
            });
        }
        self.stage(scope, "debit", category, amount, correlation);
        Ok(())
    }

    fn credit(
        &self,
        scope: &mut ScopedTransaction,
        category: AccountCategory,
        amount: u64,
        correlation: TransactionId,
    ) -> Result<(), LedgerError> {
        if self.balance(category).checked_add(amount).is_none() {
            return Err(LedgerError::Overflow { category });
        }
        self.stage(scope, "credit", category, amount, correlation);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockMeters {
    values: Arc<Mutex<FxHashMap<String, u64>>>,
}

impl MockMeters {
    pub fn get(&self, name: &str) -> u64 {
        self.values.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn is_untouched(&self) -> bool {
        self.values.lock().unwrap().is_empty()
    }
}

impl MeterRegistry for MockMeters {
    fn increment(
        &self,
        scope: &mut ScopedTransaction,
        name: &str,
        amount: u64,
    ) -> Result<(), StorageError> {
        let values = self.values.clone();
        let name = name.to_string();
        scope.on_commit(move || {
            *values.lock().unwrap().entry(name).or_insert(0) += amount;
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDisplay {
    shown: Mutex<Vec<(String, String)>>,
}

impl MockDisplay {
    pub fn shown(&self) -> Vec<(String, String)> {
        self.shown.lock().unwrap().clone()
    }
}

impl MessageDisplay for MockDisplay {
    fn display_message(&self, key: &str, text: &str) {
        self.shown
            .lock()
            .unwrap()
            .push((key.to_string(), text.to_string()));
    }

    fn remove_message(&self, _key: &str) {}
}

/// Host validator for both directions
///
/// Authorizes the full request unless `authorize` overrides it. With a gate
/// set, `initiate_transfer` waits for the gate before answering.
pub struct MockValidator {
    can_transfer: AtomicBool,
    accept: AtomicBool,
    authorize: Mutex<Option<Amounts>>,
    gate: Option<Arc<Notify>>,
    initiate_count: AtomicUsize,
    commit_count: AtomicUsize,
}

impl MockValidator {
    pub fn new() -> Self {
        Self {
            can_transfer: AtomicBool::new(true),
            accept: AtomicBool::new(true),
            authorize: Mutex::new(None),
            gate: None,
            initiate_count: AtomicUsize::new(0),
            commit_count: AtomicUsize::new(0),
        }
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    pub fn set_can_transfer(&self, value: bool) {
        self.can_transfer.store(value, Ordering::SeqCst);
    }

    pub fn set_accept(&self, value: bool) {
        self.accept.store(value, Ordering::SeqCst);
    }

    pub fn set_authorize(&self, amounts: Option<Amounts>) {
        *self.authorize.lock().unwrap() = amounts;
    }

    pub fn initiate_count(&self) -> usize {
        self.initiate_count.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commit_count.load(Ordering::SeqCst)
    }

    async fn answer(&self, requested: Amounts) -> Option<Amounts> {
        self.initiate_count.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if !self.accept.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.authorize.lock().unwrap().unwrap_or(requested))
    }
}

#[async_trait]
impl WatOffValidator for MockValidator {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn can_transfer(&self) -> bool {
        self.can_transfer.load(Ordering::SeqCst)
    }

    async fn initiate_transfer(&self, transaction: &mut WatOffTransaction) -> bool {
        match self.answer(transaction.requested()).await {
            Some(amounts) => {
                transaction.authorize(amounts);
                true
            }
            None => false,
        }
    }

    async fn commit_transfer(&self, _transaction: &WatOffTransaction) {
        self.commit_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WatOnValidator for MockValidator {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn can_transfer(&self) -> bool {
        self.can_transfer.load(Ordering::SeqCst)
    }

    async fn initiate_transfer(&self, transaction: &mut WatOnTransaction) -> bool {
        match self.answer(transaction.requested()).await {
            Some(amounts) => {
                transaction.authorize(amounts);
                true
            }
            None => false,
        }
    }

    async fn commit_transfer(&self, _transaction: &WatOnTransaction) {
        self.commit_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Next transfer event of `kind`, skipping everything else
pub async fn next_transfer_event(
    rx: &mut broadcast::Receiver<WatEvent>,
    kind: TransactionKind,
) -> TransferEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(WatEvent::Transfer(event)) if event.kind == kind => return event,
                Ok(_) => continue,
                Err(e) => panic!("event bus closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a transfer event")
}

/// Wait until a transfer event with `phase` arrives; returns the phases seen
pub async fn wait_for_phase(
    rx: &mut broadcast::Receiver<WatEvent>,
    kind: TransactionKind,
    phase: TransferPhase,
) -> Vec<TransferPhase> {
    let mut seen = Vec::new();
    loop {
        let event = next_transfer_event(rx, kind).await;
        seen.push(event.phase);
        if event.phase == phase {
            return seen;
        }
    }
}
