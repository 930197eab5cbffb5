//! EGM Wager-Account-Transfer Core
//!
//! Exclusive access to the gaming machine's credit ledger and the transfer
//! sagas that move value between the machine and a wager account.
//!
//! # Modules
//!
//! - [`core_types`] - Ids and tokens (TransactionId, ReservationToken, etc.)
//! - [`money`] - Per-category amounts (cashable / promo / non-cashable)
//! - [`storage`] - Block storage with all-or-nothing scoped transactions
//! - [`adapters`] - Ledger, meter, event bus, display and validator seams
//! - [`history`] - Bounded persisted transaction logs
//! - [`coordinator`] - Ledger reservation broker and its blocking proxy
//! - [`wat`] - WAT Off / WAT On sagas
//! - [`system`] - Composition root and startup recovery
//! - [`config`] / [`logging`] - YAML configuration and tracing setup

// Core types - must be first!
pub mod core_types;
pub mod money;

pub mod adapters;
pub mod config;
pub mod coordinator;
pub mod history;
pub mod logging;
pub mod storage;
pub mod system;
pub mod wat;

// Convenient re-exports at crate root
pub use core_types::{
    DeviceId, GrantId, LogSequence, RequestorId, ReservationToken, TransactionId, TransactionKind,
};
pub use money::{AccountCategory, Amounts};

pub use adapters::{
    BroadcastEventBus, EventBus, Ledger, LedgerError, MessageDisplay, MeterRegistry,
    TracingMessageDisplay, TransferEvent, TransferPhase, WatEvent, WatOffValidator,
    WatOnValidator,
};
pub use config::{AppConfig, StorageBackend, StorageConfig, WatConfig};
pub use coordinator::{
    CoordinatorError, TransactionCoordinator, TransactionRequestor, TransactionType,
    TransferRequestProxy,
};
pub use history::{
    LoggedTransaction, TransactionBase, TransactionEntry, TransactionHistory, TransactionLog,
    TransactionLogError,
};
pub use storage::{FileStorage, MemoryStorage, PersistentStorage, ScopedTransaction, StorageError};
pub use system::{Collaborators, WatSystem};
pub use wat::{
    TransferOutReason, TransferOutcome, WatError, WatExceptionCode, WatOffProvider,
    WatOffTransaction, WatOnProvider, WatOnTransaction, WatStatus,
};
