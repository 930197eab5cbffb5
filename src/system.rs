//! Composition root
//!
//! Builds the storage-backed history, the coordinator and both sagas, and
//! runs crash recovery before anything can request a transfer.
//!
//! ```text
//! WatSystem::start
//!   ├─ TransactionHistory::open      (id provider, event bus)
//!   │    ├─ register WatOff log
//!   │    └─ register WatOn log
//!   ├─ TransactionCoordinator::open  (restores reservation, starts dispatcher)
//!   ├─ WatOffProvider / WatOnProvider
//!   └─ recover()                     (unsettled records → COMMITTED)
//! ```

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::adapters::{EventBus, Ledger, MessageDisplay, MeterRegistry};
use crate::config::{StorageBackend, StorageConfig, WatConfig};
use crate::coordinator::TransactionCoordinator;
use crate::history::TransactionHistory;
use crate::storage::{FileStorage, MemoryStorage, PersistentStorage};
use crate::wat::{WatContext, WatOffProvider, WatOffTransaction, WatOnProvider, WatOnTransaction};

/// Subsystems owned elsewhere on the EGM
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn Ledger>,
    pub meters: Arc<dyn MeterRegistry>,
    pub events: Arc<dyn EventBus>,
    pub display: Arc<dyn MessageDisplay>,
}

pub struct WatSystem {
    pub storage: Arc<dyn PersistentStorage>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub history: Arc<TransactionHistory>,
    pub off: Arc<WatOffProvider>,
    pub on: Arc<WatOnProvider>,
}

impl WatSystem {
    pub fn open_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn PersistentStorage>> {
        Ok(match config.backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            StorageBackend::File => Arc::new(
                FileStorage::open(&config.data_dir)
                    .with_context(|| format!("Failed to open storage at {}", config.data_dir))?,
            ),
        })
    }

    pub fn start(
        config: &WatConfig,
        storage: Arc<dyn PersistentStorage>,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let history = Arc::new(
            TransactionHistory::open(storage.clone(), collaborators.events.clone())
                .context("Failed to open transaction history")?,
        );
        let off_log = history
            .register::<WatOffTransaction>(config.off_log_capacity)
            .context("Failed to open WAT off log")?;
        let on_log = history
            .register::<WatOnTransaction>(config.on_log_capacity)
            .context("Failed to open WAT on log")?;

        let coordinator = Arc::new(
            TransactionCoordinator::open(storage.clone())
                .context("Failed to open transaction coordinator")?,
        );

        let ctx = WatContext {
            coordinator: coordinator.clone(),
            storage: storage.clone(),
            ledger: collaborators.ledger,
            meters: collaborators.meters,
            events: collaborators.events,
            display: collaborators.display,
        };
        let off = Arc::new(WatOffProvider::new(ctx.clone(), off_log, config));
        let on = Arc::new(WatOnProvider::new(ctx, on_log, config));

        let recovered_off = off.recover().context("WAT off recovery failed")?;
        let recovered_on = on.recover().context("WAT on recovery failed")?;
        if recovered_off + recovered_on > 0 {
            warn!(recovered_off, recovered_on, "Unsettled transfers closed after restart");
        }

        info!(
            device_id = config.device_id,
            last_transaction_id = history.last_transaction_id(),
            "WAT system started"
        );

        Ok(Self {
            storage,
            coordinator,
            history,
            off,
            on,
        })
    }

    /// Stop the coordinator dispatcher; queued requestors are not served
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        info!("WAT system stopped");
    }
}
