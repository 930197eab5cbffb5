//! Event bus seam
//!
//! Publish-only. Subscribers learn about transfer progress here; a `true`
//! from a host-initiated request only means "durably logged".

use tokio::sync::broadcast;
use tracing::trace;

use crate::core_types::{TransactionId, TransactionKind};
use crate::logging::TARGET_EVENTS;
use crate::money::Amounts;

/// Transfer lifecycle milestone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferPhase {
    Requested,
    Initiated,
    Started,
    Authorized,
    Rejected,
    CancelRequested,
    Committed,
    Completed,
}

/// Progress notice for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub kind: TransactionKind,
    pub phase: TransferPhase,
    pub transaction_id: TransactionId,
    /// Empty for machine-initiated transfers
    pub request_id: String,
    /// Amounts relevant to the phase (requested, authorized or transferred)
    pub amounts: Amounts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatEvent {
    Transfer(TransferEvent),
    /// A record was appended to a transaction log
    TransactionSaved {
        kind: TransactionKind,
        transaction_id: TransactionId,
    },
}

pub trait EventBus: Send + Sync {
    fn publish(&self, event: WatEvent);
}

/// Event bus over a tokio broadcast channel
///
/// Publishing never blocks; slow subscribers observe `Lagged`.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<WatEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: WatEvent) {
        trace!(target: TARGET_EVENTS, ?event, "publish");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let bus = BroadcastEventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let event = WatEvent::TransactionSaved {
            kind: TransactionKind::WatOff,
            transaction_id: 3,
        };
        bus.publish(event.clone());

        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = BroadcastEventBus::default();
        bus.publish(WatEvent::TransactionSaved {
            kind: TransactionKind::WatOn,
            transaction_id: 1,
        });
    }
}
