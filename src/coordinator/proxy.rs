//! Transfer Request Proxy
//!
//! Lets a thread block on the coordinator's asynchronous "ready" callback.
//!
//! ```text
//! caller thread                     dispatcher thread
//!   proxy.wait(timeout) ──park──┐
//!                               │   notify_transaction_ready(grant)
//!   ◄───────── wake ────────────┘     stores grant, notify_all
//! ```

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::TransactionRequestor;
use crate::core_types::{GrantId, RequestorId};

/// One-shot promise of a grant, resolved by the dispatcher
pub struct TransferRequestProxy {
    requestor_id: RequestorId,
    grant: Mutex<Option<GrantId>>,
    ready: Condvar,
}

impl TransferRequestProxy {
    pub fn new(requestor_id: RequestorId) -> Self {
        Self {
            requestor_id,
            grant: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Block until a grant arrives or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> Option<GrantId> {
        let guard = self.grant.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |grant| grant.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

impl TransactionRequestor for TransferRequestProxy {
    fn requestor_id(&self) -> RequestorId {
        self.requestor_id
    }

    fn notify_transaction_ready(&self, grant: GrantId) {
        *self.grant.lock().unwrap_or_else(PoisonError::into_inner) = Some(grant);
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out() {
        let proxy = TransferRequestProxy::new(RequestorId::random());
        let start = Instant::now();
        assert!(proxy.wait(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_wakes_on_notify() {
        let proxy = Arc::new(TransferRequestProxy::new(RequestorId::random()));
        let grant = GrantId::new();

        let notifier = proxy.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify_transaction_ready(grant);
        });

        assert_eq!(proxy.wait(Duration::from_secs(5)), Some(grant));
        handle.join().unwrap();
    }

    #[test]
    fn test_grant_before_wait_is_kept() {
        let proxy = TransferRequestProxy::new(RequestorId::random());
        let grant = GrantId::new();
        proxy.notify_transaction_ready(grant);
        assert_eq!(proxy.wait(Duration::ZERO), Some(grant));
    }
}
