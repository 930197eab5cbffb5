//! Transaction Coordinator
//!
//! Process-wide mutual-exclusion broker for the credit ledger. At most one
//! reservation ("bank transaction") is active at any time; everyone else
//! waits in a fair queue.
//!
//! # Grant flow
//!
//! ```text
//!  request ──► free? ──yes──► ACTIVE(token, requestor)
//!                │
//!                no
//!                ▼
//!             QUEUE ──dispatcher──► PENDING(grant, requestor)
//!                                        │ notify_transaction_ready(grant)
//!                                        ▼
//!                      retrieve_transaction(grant) ──► ACTIVE
//!                                                        │ release
//!                                                        ▼
//!                                              dispatcher serves next
//! ```
//!
//! # Persistence
//!
//! Block `TransactionCoordinator` holds the active token and its requestor
//! plus the pending grant and its requestor. Each change is durable before
//! the in-memory state moves, so nothing a caller has seen is lost on a
//! restart. A pending grant found at open is dropped: its requestor did not
//! survive the restart and nothing will ever retrieve it.

pub mod error;
pub mod proxy;

pub use error::CoordinatorError;
pub use proxy::TransferRequestProxy;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::core_types::{GrantId, RequestorId, ReservationToken};
use crate::storage::{PersistentStorage, ScopedTransaction, StorageError, read_value};

const COORDINATOR_BLOCK: &str = "TransactionCoordinator";
const ACTIVE_TOKEN_KEY: &str = "ActiveToken";
const ACTIVE_REQUESTOR_KEY: &str = "ActiveRequestor";
const PENDING_GRANT_KEY: &str = "PendingGrant";
const PENDING_REQUESTOR_KEY: &str = "PendingRequestor";

/// Back-off after the dispatcher failed to persist a grant
const DISPATCH_RETRY: Duration = Duration::from_millis(100);

/// What the requestor intends to do with the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    Read,
    Write,
}

/// Narrow callback capability of a queued requestor
pub trait TransactionRequestor: Send + Sync {
    fn requestor_id(&self) -> RequestorId;

    /// Called by the dispatcher thread; the requestor should answer with
    /// [`TransactionCoordinator::retrieve_transaction`]
    fn notify_transaction_ready(&self, grant: GrantId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveReservation {
    token: ReservationToken,
    requestor: RequestorId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingGrant {
    grant: GrantId,
    requestor: RequestorId,
}

struct QueuedRequest {
    requestor: Arc<dyn TransactionRequestor>,
    kind: TransactionType,
    jumped: bool,
}

struct CoordinatorState {
    active: Option<ActiveReservation>,
    pending: Option<PendingGrant>,
    /// The object the pending grant was delivered to (not persisted)
    pending_owner: Option<Arc<dyn TransactionRequestor>>,
    queue: VecDeque<QueuedRequest>,
    shutdown: bool,
}

impl CoordinatorState {
    fn is_free(&self) -> bool {
        self.active.is_none() && self.pending.is_none()
    }

    /// A new request may take the reservation without queueing
    fn can_grant_now(&self, jump: bool) -> bool {
        if !self.is_free() {
            return false;
        }
        match self.queue.front() {
            None => true,
            Some(head) => jump && !head.jumped,
        }
    }

    fn clear_pending(&mut self) {
        self.pending = None;
        self.pending_owner = None;
    }

    fn remove_queued(&mut self, requestor: RequestorId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|q| q.requestor.requestor_id() != requestor);
        self.queue.len() != before
    }

    /// Jumpers go behind earlier jumpers but ahead of everyone else
    fn enqueue(&mut self, request: QueuedRequest) {
        if request.jumped {
            let at = self.queue.iter().take_while(|q| q.jumped).count();
            self.queue.insert(at, request);
        } else {
            self.queue.push_back(request);
        }
    }
}

struct Shared {
    state: Mutex<CoordinatorState>,
    wake: Condvar,
    storage: Arc<dyn PersistentStorage>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stage_active(
        scope: &mut ScopedTransaction,
        active: Option<ActiveReservation>,
    ) -> Result<(), StorageError> {
        scope.write(COORDINATOR_BLOCK, ACTIVE_TOKEN_KEY, &active.map(|a| a.token))?;
        scope.write(COORDINATOR_BLOCK, ACTIVE_REQUESTOR_KEY, &active.map(|a| a.requestor))
    }

    fn stage_pending(
        scope: &mut ScopedTransaction,
        pending: Option<PendingGrant>,
    ) -> Result<(), StorageError> {
        scope.write(COORDINATOR_BLOCK, PENDING_GRANT_KEY, &pending.map(|p| p.grant))?;
        scope.write(COORDINATOR_BLOCK, PENDING_REQUESTOR_KEY, &pending.map(|p| p.requestor))
    }

    fn persist(
        &self,
        active: Option<Option<ActiveReservation>>,
        pending: Option<Option<PendingGrant>>,
    ) -> Result<(), StorageError> {
        let mut scope = ScopedTransaction::new(self.storage.clone());
        if let Some(active) = active {
            Self::stage_active(&mut scope, active)?;
        }
        if let Some(pending) = pending {
            Self::stage_pending(&mut scope, pending)?;
        }
        scope.commit()
    }

    /// Make `requestor` the active owner under a fresh token
    fn activate(
        &self,
        state: &mut CoordinatorState,
        requestor: RequestorId,
        clear_pending: bool,
    ) -> Result<ReservationToken, StorageError> {
        let active = ActiveReservation {
            token: ReservationToken::new(),
            requestor,
        };
        self.persist(Some(Some(active)), clear_pending.then_some(None))?;
        state.active = Some(active);
        if clear_pending {
            state.clear_pending();
        }
        Ok(active.token)
    }
}

/// The single reservation broker, owned by the composition root
pub struct TransactionCoordinator {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionCoordinator {
    /// Load persisted state and start the dispatcher thread
    pub fn open(storage: Arc<dyn PersistentStorage>) -> Result<Self, CoordinatorError> {
        storage.create_block(COORDINATOR_BLOCK)?;

        let token = read_value::<Option<ReservationToken>>(
            storage.as_ref(),
            COORDINATOR_BLOCK,
            ACTIVE_TOKEN_KEY,
        )?
        .flatten();
        let owner = read_value::<Option<RequestorId>>(
            storage.as_ref(),
            COORDINATOR_BLOCK,
            ACTIVE_REQUESTOR_KEY,
        )?
        .flatten();
        let active = match (token, owner) {
            (Some(token), Some(requestor)) => {
                info!(token = %token, requestor = %requestor, "Restored active reservation");
                Some(ActiveReservation { token, requestor })
            }
            _ => None,
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(CoordinatorState {
                active,
                pending: None,
                pending_owner: None,
                queue: VecDeque::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
            storage: storage.clone(),
        });

        let orphan =
            read_value::<Option<GrantId>>(storage.as_ref(), COORDINATOR_BLOCK, PENDING_GRANT_KEY)?
                .flatten();
        if let Some(grant) = orphan {
            warn!(grant = %grant, "Dropping pending grant orphaned by restart");
        }
        shared.persist(None, Some(None))?;

        let worker = shared.clone();
        let handle = std::thread::Builder::new()
            .name("wat-coordinator".to_string())
            .spawn(move || dispatch_loop(worker))
            .map_err(|e| CoordinatorError::Dispatcher(e.to_string()))?;

        Ok(Self {
            shared,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    /// Request the reservation, blocking up to `timeout`
    ///
    /// With a zero timeout only an immediate grant is attempted; nothing is
    /// queued. On expiry the request is abandoned and `None` returned.
    pub fn request_transaction(
        &self,
        requestor: RequestorId,
        timeout: Duration,
        kind: TransactionType,
        jump_queue: bool,
    ) -> Result<Option<ReservationToken>, CoordinatorError> {
        if requestor.is_nil() {
            error!("Transaction requested with an empty requestor id");
            return Err(CoordinatorError::EmptyRequestorId);
        }

        if timeout.is_zero() {
            let mut state = self.shared.lock();
            if !state.can_grant_now(jump_queue) {
                return Ok(None);
            }
            if Self::is_holder(&state, requestor) {
                return Ok(None);
            }
            let token = self.shared.activate(&mut state, requestor, false)?;
            debug!(requestor = %requestor, token = %token, ?kind, "Reservation granted immediately");
            return Ok(Some(token));
        }

        // waiting would end in abandoning the caller's own reservation
        if Self::is_holder(&self.shared.lock(), requestor) {
            warn!(requestor = %requestor, "Requestor already holds or awaits the reservation");
            return Ok(None);
        }

        let proxy = Arc::new(TransferRequestProxy::new(requestor));
        if let Some(token) = self.request_transaction_for(proxy.clone(), kind, jump_queue)? {
            return Ok(Some(token));
        }

        match proxy.wait(timeout) {
            Some(grant) => match self.retrieve_transaction(grant) {
                Ok(token) => Ok(Some(token)),
                Err(e) => {
                    self.withdraw(&proxy)?;
                    Err(e)
                }
            },
            None => {
                debug!(requestor = %requestor, ?timeout, "Reservation request timed out");
                self.withdraw(&proxy)?;
                Ok(None)
            }
        }
    }

    /// Undo a blocking request: its own queue entry and a grant delivered to it
    ///
    /// Unlike [`abandon_transactions`](Self::abandon_transactions) this never
    /// touches state won by another request that shares the requestor id.
    fn withdraw(&self, proxy: &Arc<TransferRequestProxy>) -> Result<(), CoordinatorError> {
        let mut state = self.shared.lock();
        let before = state.queue.len();
        state.queue.retain(|q| !is_same_requestor(&q.requestor, proxy));
        let dequeued = state.queue.len() != before;

        let drop_pending = state
            .pending_owner
            .as_ref()
            .is_some_and(|owner| is_same_requestor(owner, proxy));
        if drop_pending {
            self.shared.persist(None, Some(None))?;
            state.clear_pending();
        }

        if dequeued || drop_pending {
            debug!(
                requestor = %proxy.requestor_id(),
                dequeued,
                pending = drop_pending,
                "Blocking request withdrawn"
            );
        }
        drop(state);
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Request the reservation, queueing when it cannot be granted now
    ///
    /// A queued requestor is told through
    /// [`TransactionRequestor::notify_transaction_ready`]. Queueing again
    /// replaces the requestor's earlier entry.
    pub fn request_transaction_for(
        &self,
        requestor: Arc<dyn TransactionRequestor>,
        kind: TransactionType,
        jump_queue: bool,
    ) -> Result<Option<ReservationToken>, CoordinatorError> {
        let id = requestor.requestor_id();
        if id.is_nil() {
            error!("Transaction requested with an empty requestor id");
            return Err(CoordinatorError::EmptyRequestorId);
        }

        let mut state = self.shared.lock();
        if Self::is_holder(&state, id) {
            warn!(requestor = %id, "Requestor already holds or awaits the reservation");
            return Ok(None);
        }

        state.remove_queued(id);
        if state.can_grant_now(jump_queue) {
            let token = self.shared.activate(&mut state, id, false)?;
            debug!(requestor = %id, token = %token, ?kind, "Reservation granted immediately");
            return Ok(Some(token));
        }

        state.enqueue(QueuedRequest {
            requestor,
            kind,
            jumped: jump_queue,
        });
        debug!(requestor = %id, ?kind, jump_queue, depth = state.queue.len(), "Reservation request queued");
        drop(state);
        self.shared.wake.notify_all();
        Ok(None)
    }

    fn is_holder(state: &CoordinatorState, requestor: RequestorId) -> bool {
        state.active.is_some_and(|a| a.requestor == requestor)
            || state.pending.is_some_and(|p| p.requestor == requestor)
    }

    /// Turn the pending grant into the active reservation
    pub fn retrieve_transaction(&self, grant: GrantId) -> Result<ReservationToken, CoordinatorError> {
        let mut state = self.shared.lock();
        let pending = match state.pending {
            Some(pending) => pending,
            None => {
                error!(grant = %grant, "Retrieve without a pending grant");
                return Err(CoordinatorError::NoPendingGrant { grant });
            }
        };
        if pending.grant != grant {
            error!(grant = %grant, pending = %pending.grant, "Retrieve of a stale grant");
            return Err(CoordinatorError::GrantMismatch {
                grant,
                pending: pending.grant,
            });
        }

        let token = self.shared.activate(&mut state, pending.requestor, true)?;
        debug!(requestor = %pending.requestor, token = %token, "Reservation retrieved");
        Ok(token)
    }

    /// Release the active reservation if `token` is it
    pub fn release_transaction(&self, token: ReservationToken) -> Result<bool, CoordinatorError> {
        let mut state = self.shared.lock();
        let released = state.active.is_some_and(|a| a.token == token);
        if released {
            self.shared.persist(Some(None), None)?;
            state.active = None;
            debug!(token = %token, "Reservation released");
        }
        drop(state);
        self.shared.wake.notify_all();
        Ok(released)
    }

    /// Stage the release of `token` in `scope`
    ///
    /// The reservation is freed when the scope commits, together with the
    /// ledger and log writes it guards. Returns `false` if `token` is not
    /// the active reservation.
    pub fn release_transaction_in(
        &self,
        scope: &mut ScopedTransaction,
        token: ReservationToken,
    ) -> Result<bool, CoordinatorError> {
        if !self.verify_current_transaction(token) {
            return Ok(false);
        }

        Shared::stage_active(scope, None)?;
        let shared = self.shared.clone();
        scope.on_commit(move || {
            let mut state = shared.lock();
            if state.active.is_some_and(|a| a.token == token) {
                state.active = None;
                debug!(token = %token, "Reservation released with scope");
            }
            drop(state);
            shared.wake.notify_all();
        });
        Ok(true)
    }

    /// Remove `requestor` from the active, pending and queued state
    pub fn abandon_transactions(&self, requestor: RequestorId) -> Result<(), CoordinatorError> {
        let mut state = self.shared.lock();
        let dequeued = state.remove_queued(requestor);

        let drop_active = state.active.is_some_and(|a| a.requestor == requestor);
        let drop_pending = state.pending.is_some_and(|p| p.requestor == requestor);
        if drop_active || drop_pending {
            self.shared
                .persist(drop_active.then_some(None), drop_pending.then_some(None))?;
            if drop_active {
                state.active = None;
            }
            if drop_pending {
                state.clear_pending();
            }
        }

        if dequeued || drop_active || drop_pending {
            debug!(
                requestor = %requestor,
                dequeued,
                active = drop_active,
                pending = drop_pending,
                "Requestor abandoned"
            );
        }
        drop(state);
        self.shared.wake.notify_all();
        Ok(())
    }

    pub fn verify_current_transaction(&self, token: ReservationToken) -> bool {
        self.shared.lock().active.is_some_and(|a| a.token == token)
    }

    /// Active token owned by `requestor`, if any
    pub fn get_current(&self, requestor: RequestorId) -> Option<ReservationToken> {
        self.shared
            .lock()
            .active
            .filter(|a| a.requestor == requestor)
            .map(|a| a.token)
    }

    /// Active token and its owner, if the ledger is reserved
    pub fn current_holder(&self) -> Option<(ReservationToken, RequestorId)> {
        self.shared.lock().active.map(|a| (a.token, a.requestor))
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn has_pending_grant(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    pub fn is_reserved(&self) -> bool {
        self.shared.lock().active.is_some()
    }

    /// Stop the dispatcher and wait for it; queued requestors are never served
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Coordinator dispatcher panicked");
            }
            info!("Coordinator dispatcher stopped");
        }
    }
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn is_same_requestor(queued: &Arc<dyn TransactionRequestor>, proxy: &Arc<TransferRequestProxy>) -> bool {
    std::ptr::eq(Arc::as_ptr(queued) as *const (), Arc::as_ptr(proxy) as *const ())
}

/// Grants the reservation to the head of the queue whenever it is free
fn dispatch_loop(shared: Arc<Shared>) {
    info!("Coordinator dispatcher started");
    loop {
        let mut state = shared.lock();
        while !state.shutdown && !(state.is_free() && !state.queue.is_empty()) {
            state = shared
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.shutdown {
            return;
        }

        let Some(next) = state.queue.pop_front() else {
            continue;
        };
        let pending = PendingGrant {
            grant: GrantId::new(),
            requestor: next.requestor.requestor_id(),
        };

        match shared.persist(None, Some(Some(pending))) {
            Ok(()) => {
                state.pending = Some(pending);
                state.pending_owner = Some(next.requestor.clone());
                drop(state);
                debug!(
                    requestor = %pending.requestor,
                    grant = %pending.grant,
                    kind = ?next.kind,
                    "Reservation granted to queued requestor"
                );
                next.requestor.notify_transaction_ready(pending.grant);
            }
            Err(e) => {
                error!(requestor = %pending.requestor, error = %e, "Failed to persist grant");
                state.queue.push_front(next);
                drop(state);
                std::thread::sleep(DISPATCH_RETRY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn open() -> (Arc<dyn PersistentStorage>, TransactionCoordinator) {
        let storage: Arc<dyn PersistentStorage> = Arc::new(MemoryStorage::new());
        let coordinator = TransactionCoordinator::open(storage.clone()).unwrap();
        (storage, coordinator)
    }

    /// Queued requestor that reports its grants over a channel
    struct Recorder {
        id: RequestorId,
        tx: Mutex<mpsc::Sender<(RequestorId, GrantId)>>,
    }

    impl Recorder {
        fn new(tx: &mpsc::Sender<(RequestorId, GrantId)>) -> Arc<Self> {
            Arc::new(Self {
                id: RequestorId::random(),
                tx: Mutex::new(tx.clone()),
            })
        }
    }

    impl TransactionRequestor for Recorder {
        fn requestor_id(&self) -> RequestorId {
            self.id
        }

        fn notify_transaction_ready(&self, grant: GrantId) {
            let _ = self.tx.lock().unwrap().send((self.id, grant));
        }
    }

    #[test]
    fn test_immediate_grant_and_release() {
        let (_storage, coordinator) = open();
        let owner = RequestorId::random();

        let token = coordinator
            .request_transaction(owner, Duration::ZERO, TransactionType::Write, false)
            .unwrap()
            .unwrap();
        assert!(coordinator.verify_current_transaction(token));
        assert_eq!(coordinator.get_current(owner), Some(token));
        assert_eq!(coordinator.get_current(RequestorId::random()), None);

        assert!(!coordinator.release_transaction(ReservationToken::new()).unwrap());
        assert!(coordinator.verify_current_transaction(token));

        assert!(coordinator.release_transaction(token).unwrap());
        assert!(!coordinator.verify_current_transaction(token));
        assert!(!coordinator.is_reserved());
    }

    #[test]
    fn test_zero_timeout_when_busy_does_not_queue() {
        let (_storage, coordinator) = open();
        coordinator
            .request_transaction(RequestorId::random(), Duration::ZERO, TransactionType::Write, false)
            .unwrap()
            .unwrap();

        let other = coordinator
            .request_transaction(RequestorId::random(), Duration::ZERO, TransactionType::Read, true)
            .unwrap();
        assert!(other.is_none());
        assert_eq!(coordinator.queue_len(), 0);
    }

    #[test]
    fn test_empty_requestor_id_is_an_error() {
        let (_storage, coordinator) = open();
        let err = coordinator
            .request_transaction(RequestorId::nil(), Duration::ZERO, TransactionType::Write, false)
            .unwrap_err();
        assert_eq!(err.code(), "EMPTY_REQUESTOR_ID");
    }

    #[test]
    fn test_queue_order_fifo_with_jumpers_first() {
        let (_storage, coordinator) = open();
        let (tx, rx) = mpsc::channel();

        let holder = coordinator
            .request_transaction(RequestorId::random(), Duration::ZERO, TransactionType::Write, false)
            .unwrap()
            .unwrap();

        let b = Recorder::new(&tx);
        let c = Recorder::new(&tx);
        let d = Recorder::new(&tx);
        let e = Recorder::new(&tx);
        for (r, jump) in [(&b, false), (&c, false), (&d, true), (&e, true)] {
            let granted = coordinator
                .request_transaction_for(r.clone(), TransactionType::Write, jump)
                .unwrap();
            assert!(granted.is_none());
        }
        assert_eq!(coordinator.queue_len(), 4);

        coordinator.release_transaction(holder).unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            let (id, grant) = rx.recv_timeout(WAIT).unwrap();
            order.push(id);
            let token = coordinator.retrieve_transaction(grant).unwrap();
            coordinator.release_transaction(token).unwrap();
        }
        assert_eq!(order, vec![d.id, e.id, b.id, c.id]);
    }

    #[test]
    fn test_retrieve_errors() {
        let (_storage, coordinator) = open();
        let err = coordinator.retrieve_transaction(GrantId::new()).unwrap_err();
        assert!(matches!(err, CoordinatorError::NoPendingGrant { .. }));

        let (tx, rx) = mpsc::channel();
        let holder = coordinator
            .request_transaction(RequestorId::random(), Duration::ZERO, TransactionType::Write, false)
            .unwrap()
            .unwrap();
        let queued = Recorder::new(&tx);
        coordinator
            .request_transaction_for(queued.clone(), TransactionType::Write, false)
            .unwrap();
        coordinator.release_transaction(holder).unwrap();
        let (_, grant) = rx.recv_timeout(WAIT).unwrap();

        let err = coordinator.retrieve_transaction(GrantId::new()).unwrap_err();
        assert_eq!(err.code(), "GRANT_MISMATCH");
        // the real grant is still retrievable
        let token = coordinator.retrieve_transaction(grant).unwrap();
        assert_eq!(coordinator.get_current(queued.id), Some(token));
    }

    #[test]
    fn test_blocking_request_granted_after_release() {
        let (_storage, coordinator) = open();
        let coordinator = Arc::new(coordinator);
        let holder = coordinator
            .request_transaction(RequestorId::random(), Duration::ZERO, TransactionType::Write, false)
            .unwrap()
            .unwrap();

        let waiter = RequestorId::random();
        let c = coordinator.clone();
        let handle = std::thread::spawn(move || {
            c.request_transaction(waiter, WAIT, TransactionType::Write, false)
                .unwrap()
        });

        while coordinator.queue_len() == 0 {
            std::thread::sleep(Duration::from_millis(2));
        }
        coordinator.release_transaction(holder).unwrap();

        let token = handle.join().unwrap().unwrap();
        assert_eq!(coordinator.get_current(waiter), Some(token));
    }

    #[test]
    fn test_blocking_request_times_out_and_abandons() {
        let (_storage, coordinator) = open();
        let holder = coordinator
            .request_transaction(RequestorId::random(), Duration::ZERO, TransactionType::Write, false)
            .unwrap()
            .unwrap();

        let waiter = RequestorId::random();
        let result = coordinator
            .request_transaction(waiter, Duration::from_millis(30), TransactionType::Write, false)
            .unwrap();
        assert!(result.is_none());
        assert_eq!(coordinator.queue_len(), 0);

        coordinator.release_transaction(holder).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!coordinator.has_pending_grant());
        assert!(!coordinator.is_reserved());
    }

    #[test]
    fn test_timed_out_request_leaves_same_id_request_alone() {
        let (_storage, coordinator) = open();
        let coordinator = Arc::new(coordinator);
        let holder = coordinator
            .request_transaction(RequestorId::random(), Duration::ZERO, TransactionType::Write, false)
            .unwrap()
            .unwrap();
        let shared_id = RequestorId::random();

        let c = coordinator.clone();
        let first = std::thread::spawn(move || {
            c.request_transaction(shared_id, Duration::from_millis(150), TransactionType::Write, true)
                .unwrap()
        });
        while coordinator.queue_len() == 0 {
            std::thread::sleep(Duration::from_millis(2));
        }

        let c = coordinator.clone();
        let second = std::thread::spawn(move || {
            c.request_transaction(shared_id, WAIT, TransactionType::Write, true)
                .unwrap()
        });
        std::thread::sleep(Duration::from_millis(50));

        assert!(first.join().unwrap().is_none());
        // the second request is still waiting
        assert_eq!(coordinator.queue_len(), 1);

        coordinator.release_transaction(holder).unwrap();
        let token = second.join().unwrap().unwrap();

        assert!(coordinator.verify_current_transaction(token));
        let unrelated = coordinator
            .request_transaction(RequestorId::random(), Duration::ZERO, TransactionType::Write, true)
            .unwrap();
        assert!(unrelated.is_none());
        assert_eq!(coordinator.current_holder(), Some((token, shared_id)));
    }

    #[test]
    fn test_abandon_is_idempotent() {
        let (_storage, coordinator) = open();
        let owner = RequestorId::random();
        coordinator
            .request_transaction(owner, Duration::ZERO, TransactionType::Write, false)
            .unwrap()
            .unwrap();

        coordinator.abandon_transactions(owner).unwrap();
        assert!(!coordinator.is_reserved());
        coordinator.abandon_transactions(owner).unwrap();
        assert!(!coordinator.is_reserved());
    }

    #[test]
    fn test_release_in_scope_waits_for_commit() {
        let (storage, coordinator) = open();
        let token = coordinator
            .request_transaction(RequestorId::random(), Duration::ZERO, TransactionType::Write, false)
            .unwrap()
            .unwrap();

        {
            let mut scope = ScopedTransaction::new(storage.clone());
            assert!(coordinator.release_transaction_in(&mut scope, token).unwrap());
        }
        assert!(coordinator.verify_current_transaction(token));

        let mut scope = ScopedTransaction::new(storage.clone());
        assert!(coordinator.release_transaction_in(&mut scope, token).unwrap());
        scope.commit().unwrap();
        assert!(!coordinator.verify_current_transaction(token));

        let mut scope = ScopedTransaction::new(storage);
        assert!(!coordinator.release_transaction_in(&mut scope, token).unwrap());
    }

    #[test]
    fn test_restart_restores_active_reservation() {
        let (storage, coordinator) = open();
        let owner = RequestorId::random();
        let token = coordinator
            .request_transaction(owner, Duration::ZERO, TransactionType::Write, false)
            .unwrap()
            .unwrap();
        drop(coordinator);

        let reopened = TransactionCoordinator::open(storage).unwrap();
        assert_eq!(reopened.get_current(owner), Some(token));
        assert!(reopened.release_transaction(token).unwrap());
    }

    #[test]
    fn test_restart_drops_orphaned_grant() {
        let (storage, coordinator) = open();
        let (tx, rx) = mpsc::channel();
        let holder = coordinator
            .request_transaction(RequestorId::random(), Duration::ZERO, TransactionType::Write, false)
            .unwrap()
            .unwrap();
        coordinator
            .request_transaction_for(Recorder::new(&tx), TransactionType::Write, false)
            .unwrap();
        coordinator.release_transaction(holder).unwrap();
        let (_, grant) = rx.recv_timeout(WAIT).unwrap();
        assert!(coordinator.has_pending_grant());
        drop(coordinator);

        let reopened = TransactionCoordinator::open(storage).unwrap();
        assert!(!reopened.has_pending_grant());
        assert!(reopened.retrieve_transaction(grant).is_err());
        let fresh = reopened
            .request_transaction(RequestorId::random(), Duration::ZERO, TransactionType::Write, false)
            .unwrap();
        assert!(fresh.is_some());
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let (_storage, coordinator) = open();
        let coordinator = Arc::new(coordinator);
        let held = Arc::new(AtomicBool::new(false));
        let served = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                let held = held.clone();
                let served = served.clone();
                std::thread::spawn(move || {
                    let me = RequestorId::random();
                    let token = coordinator
                        .request_transaction(me, Duration::from_secs(10), TransactionType::Write, false)
                        .unwrap()
                        .unwrap();
                    assert!(!held.swap(true, Ordering::SeqCst));
                    std::thread::sleep(Duration::from_millis(2));
                    held.store(false, Ordering::SeqCst);
                    served.fetch_add(1, Ordering::SeqCst);
                    assert!(coordinator.release_transaction(token).unwrap());
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(served.load(Ordering::SeqCst), 8);
    }
}
