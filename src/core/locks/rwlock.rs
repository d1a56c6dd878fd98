//! A reentrant reader-writer lock owned by transactions rather than threads
//!
//! One `RWLock` guards one [`LockResource`]. Counts are kept per transaction,
//! so a transaction may take the same lock several times, hold read and write
//! at once, and upgrade from read to write without deadlocking against itself.
//!
//! Blocking follows the usual monitor pattern: a `parking_lot::Mutex` guards
//! the whole state and a single `Condvar` is used to wait. A waiter re-checks
//! its own grant condition every time it wakes up, so spurious wakeups and
//! wakeups meant for someone else are harmless.
//!
//! Before blocking, the wait is registered with the shared [`RagManager`],
//! which refuses it with `LockError::DeadlockDetected` if it would close a
//! cycle. Registration happens with this lock's monitor held, so no release on
//! this lock can slip in between the check and the wait.
//!
//! # Queueing policy
//!
//! Requests that cannot be granted wait in arrival order. A transaction that
//! holds nothing on the lock yet does not overtake earlier waiters: a new
//! writer waits behind everyone, a new reader waits behind any queued writer.
//! A transaction that already holds a count here is only held back by the
//! counts of other transactions, since it would otherwise wait for a writer
//! that is itself waiting for it.

use crate::core::error::{LockError, LockResult};
use crate::core::graph::RagManager;
use crate::core::tracer::{Clock, LockTracer, LockWait, WaitOutcome};
use crate::core::types::{LockResource, LockTransaction, LockType, TxId};
use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

/// What one transaction holds on one lock. Never stored with both counts at zero.
struct TxLockElement {
    transaction: LockTransaction,
    read_count: u32,
    write_count: u32,
}

impl TxLockElement {
    fn new(transaction: LockTransaction) -> Self {
        TxLockElement {
            transaction,
            read_count: 0,
            write_count: 0,
        }
    }

    fn is_free(&self) -> bool {
        self.read_count == 0 && self.write_count == 0
    }
}

/// A blocked request
struct WaitingRequest {
    ticket: u64,
    transaction: LockTransaction,
    lock_type: LockType,
    /// Set by `terminate_lock_requests_for_lock_transaction`
    terminated: bool,
}

struct LockState {
    total_read_count: u32,
    total_write_count: u32,
    elements: FxHashMap<TxId, TxLockElement>,
    waiting: VecDeque<WaitingRequest>,
    next_ticket: u64,
    mark_count: u32,
}

impl LockState {
    fn new() -> Self {
        LockState {
            total_read_count: 0,
            total_write_count: 0,
            elements: FxHashMap::default(),
            waiting: VecDeque::new(),
            next_ticket: 0,
            mark_count: 0,
        }
    }

    /// Can `tx` get `lock_type` now, given that `ahead` queued requests arrived before it?
    fn can_grant(&self, tx: TxId, lock_type: LockType, ahead: usize) -> bool {
        let (read, write, holds) = match self.elements.get(&tx) {
            Some(e) => (e.read_count, e.write_count, true),
            None => (0, 0, false),
        };

        // Another transaction holds the write lock
        if self.total_write_count != write {
            return false;
        }

        match lock_type {
            LockType::Read => {
                holds
                    || !self
                        .waiting
                        .iter()
                        .take(ahead)
                        .any(|w| w.lock_type == LockType::Write)
            }
            LockType::Write => self.total_read_count == read && (holds || ahead == 0),
        }
    }

    /// Is some queued request grantable or waiting to observe its termination?
    fn has_runnable_waiter(&self) -> bool {
        self.waiting.iter().enumerate().any(|(ahead, w)| {
            w.terminated
                || w.transaction.is_terminated()
                || self.can_grant(w.transaction.id(), w.lock_type, ahead)
        })
    }

    fn enqueue(&mut self, transaction: &LockTransaction, lock_type: LockType) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiting.push_back(WaitingRequest {
            ticket,
            transaction: transaction.clone(),
            lock_type,
            terminated: false,
        });
        ticket
    }

    fn position_of(&self, ticket: u64) -> Option<usize> {
        self.waiting.iter().position(|w| w.ticket == ticket)
    }

    fn dequeue(&mut self, ticket: u64) {
        if let Some(pos) = self.position_of(ticket) {
            self.waiting.remove(pos);
        }
    }

    fn is_idle(&self) -> bool {
        self.elements.is_empty() && self.waiting.is_empty() && self.mark_count == 0
    }
}

/// Per-transaction counts in a [`LockSnapshot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HolderCounts {
    pub transaction_id: TxId,
    pub read_count: u32,
    pub write_count: u32,
}

/// Point-in-time copy of a lock's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSnapshot {
    pub resource: LockResource,
    pub read_count: u32,
    pub write_count: u32,
    /// Sorted by transaction id
    pub holders: Vec<HolderCounts>,
    /// Blocked requests, in arrival order
    pub waiting: Vec<(TxId, LockType)>,
}

/// Reentrant read/write lock for one resource
///
/// Normally created and owned by the lock manager's registry; it can also be
/// used standalone, in which case `mark` is not needed.
pub struct RWLock {
    resource: LockResource,
    state: Mutex<LockState>,
    condvar: Condvar,
    rag: Arc<RagManager>,
    clock: Arc<dyn Clock>,
}

impl RWLock {
    /// Create a free lock for `resource`
    ///
    /// # Arguments
    /// * `resource` - What this lock protects
    /// * `rag` - Deadlock detector shared by every lock of the same manager
    /// * `clock` - Time source for wait events
    pub fn new(resource: LockResource, rag: Arc<RagManager>, clock: Arc<dyn Clock>) -> Self {
        RWLock {
            resource,
            state: Mutex::new(LockState::new()),
            condvar: Condvar::new(),
            rag,
            clock,
        }
    }

    pub fn resource(&self) -> LockResource {
        self.resource
    }

    /// Pin the lock so the registry does not evict it before the pending call
    /// uses it
    pub fn mark(&self) {
        self.state.lock().mark_count += 1;
    }

    /// Drop one pin; returns whether the lock is idle afterwards
    pub(crate) fn unmark(&self) -> bool {
        let mut state = self.state.lock();
        state.mark_count = state.mark_count.saturating_sub(1);
        state.is_idle()
    }

    pub fn is_marked(&self) -> bool {
        self.state.lock().mark_count > 0
    }

    /// No holders, no waiters, no pins
    pub fn is_idle(&self) -> bool {
        self.state.lock().is_idle()
    }

    /// Acquire a read lock, blocking while another transaction writes
    ///
    /// # Returns
    /// * `Ok(true)` - The lock was granted
    /// * `Ok(false)` - The transaction was terminated while waiting
    ///
    /// # Errors
    /// `LockError::DeadlockDetected` if waiting would close a cycle; nothing
    /// is left registered in that case.
    pub fn acquire_read_lock(
        &self,
        tracer: &dyn LockTracer,
        tx: &LockTransaction,
    ) -> LockResult<bool> {
        self.acquire(tracer, tx, LockType::Read)
    }

    /// Acquire a write lock, blocking while any other transaction holds the lock
    ///
    /// A transaction that holds every existing count (for example a read it
    /// wants to upgrade) is granted immediately. Same results as
    /// [`RWLock::acquire_read_lock`].
    pub fn acquire_write_lock(
        &self,
        tracer: &dyn LockTracer,
        tx: &LockTransaction,
    ) -> LockResult<bool> {
        self.acquire(tracer, tx, LockType::Write)
    }

    /// Take a read lock only if that needs no waiting
    pub fn try_read_lock(&self, tx: &LockTransaction) -> bool {
        self.try_acquire(tx, LockType::Read)
    }

    /// Take a write lock only if that needs no waiting
    pub fn try_write_lock(&self, tx: &LockTransaction) -> bool {
        self.try_acquire(tx, LockType::Write)
    }

    fn try_acquire(&self, tx: &LockTransaction, lock_type: LockType) -> bool {
        let mut state = self.state.lock();
        let ahead = state.waiting.len();
        if state.can_grant(tx.id(), lock_type, ahead) {
            self.grant(&mut state, tx, lock_type);
            true
        } else {
            false
        }
    }

    fn acquire(
        &self,
        tracer: &dyn LockTracer,
        tx: &LockTransaction,
        lock_type: LockType,
    ) -> LockResult<bool> {
        let mut state = self.state.lock();

        let ahead = state.waiting.len();
        if state.can_grant(tx.id(), lock_type, ahead) {
            self.grant(&mut state, tx, lock_type);
            return Ok(true);
        }

        // A terminated transaction never starts blocking
        if tx.is_terminated() {
            return Ok(false);
        }

        if let Err(err) = self.rag.check_wait_on(self.resource, tx, lock_type) {
            if let Some(info) = err.deadlock_info() {
                tracer.deadlock_detected(info);
            }
            return Err(err);
        }

        let ticket = state.enqueue(tx, lock_type);
        let wait = LockWait {
            transaction_id: tx.id(),
            resource: self.resource,
            lock_type,
            started_at_nanos: self.clock.nanos(),
        };
        tracer.wait_started(&wait);

        let outcome = loop {
            let Some(ahead) = state.position_of(ticket) else {
                break WaitOutcome::Terminated;
            };
            if state.can_grant(tx.id(), lock_type, ahead) {
                break WaitOutcome::Granted;
            }
            if state.waiting[ahead].terminated || tx.is_terminated() {
                break WaitOutcome::Terminated;
            }
            self.condvar.wait(&mut state);
        };

        state.dequeue(ticket);
        self.rag.stop_wait_on(self.resource, tx);
        if outcome == WaitOutcome::Granted {
            self.grant(&mut state, tx, lock_type);
        }

        let waited = self.clock.nanos().saturating_sub(wait.started_at_nanos);
        tracer.wait_finished(&wait, outcome, waited);

        // Leaving the queue may unblock requests that were queued behind us
        self.wake_waiters_if_runnable(&state);

        Ok(outcome == WaitOutcome::Granted)
    }

    fn grant(&self, state: &mut LockState, tx: &LockTransaction, lock_type: LockType) {
        let mut first_hold = false;
        let element = state.elements.entry(tx.id()).or_insert_with(|| {
            first_hold = true;
            TxLockElement::new(tx.clone())
        });
        match lock_type {
            LockType::Read => {
                element.read_count += 1;
                state.total_read_count += 1;
            }
            LockType::Write => {
                element.write_count += 1;
                state.total_write_count += 1;
            }
        }
        if first_hold {
            self.rag.lock_acquired(self.resource, tx);
        }
    }

    /// Release one read count held by `tx`
    ///
    /// # Errors
    /// `LockError::LockNotFound` if `tx` holds no read count on this lock.
    pub fn release_read_lock(&self, tx: &LockTransaction) -> LockResult<()> {
        self.release(tx, LockType::Read)
    }

    /// Release one write count held by `tx`
    ///
    /// # Errors
    /// `LockError::LockNotFound` if `tx` holds no write count on this lock.
    pub fn release_write_lock(&self, tx: &LockTransaction) -> LockResult<()> {
        self.release(tx, LockType::Write)
    }

    fn release(&self, tx: &LockTransaction, lock_type: LockType) -> LockResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let not_found = || LockError::LockNotFound {
            resource: self.resource,
            transaction: tx.id(),
            lock_type,
        };
        let element = state.elements.get_mut(&tx.id()).ok_or_else(not_found)?;

        match lock_type {
            LockType::Read => {
                if element.read_count == 0 {
                    return Err(not_found());
                }
                element.read_count -= 1;
                state.total_read_count -= 1;
            }
            LockType::Write => {
                if element.write_count == 0 {
                    return Err(not_found());
                }
                element.write_count -= 1;
                state.total_write_count -= 1;
            }
        }

        if element.is_free() {
            state.elements.remove(&tx.id());
            self.rag.lock_released(self.resource, tx);
        }

        self.wake_waiters_if_runnable(state);
        Ok(())
    }

    /// Drop every read and write count `tx` holds here
    ///
    /// Returns the `(read, write)` counts released, or `None` if `tx` held
    /// nothing. Queued requests of `tx` are untouched.
    pub fn release_all(&self, tx: &LockTransaction) -> Option<(u32, u32)> {
        let mut state = self.state.lock();
        let element = state.elements.remove(&tx.id())?;
        state.total_read_count -= element.read_count;
        state.total_write_count -= element.write_count;
        self.rag.lock_released(self.resource, tx);
        self.wake_waiters_if_runnable(&state);
        Some((element.read_count, element.write_count))
    }

    /// Make every queued request of `tx` give up
    ///
    /// The affected `acquire_*` calls return `Ok(false)` and leave the queue.
    /// Locks `tx` already holds are untouched.
    pub fn terminate_lock_requests_for_lock_transaction(&self, tx: &LockTransaction) {
        let mut state = self.state.lock();
        let mut found = false;
        for request in state.waiting.iter_mut().filter(|w| w.transaction == *tx) {
            request.terminated = true;
            found = true;
        }
        if found {
            self.condvar.notify_all();
        }
    }

    fn wake_waiters_if_runnable(&self, state: &LockState) {
        if state.has_runnable_waiter() {
            self.condvar.notify_all();
        }
    }

    pub fn get_read_count(&self) -> u32 {
        self.state.lock().total_read_count
    }

    pub fn get_write_count(&self) -> u32 {
        self.state.lock().total_write_count
    }

    pub fn get_tx_lock_element_count(&self) -> usize {
        self.state.lock().elements.len()
    }

    pub fn get_waiting_threads_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// `(read_count, write_count)` held by `tx`, if it holds anything
    pub fn counts_held_by(&self, tx: TxId) -> Option<(u32, u32)> {
        self.state
            .lock()
            .elements
            .get(&tx)
            .map(|e| (e.read_count, e.write_count))
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock();
        let mut holders: Vec<_> = state
            .elements
            .values()
            .map(|e| HolderCounts {
                transaction_id: e.transaction.id(),
                read_count: e.read_count,
                write_count: e.write_count,
            })
            .collect();
        holders.sort_by_key(|h| h.transaction_id);

        LockSnapshot {
            resource: self.resource,
            read_count: state.total_read_count,
            write_count: state.total_write_count,
            holders,
            waiting: state
                .waiting
                .iter()
                .map(|w| (w.transaction.id(), w.lock_type))
                .collect(),
        }
    }
}
