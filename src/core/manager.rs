//! Registry of per-resource locks
//!
//! The manager maps each [`LockResource`] to its [`RWLock`], creating locks on
//! first use and dropping them again as soon as they have no holders, no
//! waiters and no pending callers, so memory follows active contention only.
//!
//! The registry mutex is only held for map lookups, inserts and removals.
//! Blocking waits happen inside the `RWLock`, after the registry mutex has been
//! released; a `mark` taken under the registry mutex keeps the lock from being
//! evicted until the call that looked it up has finished with it.

use crate::core::error::{LockError, LockResult};
use crate::core::graph::RagManager;
use crate::core::locks::{LockSnapshot, RWLock};
use crate::core::tracer::{Clock, FanoutLockTracer, LockTracer, NoopLockTracer, SystemClock};
use crate::core::types::{ActiveLock, LockResource, LockTransaction, LockType, TxId};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::Arc;

/// Global lock registry shared by every transaction of one database
pub struct LockManager {
    resource_map: Mutex<FxHashMap<LockResource, Arc<RWLock>>>,
    rag: Arc<RagManager>,
    clock: Arc<dyn Clock>,
    tracer: Arc<dyn LockTracer>,
    #[cfg(feature = "event-log")]
    event_log: Option<Arc<crate::core::logger::EventLogTracer>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A registry lock pinned with `mark`; unpins and evicts when dropped
struct MarkedLock<'a> {
    manager: &'a LockManager,
    lock: Arc<RWLock>,
}

impl Drop for MarkedLock<'_> {
    fn drop(&mut self) {
        self.manager.release_mark(&self.lock);
    }
}

impl LockManager {
    /// Create a manager with terse deadlock messages, no tracing and the
    /// system clock. Use [`crate::LockManagerConfig`] for anything else.
    pub fn new() -> Self {
        Self::with_parts(false, Arc::new(NoopLockTracer), Arc::new(SystemClock::new()))
    }

    pub(crate) fn with_parts(
        verbose_deadlocks: bool,
        tracer: Arc<dyn LockTracer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        LockManager {
            resource_map: Mutex::new(FxHashMap::default()),
            rag: Arc::new(RagManager::new(verbose_deadlocks)),
            clock,
            tracer,
            #[cfg(feature = "event-log")]
            event_log: None,
        }
    }

    #[cfg(feature = "event-log")]
    pub(crate) fn set_event_log(&mut self, event_log: Arc<crate::core::logger::EventLogTracer>) {
        self.event_log = Some(event_log);
    }

    /// The tracer configured for this manager
    pub fn tracer(&self) -> &dyn LockTracer {
        self.tracer.as_ref()
    }

    /// The wait-for graph shared by all locks of this manager
    pub fn rag(&self) -> &RagManager {
        &self.rag
    }

    /// The call's tracer followed by the manager's own
    fn tracers_for<'a>(
        &'a self,
        tracer: &'a dyn LockTracer,
    ) -> FanoutLockTracer<&'a dyn LockTracer> {
        FanoutLockTracer::new(vec![tracer, self.tracer.as_ref()])
    }

    /// Look up or create the lock for `resource` and pin it
    fn lock_for_acquiring(&self, resource: LockResource) -> MarkedLock<'_> {
        let mut map = self.resource_map.lock();
        let mut created = false;
        let lock = map.entry(resource).or_insert_with(|| {
            created = true;
            Arc::new(RWLock::new(
                resource,
                Arc::clone(&self.rag),
                Arc::clone(&self.clock),
            ))
        });
        lock.mark();
        let lock = Arc::clone(lock);
        if created {
            self.tracer.lock_created(&resource);
        }
        MarkedLock {
            manager: self,
            lock,
        }
    }

    /// Look up and pin the existing lock for `resource`
    fn lock_for_releasing(
        &self,
        resource: LockResource,
        tx: &LockTransaction,
        lock_type: LockType,
    ) -> LockResult<MarkedLock<'_>> {
        let map = self.resource_map.lock();
        let lock = map.get(&resource).ok_or(LockError::LockNotFound {
            resource,
            transaction: tx.id(),
            lock_type,
        })?;
        lock.mark();
        Ok(MarkedLock {
            manager: self,
            lock: Arc::clone(lock),
        })
    }

    /// Unpin `lock` and evict it if nothing else uses it
    fn release_mark(&self, lock: &Arc<RWLock>) {
        let mut map = self.resource_map.lock();
        if !lock.unmark() {
            return;
        }
        let resource = lock.resource();
        if map
            .get(&resource)
            .is_some_and(|registered| Arc::ptr_eq(registered, lock))
        {
            map.remove(&resource);
            self.tracer.lock_evicted(&resource);
        }
    }

    /// Acquire a read lock on `resource` for `tx`, blocking if needed
    ///
    /// # Returns
    /// * `Ok(true)` - The lock was granted
    /// * `Ok(false)` - `tx` was terminated while waiting
    ///
    /// # Errors
    /// `LockError::DeadlockDetected` if waiting would close a cycle. The caller
    /// should release what `tx` holds and abort it.
    pub fn acquire_read_lock(
        &self,
        tracer: &dyn LockTracer,
        resource: LockResource,
        tx: &LockTransaction,
    ) -> LockResult<bool> {
        let marked = self.lock_for_acquiring(resource);
        marked.lock.acquire_read_lock(&self.tracers_for(tracer), tx)
    }

    /// Acquire a write lock on `resource` for `tx`, blocking if needed
    ///
    /// Same results as [`LockManager::acquire_read_lock`].
    pub fn acquire_write_lock(
        &self,
        tracer: &dyn LockTracer,
        resource: LockResource,
        tx: &LockTransaction,
    ) -> LockResult<bool> {
        let marked = self.lock_for_acquiring(resource);
        marked.lock.acquire_write_lock(&self.tracers_for(tracer), tx)
    }

    /// Take a read lock only if that needs no waiting
    pub fn try_read_lock(&self, resource: LockResource, tx: &LockTransaction) -> bool {
        self.lock_for_acquiring(resource).lock.try_read_lock(tx)
    }

    /// Take a write lock only if that needs no waiting
    pub fn try_write_lock(&self, resource: LockResource, tx: &LockTransaction) -> bool {
        self.lock_for_acquiring(resource).lock.try_write_lock(tx)
    }

    /// # Errors
    /// `LockError::LockNotFound` if `tx` holds no read lock on `resource`.
    pub fn release_read_lock(
        &self,
        resource: LockResource,
        tx: &LockTransaction,
    ) -> LockResult<()> {
        self.lock_for_releasing(resource, tx, LockType::Read)?
            .lock
            .release_read_lock(tx)
    }

    /// # Errors
    /// `LockError::LockNotFound` if `tx` holds no write lock on `resource`.
    pub fn release_write_lock(
        &self,
        resource: LockResource,
        tx: &LockTransaction,
    ) -> LockResult<()> {
        self.lock_for_releasing(resource, tx, LockType::Write)?
            .lock
            .release_write_lock(tx)
    }

    /// Terminate `tx` and make its blocked requests return `Ok(false)`
    ///
    /// Marks `tx` terminated, so it will not start blocking again either.
    /// Locks it already holds are untouched; see [`LockManager::release_all_locks`].
    pub fn terminate_lock_requests_for_lock_transaction(&self, tx: &LockTransaction) {
        tx.mark_terminated();
        for lock in self.registered_locks() {
            lock.terminate_lock_requests_for_lock_transaction(tx);
        }
    }

    /// Release every read and write count `tx` holds, on every resource
    ///
    /// This is the abort path after `DeadlockDetected` or termination. Locks
    /// left idle are evicted. Returns the number of resources `tx` held.
    pub fn release_all_locks(&self, tx: &LockTransaction) -> usize {
        self.marked_locks()
            .into_iter()
            .filter(|marked| marked.lock.release_all(tx).is_some())
            .count()
    }

    /// Pin every registered lock, ordered by resource
    fn marked_locks(&self) -> Vec<MarkedLock<'_>> {
        let map = self.resource_map.lock();
        let mut locks: Vec<_> = map
            .values()
            .map(|lock| {
                lock.mark();
                MarkedLock {
                    manager: self,
                    lock: Arc::clone(lock),
                }
            })
            .collect();
        drop(map);
        locks.sort_by_key(|marked| marked.lock.resource());
        locks
    }

    fn registered_locks(&self) -> Vec<Arc<RWLock>> {
        let map = self.resource_map.lock();
        let mut locks: Vec<_> = map.values().cloned().collect();
        locks.sort_by_key(|l| l.resource());
        locks
    }

    /// Visit a snapshot of every registered lock, ordered by resource
    ///
    /// The registry is copied under its mutex; the visitor runs without it and
    /// may stop early by returning `ControlFlow::Break`.
    pub fn accept<F>(&self, mut visitor: F)
    where
        F: FnMut(&LockSnapshot) -> ControlFlow<()>,
    {
        for lock in self.registered_locks() {
            if visitor(&lock.snapshot()).is_break() {
                return;
            }
        }
    }

    /// Number of resources with a lock in the registry
    pub fn lock_count(&self) -> usize {
        self.resource_map.lock().len()
    }

    /// Snapshot of the lock for `resource`, if one is registered
    pub fn lock_snapshot(&self, resource: LockResource) -> Option<LockSnapshot> {
        let lock = self.resource_map.lock().get(&resource).cloned()?;
        Some(lock.snapshot())
    }

    /// Every lock `tx` holds, one entry per held lock type, ordered by resource
    pub fn active_locks(&self, tx: &LockTransaction) -> Vec<ActiveLock> {
        let mut active = Vec::new();
        for lock in self.registered_locks() {
            let Some((read, write)) = lock.counts_held_by(tx.id()) else {
                continue;
            };
            let held = [(LockType::Read, read), (LockType::Write, write)];
            for (lock_type, _) in held.into_iter().filter(|&(_, count)| count > 0) {
                active.push(ActiveLock {
                    resource: lock.resource(),
                    lock_type,
                    transaction_id: tx.id(),
                });
            }
        }
        active
    }

    pub fn active_lock_count(&self, tx: &LockTransaction) -> usize {
        self.active_locks(tx).len()
    }

    pub fn holds_lock(
        &self,
        tx: &LockTransaction,
        resource: LockResource,
        lock_type: LockType,
    ) -> bool {
        let Some(lock) = self.resource_map.lock().get(&resource).cloned() else {
            return false;
        };
        match (lock.counts_held_by(tx.id()), lock_type) {
            (Some((read, _)), LockType::Read) => read > 0,
            (Some((_, write)), LockType::Write) => write > 0,
            (None, _) => false,
        }
    }

    /// The resource `tx` is blocked on, if any
    pub fn waiting_on(&self, tx: TxId) -> Option<LockResource> {
        self.rag.waiting_on(tx)
    }

    /// Flush the event log configured with `LockManagerConfig::with_log`, if any
    ///
    /// # Errors
    /// Returns an error if the log writer could not confirm the flush
    #[cfg(feature = "event-log")]
    pub fn flush_event_log(&self) -> anyhow::Result<()> {
        match &self.event_log {
            Some(log) => log.flush(),
            None => Ok(()),
        }
    }
}
