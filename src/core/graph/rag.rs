//! Resource allocation graph for detecting deadlocks before they happen
//!
//! The graph is bipartite: a transaction points at the locks it is blocked on,
//! and a lock points at the transactions holding it. A transaction about to
//! block on a lock closes a cycle exactly when, following
//! `holder -> lock it waits on -> holders of that lock -> ...` from the holders
//! of the requested lock, we get back to the requesting transaction.
//!
//! # How it works
//!
//! The graph keeps three mappings:
//! 1. *Holders* (`holders`): `Lock -> [Tx]`, kept in acquisition order so the
//!    search order is repeatable for a given interleaving.
//! 2. *Forward wait edges* (`waiting_on`): `Tx -> [Lock]`. Used to walk the graph (BFS).
//! 3. *Reverse wait edges* (`waited_on_by`): `Lock -> [Tx]`. Used for O(waiters)
//!    introspection and cleanup of a lock's waiters.
//!
//! A wait edge is only ever added after the search found no cycle, so the
//! stored graph itself is always acyclic.

use crate::core::error::{LockError, LockResult};
use crate::core::types::{DeadlockInfo, LockResource, LockTransaction, LockType, TxId};
use chrono::Utc;
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Write;

/// The wait-for state shared by every lock of one lock manager
pub struct ResourceAllocationGraph {
    /// Maps a lock to the transactions holding it, in acquisition order.
    pub(crate) holders: FxHashMap<LockResource, Vec<TxId>>,

    /// Maps a transaction to the locks it is blocked on (outgoing wait edges).
    /// One entry per blocked thread, so a resource may appear more than once.
    pub(crate) waiting_on: FxHashMap<TxId, Vec<LockResource>>,

    /// Maps a lock to the transactions blocked on it (incoming wait edges).
    pub(crate) waited_on_by: FxHashMap<LockResource, Vec<TxId>>,

    // Cached buffers for BFS to avoid repeated allocations
    bfs_queue: VecDeque<TxId>,
    bfs_visited: FxHashSet<TxId>,
    bfs_parent: FxHashMap<TxId, TxId>,
}

impl Default for ResourceAllocationGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceAllocationGraph {
    pub fn new() -> Self {
        Self {
            holders: FxHashMap::default(),
            waiting_on: FxHashMap::default(),
            waited_on_by: FxHashMap::default(),
            bfs_queue: VecDeque::with_capacity(64),
            bfs_visited: FxHashSet::default(),
            bfs_parent: FxHashMap::default(),
        }
    }

    /// Record that `tx` now holds `resource`. Re-entrant grants are no-ops.
    pub fn add_holder(&mut self, resource: LockResource, tx: TxId) {
        let holders = self.holders.entry(resource).or_default();
        if !holders.contains(&tx) {
            holders.push(tx);
        }
    }

    /// Record that `tx` no longer holds anything on `resource`
    pub fn remove_holder(&mut self, resource: LockResource, tx: TxId) {
        if let Some(holders) = self.holders.get_mut(&resource) {
            holders.retain(|&h| h != tx);
            if holders.is_empty() {
                self.holders.remove(&resource);
            }
        }
    }

    /// Add the wait edge `tx -> resource` without any cycle check
    pub fn add_wait(&mut self, resource: LockResource, tx: TxId) {
        self.waiting_on.entry(tx).or_default().push(resource);
        self.waited_on_by.entry(resource).or_default().push(tx);
    }

    /// Remove one wait edge `tx -> resource`, if present
    pub fn remove_wait(&mut self, resource: LockResource, tx: TxId) {
        if let Some(resources) = self.waiting_on.get_mut(&tx)
            && let Some(pos) = resources.iter().position(|&r| r == resource)
        {
            resources.remove(pos);
            if resources.is_empty() {
                self.waiting_on.remove(&tx);
            }

            // Keep the reverse mapping in step
            if let Some(waiters) = self.waited_on_by.get_mut(&resource)
                && let Some(pos) = waiters.iter().position(|&w| w == tx)
            {
                waiters.remove(pos);
                if waiters.is_empty() {
                    self.waited_on_by.remove(&resource);
                }
            }
        }
    }

    /// Find the cycle that `tx` waiting on `resource` would close
    ///
    /// The requesting transaction is skipped among the direct holders of
    /// `resource`: waiting for a lock one already partly holds (an upgrade)
    /// is not a deadlock with oneself.
    ///
    /// # Returns
    /// * `Some(Vec<TxId>)` - The cycle, starting with `tx`; each entry waits on a
    ///   lock held by the next, the last on a lock held by `tx`
    /// * `None` - If no cycle would be created
    pub fn find_cycle(&mut self, resource: LockResource, tx: TxId) -> Option<Vec<TxId>> {
        // Reuse cached buffers
        self.bfs_queue.clear();
        self.bfs_visited.clear();
        self.bfs_parent.clear();

        if let Some(holders) = self.holders.get(&resource) {
            for &holder in holders {
                if holder != tx && self.bfs_visited.insert(holder) {
                    self.bfs_queue.push_back(holder);
                }
            }
        }

        while let Some(current) = self.bfs_queue.pop_front() {
            let Some(blocked_on) = self.waiting_on.get(&current) else {
                continue;
            };
            for next_resource in blocked_on {
                let Some(holders) = self.holders.get(next_resource) else {
                    continue;
                };
                for &holder in holders {
                    if holder == current {
                        continue;
                    }
                    if holder == tx {
                        self.bfs_parent.insert(tx, current);
                        return Some(self.reconstruct_cycle(tx));
                    }
                    if self.bfs_visited.insert(holder) {
                        self.bfs_parent.insert(holder, current);
                        self.bfs_queue.push_back(holder);
                    }
                }
            }
        }

        None
    }

    fn reconstruct_cycle(&self, tx: TxId) -> Vec<TxId> {
        let mut path = Vec::with_capacity(self.bfs_parent.len() + 1);
        let mut curr = tx;
        while let Some(&p) = self.bfs_parent.get(&curr) {
            path.push(p);
            curr = p;
        }
        path.push(tx);
        path.reverse();
        path
    }

    /// The lock each cycle member is (about to be) blocked on
    ///
    /// For every member after the first this is the lock whose holders include
    /// the next member of the cycle.
    fn waits_in_cycle(&self, resource: LockResource, cycle: &[TxId]) -> Vec<(TxId, LockResource)> {
        let mut waits = Vec::with_capacity(cycle.len());
        waits.push((cycle[0], resource));
        for (i, &member) in cycle.iter().enumerate().skip(1) {
            let next = cycle[(i + 1) % cycle.len()];
            let blocked_on = self.waiting_on.get(&member).and_then(|resources| {
                resources
                    .iter()
                    .find(|r| self.holders.get(r).is_some_and(|h| h.contains(&next)))
                    .copied()
            });
            if let Some(r) = blocked_on {
                waits.push((member, r));
            }
        }
        waits
    }

    /// Transactions currently blocked on `resource`, in arrival order
    pub fn waiters_of(&self, resource: &LockResource) -> &[TxId] {
        self.waited_on_by
            .get(resource)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Deadlock detector shared by all locks of one lock manager
///
/// Every `RWLock` calls [`RagManager::check_wait_on`] with its own monitor held,
/// right before blocking, so registering the wait and actually blocking are
/// atomic with respect to releases on that lock. The graph sits behind its own
/// mutex, which is only ever taken inside a lock monitor, never the other way
/// round.
pub struct RagManager {
    graph: Mutex<ResourceAllocationGraph>,
    verbose: bool,
}

impl Default for RagManager {
    fn default() -> Self {
        Self::new(false)
    }
}

impl RagManager {
    /// # Arguments
    /// * `verbose` - Spell out the whole cycle in deadlock messages
    pub fn new(verbose: bool) -> Self {
        RagManager {
            graph: Mutex::new(ResourceAllocationGraph::new()),
            verbose,
        }
    }

    pub fn lock_acquired(&self, resource: LockResource, tx: &LockTransaction) {
        self.graph.lock().add_holder(resource, tx.id());
    }

    pub fn lock_released(&self, resource: LockResource, tx: &LockTransaction) {
        self.graph.lock().remove_holder(resource, tx.id());
    }

    /// Register `tx` as waiting on `resource` unless that closes a cycle
    ///
    /// # Errors
    /// `LockError::DeadlockDetected` if the wait would close a cycle. The wait
    /// edge is not registered in that case.
    pub fn check_wait_on(
        &self,
        resource: LockResource,
        tx: &LockTransaction,
        lock_type: LockType,
    ) -> LockResult<()> {
        let mut graph = self.graph.lock();
        if let Some(cycle) = graph.find_cycle(resource, tx.id()) {
            let waiting_for = graph.waits_in_cycle(resource, &cycle);
            let info = DeadlockInfo {
                transaction_cycle: cycle,
                waiting_for,
                requested: lock_type,
                timestamp: Utc::now().to_rfc3339(),
            };
            let message = if self.verbose {
                describe_cycle(tx, lock_type, resource, &info)
            } else {
                format!(
                    "{tx} can't acquire {lock_type} lock on {resource} because holders of that lock are waiting for {tx}"
                )
            };
            return Err(LockError::DeadlockDetected {
                message,
                info: Box::new(info),
            });
        }
        graph.add_wait(resource, tx.id());
        Ok(())
    }

    /// Remove the wait edge registered by a successful `check_wait_on`
    pub fn stop_wait_on(&self, resource: LockResource, tx: &LockTransaction) {
        self.graph.lock().remove_wait(resource, tx.id());
    }

    /// First lock `tx` is blocked on, if any
    pub fn waiting_on(&self, tx: TxId) -> Option<LockResource> {
        self.graph
            .lock()
            .waiting_on
            .get(&tx)
            .and_then(|resources| resources.first().copied())
    }

    /// Number of blocked requests across all locks
    pub fn waiter_count(&self) -> usize {
        self.graph.lock().waiting_on.values().map(Vec::len).sum()
    }

    /// Transactions blocked on `resource`, in arrival order
    pub fn waiters_of(&self, resource: &LockResource) -> Vec<TxId> {
        self.graph.lock().waiters_of(resource).to_vec()
    }

    /// Transactions holding `resource`, in acquisition order
    pub fn holders_of(&self, resource: &LockResource) -> Vec<TxId> {
        self.graph
            .lock()
            .holders
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }
}

fn describe_cycle(
    tx: &LockTransaction,
    lock_type: LockType,
    resource: LockResource,
    info: &DeadlockInfo,
) -> String {
    let mut message = format!(
        "{tx} can't acquire {lock_type} lock on {resource} because it would close a wait cycle:\n "
    );
    let cycle = &info.transaction_cycle;
    for (i, (member, blocked_on)) in info.waiting_for.iter().enumerate() {
        let holder = cycle[(i + 1) % cycle.len()];
        if i == 0 {
            let _ = write!(message, "tx {member} -[{lock_type}]-> {blocked_on}");
        } else {
            let _ = write!(message, " -[waits]-> {blocked_on}");
        }
        let _ = write!(message, " -[held by]-> tx {holder}");
    }
    message
}
