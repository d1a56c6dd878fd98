//! Observability seams of the lock core
//!
//! The lock core never logs by itself. Every interesting transition is reported
//! to a [`LockTracer`]: the start and end of a blocking wait, a detected
//! deadlock, and the registry creating or evicting a lock. Wait durations are
//! measured with an injected monotonic [`Clock`] so tests can control time.

use crate::core::types::{DeadlockInfo, LockResource, LockType, TxId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source used to timestamp trace events
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary, fixed origin. Never decreases.
    fn nanos(&self) -> u64;
}

/// `Clock` backed by `std::time::Instant`
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Manually driven `Clock` for tests
#[derive(Debug, Default)]
pub struct FakeClock {
    nanos: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// A blocking wait in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWait {
    pub transaction_id: TxId,
    pub resource: LockResource,
    pub lock_type: LockType,
    pub started_at_nanos: u64,
}

/// How a blocking wait ended (deadlocks never start a wait)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitOutcome {
    Granted,
    Terminated,
}

/// Sink for lock events
///
/// All methods default to doing nothing, so implementors only override what
/// they care about. Methods are called while the reporting lock's monitor is
/// held; implementations must be quick and must not call back into the lock
/// manager.
pub trait LockTracer: Send + Sync {
    /// A request could not be granted immediately and is about to block.
    fn wait_started(&self, _wait: &LockWait) {}

    /// A previously started wait ended.
    fn wait_finished(&self, _wait: &LockWait, _outcome: WaitOutcome, _waited_nanos: u64) {}

    /// A request was rejected because its wait would close a cycle.
    fn deadlock_detected(&self, _info: &DeadlockInfo) {}

    /// The registry created a lock for a resource.
    fn lock_created(&self, _resource: &LockResource) {}

    /// The registry dropped an idle lock.
    fn lock_evicted(&self, _resource: &LockResource) {}
}

/// Tracer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLockTracer;

impl LockTracer for NoopLockTracer {}

/// Shared no-op tracer, handy as the `tracer` argument of acquire calls
pub static NOOP_TRACER: NoopLockTracer = NoopLockTracer;

/// Forwards every event to each tracer in turn
///
/// Holds owned tracers (`Arc<dyn LockTracer>`, the default) or borrowed ones
/// (`&dyn LockTracer`) for a single call.
pub struct FanoutLockTracer<T = Arc<dyn LockTracer>> {
    tracers: Vec<T>,
}

impl<T> Default for FanoutLockTracer<T> {
    fn default() -> Self {
        FanoutLockTracer {
            tracers: Vec::new(),
        }
    }
}

impl<T> FanoutLockTracer<T> {
    pub fn new(tracers: Vec<T>) -> Self {
        FanoutLockTracer { tracers }
    }
}

impl<'a, T> LockTracer for FanoutLockTracer<T>
where
    T: Deref<Target = dyn LockTracer + 'a> + Send + Sync,
{
    fn wait_started(&self, wait: &LockWait) {
        self.tracers.iter().for_each(|t| t.wait_started(wait));
    }

    fn wait_finished(&self, wait: &LockWait, outcome: WaitOutcome, waited_nanos: u64) {
        self.tracers
            .iter()
            .for_each(|t| t.wait_finished(wait, outcome, waited_nanos));
    }

    fn deadlock_detected(&self, info: &DeadlockInfo) {
        self.tracers.iter().for_each(|t| t.deadlock_detected(info));
    }

    fn lock_created(&self, resource: &LockResource) {
        self.tracers.iter().for_each(|t| t.lock_created(resource));
    }

    fn lock_evicted(&self, resource: &LockResource) {
        self.tracers.iter().for_each(|t| t.lock_evicted(resource));
    }
}

/// Represents the type of lock event that occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockEvent {
    /// The registry created a lock
    LockCreated,
    /// The registry evicted an idle lock
    LockEvicted,
    /// A transaction started blocking on a lock
    WaitStarted,
    /// A blocked request was granted
    WaitGranted,
    /// A blocked request gave up because its transaction was terminated
    WaitTerminated,
    /// A request was rejected with a deadlock
    Deadlock,
}

/// Flat record of one traced event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracedEvent {
    pub event: LockEvent,
    pub resource: LockResource,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transaction_id: Option<TxId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lock_type: Option<LockType>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub waited_nanos: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cycle: Option<Vec<TxId>>,
}

impl TracedEvent {
    fn lock_event(event: LockEvent, resource: LockResource) -> Self {
        TracedEvent {
            event,
            resource,
            transaction_id: None,
            lock_type: None,
            waited_nanos: None,
            cycle: None,
        }
    }

    pub fn created(resource: LockResource) -> Self {
        Self::lock_event(LockEvent::LockCreated, resource)
    }

    pub fn evicted(resource: LockResource) -> Self {
        Self::lock_event(LockEvent::LockEvicted, resource)
    }

    pub fn wait_started(wait: &LockWait) -> Self {
        TracedEvent {
            transaction_id: Some(wait.transaction_id),
            lock_type: Some(wait.lock_type),
            ..Self::lock_event(LockEvent::WaitStarted, wait.resource)
        }
    }

    pub fn wait_finished(wait: &LockWait, outcome: WaitOutcome, waited_nanos: u64) -> Self {
        let event = match outcome {
            WaitOutcome::Granted => LockEvent::WaitGranted,
            WaitOutcome::Terminated => LockEvent::WaitTerminated,
        };
        TracedEvent {
            transaction_id: Some(wait.transaction_id),
            lock_type: Some(wait.lock_type),
            waited_nanos: Some(waited_nanos),
            ..Self::lock_event(event, wait.resource)
        }
    }

    /// `None` if the report carries no requested resource
    pub fn deadlock(info: &DeadlockInfo) -> Option<Self> {
        let &(requester, resource) = info.waiting_for.first()?;
        Some(TracedEvent {
            transaction_id: Some(requester),
            lock_type: Some(info.requested),
            cycle: Some(info.transaction_cycle.clone()),
            ..Self::lock_event(LockEvent::Deadlock, resource)
        })
    }
}

/// Tracer that keeps every event in memory, in arrival order
#[derive(Debug, Default)]
pub struct CollectingLockTracer {
    events: Mutex<Vec<TracedEvent>>,
}

impl CollectingLockTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TracedEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind, in arrival order
    pub fn events_of(&self, kind: LockEvent) -> Vec<TracedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event == kind)
            .cloned()
            .collect()
    }

    fn push(&self, event: TracedEvent) {
        self.events.lock().push(event);
    }
}

impl LockTracer for CollectingLockTracer {
    fn wait_started(&self, wait: &LockWait) {
        self.push(TracedEvent::wait_started(wait));
    }

    fn wait_finished(&self, wait: &LockWait, outcome: WaitOutcome, waited_nanos: u64) {
        self.push(TracedEvent::wait_finished(wait, outcome, waited_nanos));
    }

    fn deadlock_detected(&self, info: &DeadlockInfo) {
        if let Some(event) = TracedEvent::deadlock(info) {
            self.push(event);
        }
    }

    fn lock_created(&self, resource: &LockResource) {
        self.push(TracedEvent::created(*resource));
    }

    fn lock_evicted(&self, resource: &LockResource) {
        self.push(TracedEvent::evicted(*resource));
    }
}
