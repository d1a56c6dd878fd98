//! # graphlock
//!
//! Transaction-scoped read/write locks over graph-database resources with
//! deadlock detection at wait time.
//!
//! A [`LockManager`] hands out one [`RWLock`] per [`LockResource`] and drops it
//! again once it is idle. Locks belong to transactions, not threads: they are
//! reentrant, a sole reader may upgrade to a writer, and a writer may also read.
//! Before any request blocks, the shared wait-for graph is checked; a request
//! whose wait would close a cycle fails with [`LockError::DeadlockDetected`]
//! instead of hanging.
//!
//! ## Features
//!
//! - Writer priority over newly arriving readers, FIFO among writers
//! - Cooperative termination of blocked requests
//! - Lock event tracing with an injectable clock
//! - JSON-lines event log and contention summary (`event-log` feature)
//!
//! ```
//! use graphlock::{LockManager, LockResource, LockTransaction, NOOP_TRACER};
//!
//! let manager = LockManager::new();
//! let tx = LockTransaction::new();
//! assert!(manager.acquire_write_lock(&NOOP_TRACER, LockResource::node(1), &tx).unwrap());
//! manager.release_write_lock(LockResource::node(1), &tx).unwrap();
//! assert_eq!(manager.lock_count(), 0);
//! ```

mod core;

pub use core::{
    LockError, LockManager, LockManagerConfig, LockResult,
    graph::{RagManager, ResourceAllocationGraph},
    locks::{HolderCounts, LockSnapshot, RWLock},
    tracer::{
        Clock, CollectingLockTracer, FakeClock, FanoutLockTracer, LockEvent, LockTracer, LockWait,
        NOOP_TRACER, NoopLockTracer, SystemClock, TracedEvent, WaitOutcome,
    },
    types::{
        ActiveLock, DeadlockInfo, LockResource, LockTransaction, LockType, ResourceType, TxId,
    },
};

#[cfg(feature = "event-log")]
pub use core::logger;
