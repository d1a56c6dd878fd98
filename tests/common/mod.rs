use graphlock::{
    CollectingLockTracer, DeadlockInfo, LockManager, LockManagerConfig, LockResource, LockResult,
    LockTracer, LockTransaction, LockType, NOOP_TRACER,
};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[allow(dead_code)]
pub const DEADLOCK_TIMEOUT: Duration = Duration::from_secs(3);
#[allow(dead_code)]
pub const NO_DEADLOCK_TIMEOUT: Duration = Duration::from_millis(500);
#[allow(dead_code)]
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards deadlock reports into a channel
struct DeadlockChannel(mpsc::Sender<DeadlockInfo>);

impl LockTracer for DeadlockChannel {
    fn deadlock_detected(&self, info: &DeadlockInfo) {
        let _ = self.0.send(info.clone());
    }
}

pub struct LockHarness {
    pub manager: Arc<LockManager>,
    pub tracer: Arc<CollectingLockTracer>,
    pub rx: mpsc::Receiver<DeadlockInfo>,
}

pub fn start_manager() -> LockHarness {
    let (tx, rx) = mpsc::channel::<DeadlockInfo>();
    let tracer = Arc::new(CollectingLockTracer::new());

    let manager = LockManagerConfig::new()
        .verbose_deadlocks(true)
        .tracer(tracer.clone())
        .tracer(Arc::new(DeadlockChannel(tx)))
        .build()
        .expect("Failed to build lock manager");

    LockHarness {
        manager: Arc::new(manager),
        tracer,
        rx,
    }
}

#[allow(dead_code)]
pub fn expect_deadlock(h: &LockHarness, timeout: Duration) -> DeadlockInfo {
    match h.rx.recv_timeout(timeout) {
        Ok(info) => info,
        Err(_) => panic!("No deadlock detected within {timeout:?}"),
    }
}

#[allow(dead_code)]
pub fn assert_no_deadlock(h: &LockHarness, timeout: Duration) {
    assert!(
        h.rx.recv_timeout(timeout).is_err(),
        "Unexpected deadlock detected"
    );
}

/// Run one acquire call on its own thread
#[allow(dead_code)]
pub fn spawn_acquire(
    manager: &Arc<LockManager>,
    tx: &LockTransaction,
    resource: LockResource,
    lock_type: LockType,
) -> JoinHandle<LockResult<bool>> {
    let manager = Arc::clone(manager);
    let tx = tx.clone();
    thread::spawn(move || match lock_type {
        LockType::Read => manager.acquire_read_lock(&NOOP_TRACER, resource, &tx),
        LockType::Write => manager.acquire_write_lock(&NOOP_TRACER, resource, &tx),
    })
}

/// Poll until `resource` has exactly `expected` queued requests
#[allow(dead_code)]
pub fn await_waiting(manager: &LockManager, resource: LockResource, expected: usize) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let waiting = manager
            .lock_snapshot(resource)
            .map_or(0, |s| s.waiting.len());
        if waiting == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{resource} has {waiting} waiting requests, expected {expected}"
        );
        thread::sleep(Duration::from_millis(1));
    }
}

/// Poll until the wait-for graph holds exactly `expected` blocked requests
#[allow(dead_code)]
pub fn await_graph_waiters(manager: &LockManager, expected: usize) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let waiting = manager.rag().waiter_count();
        if waiting == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{waiting} requests blocked, expected {expected}"
        );
        thread::sleep(Duration::from_millis(1));
    }
}

/// Read and write counts of `resource`, zero if it has no lock
#[allow(dead_code)]
pub fn counts(manager: &LockManager, resource: LockResource) -> (u32, u32) {
    manager
        .lock_snapshot(resource)
        .map_or((0, 0), |s| (s.read_count, s.write_count))
}
