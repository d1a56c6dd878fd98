use graphlock::{LockError, LockResource, LockTransaction, LockType, NOOP_TRACER};
use std::thread;
use std::time::Duration;

mod common;
use common::{
    NO_DEADLOCK_TIMEOUT, assert_no_deadlock, await_waiting, counts, spawn_acquire, start_manager,
};

#[test]
fn test_two_readers_share_a_resource() {
    let harness = start_manager();
    let manager = &harness.manager;
    let r = LockResource::node(1);
    let (t1, t2) = (LockTransaction::new(), LockTransaction::new());

    assert!(manager.acquire_read_lock(&NOOP_TRACER, r, &t1).unwrap());
    assert!(manager.acquire_read_lock(&NOOP_TRACER, r, &t2).unwrap());
    assert_eq!(counts(manager, r), (2, 0));

    manager.release_read_lock(r, &t1).unwrap();
    manager.release_read_lock(r, &t2).unwrap();
    assert_eq!(manager.lock_count(), 0);
}

#[test]
fn test_reader_waits_for_writer() {
    let harness = start_manager();
    let manager = &harness.manager;
    let r = LockResource::node(1);
    let (t1, t2) = (LockTransaction::new(), LockTransaction::new());

    assert!(manager.acquire_write_lock(&NOOP_TRACER, r, &t1).unwrap());
    let reader = spawn_acquire(manager, &t2, r, LockType::Read);
    await_waiting(manager, r, 1);

    manager.release_write_lock(r, &t1).unwrap();
    assert!(reader.join().unwrap().unwrap());
    assert_eq!(counts(manager, r), (1, 0));
    assert!(manager.holds_lock(&t2, r, LockType::Read));

    manager.release_read_lock(r, &t2).unwrap();
    assert_eq!(manager.lock_count(), 0);
    assert_no_deadlock(&harness, NO_DEADLOCK_TIMEOUT);
}

#[test]
fn test_queued_writer_goes_before_later_reader() {
    let harness = start_manager();
    let manager = &harness.manager;
    let r = LockResource::node(1);
    let (t1, t2, t3) = (
        LockTransaction::new(),
        LockTransaction::new(),
        LockTransaction::new(),
    );

    assert!(manager.acquire_write_lock(&NOOP_TRACER, r, &t1).unwrap());
    let writer = spawn_acquire(manager, &t2, r, LockType::Write);
    await_waiting(manager, r, 1);
    let reader = spawn_acquire(manager, &t3, r, LockType::Read);
    await_waiting(manager, r, 2);

    manager.release_write_lock(r, &t1).unwrap();
    assert!(writer.join().unwrap().unwrap());

    // The reader is still queued while the writer holds the lock
    await_waiting(manager, r, 1);
    assert_eq!(counts(manager, r), (0, 1));
    assert!(!manager.holds_lock(&t3, r, LockType::Read));

    manager.release_write_lock(r, &t2).unwrap();
    assert!(reader.join().unwrap().unwrap());
    assert_eq!(counts(manager, r), (1, 0));
    manager.release_read_lock(r, &t3).unwrap();
    assert_eq!(manager.lock_count(), 0);
}

#[test]
fn test_queued_writers_are_granted_in_arrival_order() {
    let harness = start_manager();
    let manager = &harness.manager;
    let r = LockResource::node(2);
    let (t1, w1, w2) = (
        LockTransaction::new(),
        LockTransaction::new(),
        LockTransaction::new(),
    );

    assert!(manager.acquire_write_lock(&NOOP_TRACER, r, &t1).unwrap());
    let first = spawn_acquire(manager, &w1, r, LockType::Write);
    await_waiting(manager, r, 1);
    let second = spawn_acquire(manager, &w2, r, LockType::Write);
    await_waiting(manager, r, 2);

    manager.release_write_lock(r, &t1).unwrap();
    assert!(first.join().unwrap().unwrap());

    // The later writer is still queued behind the earlier one
    await_waiting(manager, r, 1);
    assert!(manager.holds_lock(&w1, r, LockType::Write));
    assert!(!manager.holds_lock(&w2, r, LockType::Write));
    assert_eq!(manager.waiting_on(w2.id()), Some(r));

    manager.release_write_lock(r, &w1).unwrap();
    assert!(second.join().unwrap().unwrap());
    assert!(manager.holds_lock(&w2, r, LockType::Write));
    manager.release_write_lock(r, &w2).unwrap();
    assert_eq!(manager.lock_count(), 0);
    assert_no_deadlock(&harness, NO_DEADLOCK_TIMEOUT);
}

#[test]
fn test_new_reader_does_not_overtake_queued_writer() {
    let harness = start_manager();
    let manager = &harness.manager;
    let r = LockResource::node(4);
    let (t1, t2, t3) = (
        LockTransaction::new(),
        LockTransaction::new(),
        LockTransaction::new(),
    );

    assert!(manager.acquire_read_lock(&NOOP_TRACER, r, &t1).unwrap());
    let writer = spawn_acquire(manager, &t2, r, LockType::Write);
    await_waiting(manager, r, 1);

    // Readers alone could share, but a writer is already queued
    assert!(!manager.try_read_lock(r, &t3));
    let reader = spawn_acquire(manager, &t3, r, LockType::Read);
    await_waiting(manager, r, 2);

    // The holder itself may still read again
    assert!(manager.acquire_read_lock(&NOOP_TRACER, r, &t1).unwrap());
    manager.release_read_lock(r, &t1).unwrap();
    manager.release_read_lock(r, &t1).unwrap();

    assert!(writer.join().unwrap().unwrap());
    manager.release_write_lock(r, &t2).unwrap();
    assert!(reader.join().unwrap().unwrap());
    manager.release_read_lock(r, &t3).unwrap();
    assert_eq!(manager.lock_count(), 0);
}

#[test]
fn test_reentrant_locks_do_not_leak() {
    let harness = start_manager();
    let manager = &harness.manager;
    let r = LockResource::relationship(3);
    let tx = LockTransaction::new();

    for _ in 0..3 {
        assert!(manager.acquire_read_lock(&NOOP_TRACER, r, &tx).unwrap());
        assert!(manager.acquire_write_lock(&NOOP_TRACER, r, &tx).unwrap());
    }
    assert_eq!(counts(manager, r), (3, 3));
    assert_eq!(manager.lock_snapshot(r).unwrap().holders.len(), 1);

    for _ in 0..3 {
        manager.release_write_lock(r, &tx).unwrap();
        manager.release_read_lock(r, &tx).unwrap();
    }
    assert!(manager.lock_snapshot(r).is_none());
    assert_eq!(manager.active_lock_count(&tx), 0);
}

#[test]
fn test_sole_reader_upgrades_without_deadlock() {
    let harness = start_manager();
    let manager = &harness.manager;
    let r = LockResource::node(8);
    let tx = LockTransaction::new();

    assert!(manager.acquire_read_lock(&NOOP_TRACER, r, &tx).unwrap());
    assert!(manager.acquire_write_lock(&NOOP_TRACER, r, &tx).unwrap());
    assert_eq!(counts(manager, r), (1, 1));
    assert_no_deadlock(&harness, NO_DEADLOCK_TIMEOUT);

    manager.release_read_lock(r, &tx).unwrap();
    manager.release_write_lock(r, &tx).unwrap();
    assert_eq!(manager.lock_count(), 0);
}

#[test]
fn test_upgrade_waits_for_other_reader() {
    let harness = start_manager();
    let manager = &harness.manager;
    let r = LockResource::node(8);
    let (t1, t2) = (LockTransaction::new(), LockTransaction::new());

    assert!(manager.acquire_read_lock(&NOOP_TRACER, r, &t1).unwrap());
    assert!(manager.acquire_read_lock(&NOOP_TRACER, r, &t2).unwrap());

    let upgrade = spawn_acquire(manager, &t1, r, LockType::Write);
    await_waiting(manager, r, 1);
    thread::sleep(Duration::from_millis(20));
    assert!(!upgrade.is_finished());

    manager.release_read_lock(r, &t2).unwrap();
    assert!(upgrade.join().unwrap().unwrap());
    assert_eq!(counts(manager, r), (1, 1));
}

#[test]
fn test_release_without_acquire() {
    let harness = start_manager();
    let manager = &harness.manager;
    let r = LockResource::node(5);
    let (t1, t2) = (LockTransaction::new(), LockTransaction::new());

    let err = manager.release_read_lock(r, &t1).unwrap_err();
    assert!(matches!(
        err,
        LockError::LockNotFound { lock_type: LockType::Read, .. }
    ));

    assert!(manager.acquire_read_lock(&NOOP_TRACER, r, &t1).unwrap());
    // Wrong transaction, then wrong lock type
    assert!(manager.release_read_lock(r, &t2).is_err());
    assert!(manager.release_write_lock(r, &t1).is_err());
    assert_eq!(counts(manager, r), (1, 0));

    manager.release_read_lock(r, &t1).unwrap();
    assert!(manager.release_read_lock(r, &t1).is_err());
    assert_eq!(manager.lock_count(), 0);
}

#[test]
fn test_writer_waits_for_every_reader() {
    let harness = start_manager();
    let manager = &harness.manager;
    let r = LockResource::new(graphlock::ResourceType::Label, 2);
    let readers: Vec<_> = (0..4).map(|_| LockTransaction::new()).collect();
    let writer_tx = LockTransaction::new();

    for tx in &readers {
        assert!(manager.acquire_read_lock(&NOOP_TRACER, r, tx).unwrap());
    }
    let writer = spawn_acquire(manager, &writer_tx, r, LockType::Write);
    await_waiting(manager, r, 1);

    for (i, tx) in readers.iter().enumerate() {
        assert!(!writer.is_finished(), "writer granted with {} readers left", readers.len() - i);
        manager.release_read_lock(r, tx).unwrap();
    }
    assert!(writer.join().unwrap().unwrap());
    assert_eq!(counts(manager, r), (0, 1));
    assert_no_deadlock(&harness, NO_DEADLOCK_TIMEOUT);
}
