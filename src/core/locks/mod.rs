pub mod rwlock;

pub use rwlock::{HolderCounts, LockSnapshot, RWLock};
