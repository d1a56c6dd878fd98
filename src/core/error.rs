//! Error types for lock operations

use crate::core::types::{DeadlockInfo, LockResource, LockType, TxId};
use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors surfaced by the lock manager.
///
/// Cooperative termination is not an error: blocking acquires report it as
/// `Ok(false)`.
#[derive(Debug, Error)]
pub enum LockError {
    /// The requested wait would close a cycle in the wait-for graph.
    ///
    /// The wait was never registered. Retrying the same request will most
    /// likely hit the same cycle; the caller has to release what it holds and
    /// abort its transaction.
    #[error("{message}")]
    DeadlockDetected {
        message: String,
        info: Box<DeadlockInfo>,
    },

    /// A release for a lock the transaction does not hold.
    #[error("transaction {transaction} holds no {lock_type} lock on {resource}")]
    LockNotFound {
        resource: LockResource,
        transaction: TxId,
        lock_type: LockType,
    },
}

impl LockError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, LockError::DeadlockDetected { .. })
    }

    /// The deadlock report, if this is a `DeadlockDetected` error
    pub fn deadlock_info(&self) -> Option<&DeadlockInfo> {
        match self {
            LockError::DeadlockDetected { info, .. } => Some(info),
            LockError::LockNotFound { .. } => None,
        }
    }
}
