use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Transaction identifier type
///
/// Uniquely identifies a lock transaction for the lifetime of the process.
pub type TxId = u64;

// Global counter for assigning unique transaction IDs
static TX_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// The kind of entity a lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Node,
    Relationship,
    GraphProps,
    Schema,
    IndexEntry,
    Label,
    RelationshipType,
    PropertyKey,
}

impl ResourceType {
    pub fn name(self) -> &'static str {
        match self {
            ResourceType::Node => "NODE",
            ResourceType::Relationship => "RELATIONSHIP",
            ResourceType::GraphProps => "GRAPH_PROPS",
            ResourceType::Schema => "SCHEMA",
            ResourceType::IndexEntry => "INDEX_ENTRY",
            ResourceType::Label => "LABEL",
            ResourceType::RelationshipType => "RELATIONSHIP_TYPE",
            ResourceType::PropertyKey => "PROPERTY_KEY",
        }
    }
}

/// Identifies what is locked: a resource type tag plus a numeric id
///
/// Purely a lookup key. Two resources are the same lock iff both fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockResource {
    pub resource_type: ResourceType,
    pub id: i64,
}

impl LockResource {
    pub const fn new(resource_type: ResourceType, id: i64) -> Self {
        LockResource { resource_type, id }
    }

    pub const fn node(id: i64) -> Self {
        Self::new(ResourceType::Node, id)
    }

    pub const fn relationship(id: i64) -> Self {
        Self::new(ResourceType::Relationship, id)
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.resource_type.name(), self.id)
    }
}

/// Shared (read) or exclusive (write) lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Read,
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => f.write_str("READ"),
            LockType::Write => f.write_str("WRITE"),
        }
    }
}

struct TxInner {
    id: TxId,
    terminated: AtomicBool,
}

/// Identifies who is requesting a lock
///
/// A cheap, clonable handle: every clone refers to the same transaction, and
/// equality and hashing go by identity only. The only mutable state is the
/// `terminated` flag, which moves from `false` to `true` at most once and is
/// observed by blocked lock requests every time they wake up.
#[derive(Clone)]
pub struct LockTransaction {
    inner: Arc<TxInner>,
}

impl LockTransaction {
    /// Create a transaction with a fresh, process-unique id
    pub fn new() -> Self {
        LockTransaction {
            inner: Arc::new(TxInner {
                id: TX_ID_COUNTER.fetch_add(1, Ordering::SeqCst),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> TxId {
        self.inner.id
    }

    /// Request cooperative cancellation. Idempotent.
    pub fn mark_terminated(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }
}

impl Default for LockTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for LockTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for LockTransaction {}

impl Hash for LockTransaction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for LockTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTransaction")
            .field("id", &self.inner.id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl fmt::Display for LockTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx {}", self.inner.id)
    }
}

/// A lock currently held by a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveLock {
    pub resource: LockResource,
    pub lock_type: LockType,
    pub transaction_id: TxId,
}

/// Represents the result of a deadlock detection
///
/// Attached to every `LockError::DeadlockDetected`. It describes the cycle that
/// the rejected wait would have closed in the wait-for graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockInfo {
    /// Transactions in the cycle, starting with the one whose request was rejected.
    ///
    /// Each transaction waits for a lock held by the next one, and the last one
    /// waits for a lock held by the first.
    pub transaction_cycle: Vec<TxId>,

    /// For every transaction in the cycle, the resource it waits on (or wanted
    /// to wait on, for the first entry)
    pub waiting_for: Vec<(TxId, LockResource)>,

    /// The kind of lock the rejected request asked for
    pub requested: LockType,

    /// ISO-8601 formatted timestamp indicating when the deadlock was detected.
    pub timestamp: String,
}
