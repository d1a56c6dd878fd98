//! Graph module for deadlock detection
//!
//! The resource allocation graph records which transaction holds which lock
//! and which transaction is blocked on which lock, and rejects any wait that
//! would close a cycle.

pub(crate) mod rag;

pub use rag::{RagManager, ResourceAllocationGraph};
