//! Event log for lock contention
//!
//! [`EventLogTracer`] records every traced lock event as a JSON line through an
//! asynchronous [`EventLogger`]; [`summary`] turns such a file back into
//! per-resource wait statistics.

mod event_logger;
pub mod summary;

pub use event_logger::{EventLogTracer, EventLogger, LogEntry};
pub use summary::{LogSummary, ResourceSummary, summarize_file};
