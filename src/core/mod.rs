// Core types
pub mod types;
pub use types::*;

pub mod error;
pub use error::{LockError, LockResult};

pub mod tracer;

// Wait-for graph
pub mod graph;

// Per-resource locks and their registry
pub mod locks;
pub mod manager;
pub use manager::LockManager;

// Event log
#[cfg(feature = "event-log")]
pub mod logger;

use std::sync::Arc;
use tracer::{Clock, FanoutLockTracer, LockTracer, NoopLockTracer, SystemClock};

/// Builder for a [`LockManager`]
pub struct LockManagerConfig {
    verbose_deadlocks: bool,
    tracers: Vec<Arc<dyn LockTracer>>,
    clock: Arc<dyn Clock>,
    #[cfg(feature = "event-log")]
    log_path: Option<std::path::PathBuf>,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManagerConfig {
    /// Create a config with default settings
    ///
    /// By default:
    /// - Deadlock messages are terse
    /// - No tracer and no event log
    /// - Wait durations use the system clock
    pub fn new() -> Self {
        LockManagerConfig {
            verbose_deadlocks: false,
            tracers: Vec::new(),
            clock: Arc::new(SystemClock::new()),
            #[cfg(feature = "event-log")]
            log_path: None,
        }
    }

    /// Describe the whole wait cycle in deadlock messages instead of one line
    pub fn verbose_deadlocks(mut self, verbose: bool) -> Self {
        self.verbose_deadlocks = verbose;
        self
    }

    /// Add a tracer receiving every lock event of the manager
    ///
    /// May be called more than once; each tracer receives every event.
    pub fn tracer(mut self, tracer: Arc<dyn LockTracer>) -> Self {
        self.tracers.push(tracer);
        self
    }

    /// Clock used to measure how long requests wait
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record lock events as JSON lines in `path`
    ///
    /// If the path contains "{timestamp}", it is replaced with the current
    /// timestamp when the manager is built.
    #[cfg(feature = "event-log")]
    pub fn with_log<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.log_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Build the lock manager
    ///
    /// # Errors
    /// Returns an error if the event log cannot be created
    pub fn build(self) -> anyhow::Result<LockManager> {
        let mut tracers = self.tracers;

        #[cfg(feature = "event-log")]
        let event_log = match self.log_path {
            Some(path) => {
                use anyhow::Context;
                let log = Arc::new(
                    logger::EventLogTracer::with_file(path)
                        .context("Failed to initialize lock event log")?,
                );
                tracers.push(log.clone());
                Some(log)
            }
            None => None,
        };

        let tracer: Arc<dyn LockTracer> = match tracers.len() {
            0 => Arc::new(NoopLockTracer),
            1 => tracers.remove(0),
            _ => Arc::new(FanoutLockTracer::new(tracers)),
        };

        #[allow(unused_mut)]
        let mut manager = LockManager::with_parts(self.verbose_deadlocks, tracer, self.clock);
        #[cfg(feature = "event-log")]
        if let Some(log) = event_log {
            manager.set_event_log(log);
        }
        Ok(manager)
    }
}
