//! Asynchronous JSON-lines event log
//!
//! Lock events are handed to a background writer thread over a channel so the
//! threads reporting them (which hold a lock monitor at that point) never touch
//! the file themselves. Each line is one [`LogEntry`].

use crate::core::tracer::{LockTracer, LockWait, TracedEvent, WaitOutcome};
use crate::core::types::{DeadlockInfo, LockResource};
use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// One line of the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(flatten)]
    pub event: TracedEvent,
    /// Wall clock time of the event (seconds since Unix Epoch)
    pub timestamp: f64,
}

/// Commands for controlling the async logger thread
#[derive(Debug)]
enum LoggerCommand {
    /// Write a log entry to the file
    LogEntry(LogEntry),
    /// Flush all pending entries to disk and signal completion
    Flush(Sender<()>),
}

/// Writes [`LogEntry`] lines to a file from a background thread
pub struct EventLogger {
    sender: Sender<LoggerCommand>,
    path: PathBuf,
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            eprintln!("Warning: Failed to flush lock event log during drop: {e:?}");
        }
    }
}

impl EventLogger {
    /// Create a logger writing to `path`
    ///
    /// A `{timestamp}` placeholder in the path is replaced with the current
    /// UTC time; missing parent directories are created and an existing file
    /// is truncated.
    ///
    /// # Errors
    /// Returns an error if the directory or the file cannot be created
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file_path = expand_timestamp(path.as_ref());

        if let Some(parent) = file_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&file_path)
            .with_context(|| format!("Failed to open log file {}", file_path.display()))?;

        let (sender, receiver) = unbounded::<LoggerCommand>();
        thread::Builder::new()
            .name("lock-event-log".into())
            .spawn(move || async_logger_thread(file, receiver))
            .context("Failed to spawn log writer thread")?;

        Ok(EventLogger {
            sender,
            path: file_path,
        })
    }

    /// Path of the file being written, after placeholder expansion
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `event` for writing, stamped with the current time
    pub fn log_event(&self, event: TracedEvent) {
        let now = Utc::now();
        let timestamp = now.timestamp() as f64 + now.timestamp_subsec_micros() as f64 / 1_000_000.0;

        if let Err(e) = self
            .sender
            .send(LoggerCommand::LogEntry(LogEntry { event, timestamp }))
        {
            eprintln!("Failed to send lock event: {e:?}");
        }
    }

    /// Block until every queued entry has reached the file
    ///
    /// # Errors
    /// Returns an error if the writer thread is gone or does not answer in time
    pub fn flush(&self) -> Result<()> {
        // Each caller gets its own marker; the channel is FIFO, so the reply
        // also covers every entry queued before it by any thread
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.sender
            .send(LoggerCommand::Flush(done_tx))
            .context("Log writer thread is gone")?;
        done_rx
            .recv_timeout(FLUSH_TIMEOUT)
            .context("Flush operation timed out")
    }
}

#[allow(clippy::literal_string_with_formatting_args)]
fn expand_timestamp(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw.contains("{timestamp}") {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(raw.replace("{timestamp}", &timestamp))
    } else {
        path.to_path_buf()
    }
}

fn async_logger_thread(file: File, receiver: Receiver<LoggerCommand>) {
    let mut writer = BufWriter::new(file);

    // Runs until every sender is dropped
    while let Ok(cmd) = receiver.recv() {
        match cmd {
            LoggerCommand::LogEntry(entry) => match serde_json::to_string(&entry) {
                Ok(json) => {
                    if let Err(e) = writeln!(writer, "{json}") {
                        eprintln!("Lock event log write error: {e:?}");
                    }
                }
                Err(e) => eprintln!("Lock event serialization error: {e:?}"),
            },
            LoggerCommand::Flush(done) => {
                if let Err(e) = writer.flush() {
                    eprintln!("Lock event log flush error: {e:?}");
                }
                let _ = done.send(());
            }
        }
    }

    if let Err(e) = writer.flush() {
        eprintln!("Lock event log final flush error: {e:?}");
    }
}

/// [`LockTracer`] that appends every event to an [`EventLogger`]
pub struct EventLogTracer {
    logger: EventLogger,
}

impl EventLogTracer {
    /// # Errors
    /// Same as [`EventLogger::with_file`]
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(EventLogTracer {
            logger: EventLogger::with_file(path)?,
        })
    }

    /// # Errors
    /// Same as [`EventLogger::flush`]
    pub fn flush(&self) -> Result<()> {
        self.logger.flush()
    }
}

impl LockTracer for EventLogTracer {
    fn wait_started(&self, wait: &LockWait) {
        self.logger.log_event(TracedEvent::wait_started(wait));
    }

    fn wait_finished(&self, wait: &LockWait, outcome: WaitOutcome, waited_nanos: u64) {
        self.logger
            .log_event(TracedEvent::wait_finished(wait, outcome, waited_nanos));
    }

    fn deadlock_detected(&self, info: &DeadlockInfo) {
        if let Some(event) = TracedEvent::deadlock(info) {
            self.logger.log_event(event);
        }
    }

    fn lock_created(&self, resource: &LockResource) {
        self.logger.log_event(TracedEvent::created(*resource));
    }

    fn lock_evicted(&self, resource: &LockResource) {
        self.logger.log_event(TracedEvent::evicted(*resource));
    }
}
