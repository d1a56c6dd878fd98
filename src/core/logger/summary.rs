//! Contention summary of an event log

use crate::core::logger::LogEntry;
use crate::core::tracer::LockEvent;
use crate::core::types::{LockResource, TxId};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Wait statistics of one resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSummary {
    /// Waits that started
    pub waits: u64,
    /// Waits that ended with the lock granted
    pub granted: u64,
    /// Waits that ended because the transaction was terminated
    pub terminated: u64,
    pub total_wait_nanos: u64,
    pub max_wait_nanos: u64,
    /// Requests on this resource rejected as deadlocks
    pub deadlocks: u64,
}

/// Aggregate of a whole event log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSummary {
    pub entries: usize,
    pub locks_created: u64,
    pub locks_evicted: u64,
    pub resources: BTreeMap<LockResource, ResourceSummary>,
    /// Transaction cycles of every reported deadlock, in log order
    pub deadlock_cycles: Vec<Vec<TxId>>,
}

impl LogSummary {
    pub fn add(&mut self, entry: &LogEntry) {
        self.entries += 1;
        let event = &entry.event;
        match event.event {
            LockEvent::LockCreated => self.locks_created += 1,
            LockEvent::LockEvicted => self.locks_evicted += 1,
            LockEvent::WaitStarted => self.resource(event.resource).waits += 1,
            LockEvent::WaitGranted | LockEvent::WaitTerminated => {
                let waited = event.waited_nanos.unwrap_or(0);
                let summary = self.resource(event.resource);
                if event.event == LockEvent::WaitGranted {
                    summary.granted += 1;
                } else {
                    summary.terminated += 1;
                }
                summary.total_wait_nanos = summary.total_wait_nanos.saturating_add(waited);
                summary.max_wait_nanos = summary.max_wait_nanos.max(waited);
            }
            LockEvent::Deadlock => {
                self.resource(event.resource).deadlocks += 1;
                self.deadlock_cycles
                    .push(event.cycle.clone().unwrap_or_default());
            }
        }
    }

    fn resource(&mut self, resource: LockResource) -> &mut ResourceSummary {
        self.resources.entry(resource).or_default()
    }

    pub fn total_waits(&self) -> u64 {
        self.resources.values().map(|r| r.waits).sum()
    }
}

/// Summarize JSON-lines log entries read from `reader`; blank lines are skipped
///
/// # Errors
/// Returns an error naming the line if reading or parsing fails
pub fn summarize<R: BufRead>(reader: R) -> Result<LogSummary> {
    let mut summary = LogSummary::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LogEntry = serde_json::from_str(&line)
            .with_context(|| format!("Invalid log entry on line {}", index + 1))?;
        summary.add(&entry);
    }
    Ok(summary)
}

/// # Errors
/// Returns an error if the file cannot be opened or is not a valid event log
pub fn summarize_file<P: AsRef<Path>>(path: P) -> Result<LogSummary> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Failed to open log file {}", path.display()))?;
    summarize(BufReader::new(file))
}

fn millis(nanos: u64) -> f64 {
    nanos as f64 / 1_000_000.0
}

impl fmt::Display for LogSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} events, {} locks created, {} evicted, {} waits, {} deadlocks",
            self.entries,
            self.locks_created,
            self.locks_evicted,
            self.total_waits(),
            self.deadlock_cycles.len()
        )?;
        if self.resources.is_empty() {
            return Ok(());
        }
        writeln!(
            f,
            "{:<28} {:>7} {:>7} {:>10} {:>12} {:>12} {:>9}",
            "resource", "waits", "granted", "terminated", "total ms", "max ms", "deadlocks"
        )?;
        for (resource, r) in &self.resources {
            writeln!(
                f,
                "{:<28} {:>7} {:>7} {:>10} {:>12.3} {:>12.3} {:>9}",
                resource.to_string(),
                r.waits,
                r.granted,
                r.terminated,
                millis(r.total_wait_nanos),
                millis(r.max_wait_nanos),
                r.deadlocks
            )?;
        }
        for cycle in &self.deadlock_cycles {
            let txs: Vec<String> = cycle.iter().map(|tx| format!("tx {tx}")).collect();
            writeln!(f, "deadlock: {}", txs.join(" -> "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logger::EventLogTracer;
    use crate::core::tracer::{LockTracer, LockWait, WaitOutcome};
    use crate::core::types::{DeadlockInfo, LockType};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn wait(tx: TxId, id: i64) -> LockWait {
        LockWait {
            transaction_id: tx,
            resource: LockResource::node(id),
            lock_type: LockType::Read,
            started_at_nanos: 0,
        }
    }

    #[test]
    fn test_summarize_written_log() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("summary.log");
        let tracer = EventLogTracer::with_file(&log_path).unwrap();

        tracer.lock_created(&LockResource::node(1));
        tracer.wait_started(&wait(1, 1));
        tracer.wait_finished(&wait(1, 1), WaitOutcome::Granted, 2_000_000);
        tracer.wait_started(&wait(2, 1));
        tracer.wait_finished(&wait(2, 1), WaitOutcome::Terminated, 5_000_000);
        tracer.deadlock_detected(&DeadlockInfo {
            transaction_cycle: vec![3, 4],
            waiting_for: vec![(3, LockResource::node(2)), (4, LockResource::node(1))],
            requested: LockType::Write,
            timestamp: String::new(),
        });
        tracer.lock_evicted(&LockResource::node(1));
        tracer.flush().unwrap();

        let summary = summarize_file(&log_path).unwrap();
        assert_eq!(summary.entries, 7);
        assert_eq!(summary.locks_created, 1);
        assert_eq!(summary.locks_evicted, 1);
        assert_eq!(summary.total_waits(), 2);
        assert_eq!(summary.deadlock_cycles, vec![vec![3, 4]]);

        let node1 = &summary.resources[&LockResource::node(1)];
        assert_eq!(node1.granted, 1);
        assert_eq!(node1.terminated, 1);
        assert_eq!(node1.total_wait_nanos, 7_000_000);
        assert_eq!(node1.max_wait_nanos, 5_000_000);
        assert_eq!(summary.resources[&LockResource::node(2)].deadlocks, 1);

        let rendered = summary.to_string();
        assert!(rendered.contains("NODE(1)"));
        assert!(rendered.contains("deadlock: tx 3 -> tx 4"));
    }

    #[test]
    fn test_invalid_line_is_reported() {
        let input = "\n{\"event\":\"LockCreated\",\"resource\":{\"resource_type\":\"NODE\",\"id\":1},\"timestamp\":1.0}\nnot json\n";
        let err = summarize(Cursor::new(input)).unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(summarize_file(temp_dir.path().join("absent.log")).is_err());
    }
}
