//! Human-readable trace of a job invocation.
//!
//! Every step of a job records a line here. The same lines go to `tracing` as
//! they are recorded, and the accumulated log is rendered into the operator
//! notification at the end of a run.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::id::RunId;

/// One recorded line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl core::fmt::Display for RunLogEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}] {}", self.at.format("%Y-%m-%d %H:%M:%S"), self.message)
    }
}

/// Ordered trace of a single run.
#[derive(Debug, Clone, Serialize)]
pub struct RunLog {
    run_id: RunId,
    job: &'static str,
    entries: Vec<RunLogEntry>,
}

impl RunLog {
    pub fn new(job: &'static str, run_id: RunId) -> Self {
        Self {
            run_id,
            job,
            entries: Vec::new(),
        }
    }

    /// Append a line and mirror it to the process log.
    pub fn record(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(job = self.job, run_id = %self.run_id, "{message}");
        self.entries.push(RunLogEntry {
            at: Utc::now(),
            message,
        });
    }

    /// Append a line that also signals a problem in the process log.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(job = self.job, run_id = %self.run_id, "{message}");
        self.entries.push(RunLogEntry {
            at: Utc::now(),
            message,
        });
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn entries(&self) -> &[RunLogEntry] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.message.as_str())
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().any(|m| m.contains(needle))
    }

    /// Render every line, timestamped, joined by `separator`.
    pub fn digest(&self, separator: &str) -> String {
        self.entries
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(separator)
    }
}
