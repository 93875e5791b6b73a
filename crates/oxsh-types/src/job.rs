//! Job identification and status types.

use std::time::SystemTime;

/// Unique identifier for a job. Numbers are the lowest free positive
/// integer at creation time, so a fresh shell hands out `1`, `2`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Job is currently running.
    Running,
    /// Job was stopped by a signal (e.g., Ctrl-Z / SIGTSTP).
    Stopped,
    /// Job completed with exit code 0.
    Done,
    /// Job completed with a non-zero exit code or was killed by a signal.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of one job for listing.
#[derive(Debug, Clone)]
pub struct JobInfo {
    /// Job ID.
    pub id: JobId,
    /// Command description, e.g. `"sleep 100 | cat"`.
    pub command: String,
    /// Current status.
    pub status: JobStatus,
    /// OS process IDs of the stages. Callable-proxy stages have no pid and
    /// contribute `None`.
    pub pids: Vec<Option<u32>>,
    /// Process group the pipeline runs in, when it owns one.
    pub pgid: Option<i32>,
    /// Whether the job was started with a trailing `&`.
    pub background: bool,
    /// When the job was added to the table.
    pub started: SystemTime,
}

/// How a process died or stopped, when a signal was involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    /// Signal number (e.g. 11 for SIGSEGV).
    pub number: i32,
    /// Whether the kernel reported a core dump.
    pub core_dumped: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_displays_bare_number() {
        assert_eq!(JobId(3).to_string(), "3");
    }

    #[test]
    fn status_displays_lowercase() {
        assert_eq!(JobStatus::Stopped.to_string(), "stopped");
        assert_eq!(JobStatus::Running.to_string(), "running");
    }
}
