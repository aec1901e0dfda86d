use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle states of a task.
///
/// PENDING and RUNNING are live; the other three are terminal and sticky.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        // Pending ──> Running ──> Completed
        //   │            ├─────> Failed
        //   ├─────────> Failed   │
        //   └─────────> Cancelled <──┘ (Running)
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A queued compute job and everything known about it.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Task {
    /// Monotonically increasing, never reused within a queue lifetime.
    pub id: u64,
    pub script_path: PathBuf,
    pub workdir: PathBuf,

    /// Requested core/device counts.
    pub ncpu: u32,
    pub ngpu: u32,
    /// Explicitly requested ids; empty means auto-select.
    #[serde(default)]
    pub requested_cpus: Vec<u32>,
    #[serde(default)]
    pub requested_gpus: Vec<u32>,

    /// Job-local log file name, relative to `workdir`. Empty means the
    /// executor's configured default applies.
    #[serde(default)]
    pub log_file: String,

    /// Populated when the task reaches RUNNING.
    #[serde(default)]
    pub allocated_cpus: Vec<u32>,
    #[serde(default)]
    pub allocated_gpus: Vec<u32>,

    pub status: TaskStatus,
    /// OS process id of the group leader; 0 while not running.
    #[serde(default)]
    pub pid: u32,
    /// Meaningful once terminal.
    #[serde(default)]
    pub exit_code: i32,

    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seconds from start to end, or to now for a still-running task.
    pub fn duration_seconds(&self) -> i64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_seconds(),
            (Some(start), None) => (Utc::now() - start).num_seconds(),
            _ => 0,
        }
    }

    pub(crate) fn transition_to(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::error!(
                "task {} refused transition: {} -> {}",
                self.id,
                self.status,
                next
            );
            return false;
        }
        match next {
            TaskStatus::Running => self.start_time = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.end_time = Some(Utc::now())
            }
            TaskStatus::Pending => {}
        }
        self.status = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_task() -> Task {
        Task {
            id: 1,
            script_path: PathBuf::from("/tmp/job.sh"),
            workdir: PathBuf::from("/tmp"),
            ncpu: 1,
            ngpu: 0,
            requested_cpus: vec![],
            requested_gpus: vec![],
            log_file: String::new(),
            allocated_cpus: vec![],
            allocated_gpus: vec![],
            status: TaskStatus::Pending,
            pid: 0,
            exit_code: 0,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
        }
    }

    #[test]
    fn allowed_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn terminal_states_are_sticky() {
        use TaskStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} must not reach {next}"
                );
            }
        }
    }

    #[test]
    fn pending_cannot_complete_directly() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn transition_stamps_timestamps() {
        let mut task = pending_task();
        assert!(task.transition_to(TaskStatus::Running));
        assert!(task.start_time.is_some());
        assert!(task.end_time.is_none());

        assert!(task.transition_to(TaskStatus::Completed));
        assert!(task.end_time.is_some());

        // Sticky: nothing moves a completed task.
        assert!(!task.transition_to(TaskStatus::Running));
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let back: TaskStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(back, TaskStatus::Cancelled);
    }
}
