use crate::core::task::{Task, TaskStatus};
use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Everything needed to create a queue row.
#[derive(Debug, Clone, Default)]
pub struct SubmitSpec {
    pub script_path: PathBuf,
    pub workdir: PathBuf,
    pub ncpu: u32,
    pub ngpu: u32,
    pub requested_cpus: Vec<u32>,
    pub requested_gpus: Vec<u32>,
    pub log_file: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    next_id: u64,
    tasks: Vec<Task>,
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: HashMap<u64, Task>,
    next_id: u64,
}

/// Authoritative catalog of tasks.
///
/// All operations serialize under the queue's own lock; callers only ever
/// see snapshots. Reservation bookkeeping lives in the resource monitor,
/// never here.
#[derive(Debug)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    /// Persistence target; `None` disables persistence (tests).
    data_file: Option<PathBuf>,
}

impl TaskQueue {
    pub fn new(data_file: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: HashMap::new(),
                next_id: 1,
            }),
            data_file,
        }
    }

    /// Insert a new PENDING row and return its id.
    pub fn submit(&self, spec: SubmitSpec) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;

        let task = Task {
            id,
            script_path: spec.script_path,
            workdir: spec.workdir,
            ncpu: spec.ncpu,
            ngpu: spec.ngpu,
            requested_cpus: spec.requested_cpus,
            requested_gpus: spec.requested_gpus,
            log_file: spec.log_file,
            allocated_cpus: Vec::new(),
            allocated_gpus: Vec::new(),
            status: TaskStatus::Pending,
            pid: 0,
            exit_code: 0,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
        };
        state.tasks.insert(id, task);
        id
    }

    /// Submit one task per workdir, sharing script and counts. Order of the
    /// returned ids follows the input order.
    pub fn submit_batch(
        &self,
        script: &PathBuf,
        workdirs: &[String],
        ncpu: u32,
        ngpu: u32,
    ) -> Vec<u64> {
        workdirs
            .iter()
            .map(|dir| {
                self.submit(SubmitSpec {
                    script_path: script.clone(),
                    workdir: PathBuf::from(dir),
                    ncpu,
                    ngpu,
                    ..Default::default()
                })
            })
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<Task> {
        self.state.lock().unwrap().tasks.get(&id).cloned()
    }

    /// PENDING tasks in FIFO order (submit time, id as tie-breaker).
    pub fn pending(&self) -> Vec<Task> {
        let state = self.state.lock().unwrap();
        let mut pending: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| (t.submit_time, t.id));
        pending
    }

    pub fn running(&self) -> Vec<Task> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Task> {
        self.state.lock().unwrap().tasks.values().cloned().collect()
    }

    /// PENDING -> RUNNING with pid and the allocated sets. Refused (false)
    /// for any other current state.
    pub fn mark_running(&self, id: u64, pid: u32, cpus: Vec<u32>, gpus: Vec<u32>) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(&id) else {
            return false;
        };
        if task.status != TaskStatus::Pending {
            return false;
        }
        if !task.transition_to(TaskStatus::Running) {
            return false;
        }
        task.pid = pid;
        task.allocated_cpus = cpus;
        task.allocated_gpus = gpus;
        true
    }

    /// RUNNING -> COMPLETED carrying the exit code. A failing command is
    /// still COMPLETED; FAILED is reserved for scheduling-time failures.
    pub fn mark_completed(&self, id: u64, exit_code: i32) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(&id) else {
            return false;
        };
        if task.status != TaskStatus::Running {
            return false;
        }
        if !task.transition_to(TaskStatus::Completed) {
            return false;
        }
        task.exit_code = exit_code;
        true
    }

    /// PENDING or RUNNING -> FAILED.
    pub fn mark_failed(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(&id) else {
            return false;
        };
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Running) {
            return false;
        }
        task.transition_to(TaskStatus::Failed)
    }

    /// Remove a row. A non-terminal task transitions to CANCELLED first.
    /// Stopping a running process is the caller's job, not this one's.
    pub fn delete(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(&id) else {
            return false;
        };
        if !task.is_terminal() {
            task.transition_to(TaskStatus::Cancelled);
        }
        state.tasks.remove(&id);
        true
    }

    /// Re-read a row under the lock and confirm it is still RUNNING with the
    /// same pid. Guards terminate against racing the reap loop.
    pub fn confirm_running(&self, id: u64, pid: u32) -> bool {
        let state = self.state.lock().unwrap();
        state
            .tasks
            .get(&id)
            .map(|t| t.status == TaskStatus::Running && t.pid == pid)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().tasks.is_empty()
    }

    /// Drop every row and restart ids from 1.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.tasks.clear();
        state.next_id = 1;
    }

    /// Write an atomic JSON snapshot (`{next_id, tasks}`) to the data file.
    pub fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };

        let snapshot = {
            let state = self.state.lock().unwrap();
            QueueSnapshot {
                next_id: state.next_id,
                tasks: state.tasks.values().cloned().collect(),
            }
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(&snapshot)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .with_context(|| format!("writing queue snapshot {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("replacing queue snapshot {}", path.display()))?;
        Ok(())
    }

    /// Load the snapshot back. A missing or empty file is an empty queue;
    /// `next_id` always ends up strictly above every loaded id.
    pub fn reload(&self) -> anyhow::Result<()> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading queue snapshot {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(());
        }

        let snapshot: QueueSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("parsing queue snapshot {}", path.display()))?;

        let mut state = self.state.lock().unwrap();
        state.tasks = snapshot
            .tasks
            .into_iter()
            .map(|task| (task.id, task))
            .collect();
        let max_id = state.tasks.keys().max().copied().unwrap_or(0);
        state.next_id = snapshot.next_id.max(max_id + 1);
        Ok(())
    }
}
