use crate::core::task::Task;
use crate::error::SpawnError;
use crate::utils::join_ids;
use chrono::Local;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(i32),
    Signaled(i32),
    /// The process is gone but its exit status is unobservable (e.g. a task
    /// adopted from a previous daemon run).
    Unknown,
}

impl ProcessStatus {
    /// Exit code for a finished process; signaled children report
    /// `128 + signo`, unobservable exits report -1.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            ProcessStatus::Running => None,
            ProcessStatus::Exited(code) => Some(code),
            ProcessStatus::Signaled(sig) => Some(128 + sig),
            ProcessStatus::Unknown => Some(-1),
        }
    }
}

/// Spawns jobs as process-group leaders and manages their lifetime.
pub struct Executor {
    log_dir: Option<PathBuf>,
    job_log_enabled: bool,
}

const WAIT_POLL: Duration = Duration::from_millis(100);

impl Executor {
    pub fn new(log_dir: Option<PathBuf>, job_log_enabled: bool) -> Self {
        if let Some(dir) = &log_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!("cannot create log directory {}: {e}", dir.display());
            }
        }
        Self {
            log_dir,
            job_log_enabled,
        }
    }

    /// Where this task's primary log output goes, in priority order:
    /// explicit per-task file, then the job-log default, then the daemon
    /// log directory, else nowhere.
    pub fn resolve_log_path(&self, task: &Task) -> Option<PathBuf> {
        if !task.log_file.is_empty() {
            return Some(task.workdir.join(&task.log_file));
        }
        if self.job_log_enabled {
            return Some(task.workdir.join("job.log"));
        }
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("task_{}.out", task.id)))
    }

    fn job_log_file(&self, task: &Task) -> Option<PathBuf> {
        if !task.log_file.is_empty() {
            Some(task.workdir.join(&task.log_file))
        } else if self.job_log_enabled {
            Some(task.workdir.join("job.log"))
        } else {
            None
        }
    }

    fn open_truncated(path: &PathBuf) -> Result<File, SpawnError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| SpawnError::LogFile {
                path: path.display().to_string(),
                source,
            })
    }

    fn write_job_header(
        file: &mut File,
        task: &Task,
        cpus: &[u32],
        gpus: &[u32],
    ) -> std::io::Result<()> {
        let bar = "=".repeat(80);
        writeln!(file, "{bar}")?;
        writeln!(file, "myqueue job log")?;
        writeln!(file, "{bar}")?;
        writeln!(file, "Task ID:     {}", task.id)?;
        writeln!(file, "Script:      {}", task.script_path.display())?;
        writeln!(file, "Workdir:     {}", task.workdir.display())?;
        writeln!(file, "CPUs:        {} ({} cores)", join_ids(cpus), cpus.len())?;
        writeln!(file, "GPUs:        {} ({} devices)", join_ids(gpus), gpus.len())?;
        writeln!(
            file,
            "Start Time:  {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
        )?;
        writeln!(file, "{bar}")?;
        writeln!(file)
    }

    /// Start the task's script in its workdir as the leader of a fresh
    /// process group, with `CUDA_VISIBLE_DEVICES`, `MYQUEUE_GPUS`, and
    /// `MYQUEUE_CPUS` set to the allocated ids. Returns the group leader's
    /// pid.
    pub fn spawn(&self, task: &Task, cpus: &[u32], gpus: &[u32]) -> Result<u32, SpawnError> {
        let gpu_list = join_ids(gpus);
        let cpu_list = join_ids(cpus);

        let mut command = Command::new("/bin/bash");
        command
            .arg(&task.script_path)
            .current_dir(&task.workdir)
            .env("CUDA_VISIBLE_DEVICES", &gpu_list)
            .env("MYQUEUE_GPUS", &gpu_list)
            .env("MYQUEUE_CPUS", &cpu_list)
            .stdin(Stdio::null())
            .process_group(0);

        if let Some(path) = self.job_log_file(task) {
            // Single merged stream with a metadata header up front.
            let mut file = Self::open_truncated(&path)?;
            if let Err(e) = Self::write_job_header(&mut file, task, cpus, gpus) {
                tracing::warn!("cannot write job log header for task {}: {e}", task.id);
            }
            let stderr = file.try_clone().map_err(|source| SpawnError::LogFile {
                path: path.display().to_string(),
                source,
            })?;
            command.stdout(Stdio::from(file)).stderr(Stdio::from(stderr));
        } else if let Some(dir) = &self.log_dir {
            let out = Self::open_truncated(&dir.join(format!("task_{}.out", task.id)))?;
            let err = Self::open_truncated(&dir.join(format!("task_{}.err", task.id)))?;
            command.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }

        let child = command.spawn().map_err(|source| SpawnError::Spawn {
            script: task.script_path.display().to_string(),
            source,
        })?;

        let pid = child.id();
        tracing::info!(
            "task {} started: pid={pid} script={} cpus=[{cpu_list}] gpus=[{gpu_list}]",
            task.id,
            task.script_path.display()
        );
        // The reap loop collects the exit status via waitpid; the Child
        // handle is not needed past this point.
        drop(child);
        Ok(pid)
    }

    /// Non-blocking status check.
    pub fn status(&self, pid: u32) -> ProcessStatus {
        match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => ProcessStatus::Running,
            Ok(WaitStatus::Exited(_, code)) => ProcessStatus::Exited(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => ProcessStatus::Signaled(sig as i32),
            Ok(_) => ProcessStatus::Running,
            Err(_) => {
                // Not our wait-child (adopted after a restart, or already
                // reaped); fall back to a liveness probe.
                if self.is_alive(pid) {
                    ProcessStatus::Running
                } else {
                    ProcessStatus::Unknown
                }
            }
        }
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    /// Deliver SIGTERM (or SIGKILL when `hard`) to the task's process
    /// group; falls back to the single process if the group signal fails.
    pub fn signal(&self, pid: u32, hard: bool) -> bool {
        let sig = if hard { Signal::SIGKILL } else { Signal::SIGTERM };
        let pid = Pid::from_raw(pid as i32);
        if signal::killpg(pid, sig).is_ok() {
            return true;
        }
        signal::kill(pid, sig).is_ok()
    }

    /// Poll for termination. `timeout_ms == 0` is a non-blocking peek,
    /// negative blocks indefinitely. Returns the exit code, or `None` on
    /// timeout.
    pub async fn wait(&self, pid: u32, timeout_ms: i64) -> Option<i32> {
        if timeout_ms == 0 {
            return self.status(pid).exit_code();
        }

        let mut elapsed: i64 = 0;
        loop {
            if let Some(code) = self.status(pid).exit_code() {
                return Some(code);
            }
            if timeout_ms > 0 && elapsed >= timeout_ms {
                return None;
            }
            tokio::time::sleep(WAIT_POLL).await;
            elapsed += WAIT_POLL.as_millis() as i64;
        }
    }
}
