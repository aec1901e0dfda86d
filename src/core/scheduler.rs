use crate::core::events::{EventBus, SchedulerEvent};
use crate::core::executor::Executor;
use crate::core::monitor::ResourceMonitor;
use crate::core::queue::TaskQueue;
use crate::core::task::TaskStatus;
use crate::daemon::Shutdown;
use crate::error::AllocError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Graceful-termination grace period before escalating to SIGKILL.
const TERM_GRACE_MS: i64 = 2000;
/// How long to wait after SIGKILL before giving up on the pid.
const KILL_WAIT_MS: i64 = 1000;

/// Drives the two cooperating loops: dispatch (match pending tasks to
/// resources and spawn them) and reap (detect completion and reclaim).
///
/// The scheduler owns none of its collaborators; it borrows the queue,
/// monitor, and executor that the daemon wires together.
pub struct Scheduler {
    queue: Arc<TaskQueue>,
    monitor: Arc<ResourceMonitor>,
    executor: Arc<Executor>,
    events: EventBus,
    shutdown: Arc<Shutdown>,
    running: AtomicBool,
    notify: Notify,
    dispatch_interval: Duration,
    reap_interval: Duration,
}

impl Scheduler {
    pub fn new(
        queue: Arc<TaskQueue>,
        monitor: Arc<ResourceMonitor>,
        executor: Arc<Executor>,
        events: EventBus,
        shutdown: Arc<Shutdown>,
        dispatch_interval_ms: u64,
        reap_interval_ms: u64,
    ) -> Self {
        Self {
            queue,
            monitor,
            executor,
            events,
            shutdown,
            running: AtomicBool::new(false),
            notify: Notify::new(),
            dispatch_interval: Duration::from_millis(dispatch_interval_ms.max(1)),
            reap_interval: Duration::from_millis(reap_interval_ms.max(1)),
        }
    }

    /// Spawn the dispatch and reap loops. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.dispatch_loop().await });

        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.reap_loop().await });
    }

    /// Loops observe the flag at their next iteration boundary; an
    /// in-flight allocation runs to completion.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Nudge the dispatch loop instead of waiting out its interval
    /// (called on submission and on resource release).
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    async fn dispatch_loop(&self) {
        let mut interval = tokio::time::interval(self.dispatch_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.dispatch_once().await;
        }
    }

    async fn reap_loop(&self) {
        let mut interval = tokio::time::interval(self.reap_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            self.reap_once().await;
        }
    }

    /// One dispatch iteration. Strictly head-of-line: when the oldest
    /// pending task cannot be placed, nothing later is considered.
    pub async fn dispatch_once(&self) -> bool {
        let Some(task) = self.queue.pending().into_iter().next() else {
            return false;
        };

        let alloc = match self
            .monitor
            .allocate(
                task.ncpu,
                task.ngpu,
                &task.requested_cpus,
                &task.requested_gpus,
            )
            .await
        {
            Ok(alloc) => alloc,
            Err(AllocError::Unavailable) => {
                // Head-of-line blocking; retried next iteration.
                return false;
            }
            Err(AllocError::InvalidRequest(reason)) => {
                tracing::warn!("task {} can never be placed: {reason}", task.id);
                if self.queue.mark_failed(task.id) {
                    self.publish(task.id, TaskStatus::Pending, TaskStatus::Failed);
                }
                self.persist();
                return false;
            }
        };

        let pid = match self.executor.spawn(&task, &alloc.cpus, &alloc.gpus) {
            Ok(pid) => pid,
            Err(e) => {
                tracing::error!("failed to start task {}: {e}", task.id);
                self.monitor.release(&alloc.cpus, &alloc.gpus).await;
                if self.queue.mark_failed(task.id) {
                    self.publish(task.id, TaskStatus::Pending, TaskStatus::Failed);
                }
                self.persist();
                return false;
            }
        };

        if !self
            .queue
            .mark_running(task.id, pid, alloc.cpus.clone(), alloc.gpus.clone())
        {
            // The task was deleted while we were allocating; undo the spawn.
            tracing::error!("task {} left PENDING during dispatch, killing pid {pid}", task.id);
            self.executor.signal(pid, true);
            self.monitor.release(&alloc.cpus, &alloc.gpus).await;
            return false;
        }

        self.publish(task.id, TaskStatus::Pending, TaskStatus::Running);
        self.persist();
        true
    }

    /// One reap iteration over the RUNNING snapshot.
    pub async fn reap_once(&self) {
        for task in self.queue.running() {
            if task.pid == 0 {
                continue;
            }
            let status = self.executor.status(task.pid);
            let Some(exit_code) = status.exit_code() else {
                continue;
            };

            self.monitor
                .release(&task.allocated_cpus, &task.allocated_gpus)
                .await;
            if self.queue.mark_completed(task.id, exit_code) {
                tracing::info!("task {} finished with exit code {exit_code}", task.id);
                self.publish(task.id, TaskStatus::Running, TaskStatus::Completed);
            }
            self.persist();
            self.wake();
        }
    }

    /// Stop a RUNNING task: graceful signal, grace period, hard kill if
    /// needed, then release resources and drop the row. Not-running tasks
    /// are a no-op returning false.
    pub async fn terminate(&self, id: u64, hard: bool) -> bool {
        let Some(task) = self.queue.get(id) else {
            return false;
        };
        if task.status != TaskStatus::Running || task.pid == 0 {
            return false;
        }

        // The reap loop may have transitioned the task since the snapshot;
        // signals go only to a row still RUNNING under the same pid.
        if self.queue.confirm_running(id, task.pid) {
            self.executor.signal(task.pid, hard);
            let mut exit = self.executor.wait(task.pid, TERM_GRACE_MS).await;
            if exit.is_none() {
                self.executor.signal(task.pid, true);
                exit = self.executor.wait(task.pid, KILL_WAIT_MS).await;
            }
            if exit.is_none() {
                tracing::warn!("task {id} (pid {}) survived SIGKILL", task.pid);
            }
        }

        self.monitor
            .release(&task.allocated_cpus, &task.allocated_gpus)
            .await;
        let deleted = self.queue.delete(id);
        if deleted {
            tracing::info!("task {id} terminated");
            self.publish(id, TaskStatus::Running, TaskStatus::Cancelled);
        }
        self.persist();
        self.wake();
        deleted
    }

    /// Startup pass over tasks loaded in RUNNING state: adopt the ones
    /// whose process is still alive (re-entering their reservations), fail
    /// the ones that died while the daemon was down.
    pub async fn recover(&self) {
        for task in self.queue.running() {
            if task.pid > 0 && self.executor.is_alive(task.pid) {
                tracing::info!("adopting running task {} (pid {})", task.id, task.pid);
                self.monitor
                    .restore_reservations(&task.allocated_cpus, &task.allocated_gpus)
                    .await;
            } else {
                tracing::warn!(
                    "task {} (pid {}) died while the daemon was down",
                    task.id,
                    task.pid
                );
                if self.queue.mark_failed(task.id) {
                    self.publish(task.id, TaskStatus::Running, TaskStatus::Failed);
                }
            }
        }
        self.persist();
    }

    fn publish(&self, task_id: u64, from: TaskStatus, to: TaskStatus) {
        self.events.publish(SchedulerEvent::TaskStateChanged { task_id, from, to });
    }

    /// An unwritable data directory is fatal for the daemon.
    fn persist(&self) {
        if let Err(e) = self.queue.persist() {
            tracing::error!("cannot persist queue, shutting down: {e:#}");
            self.shutdown.request();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cpu::mock::MockCpuProbe;
    use crate::core::gpu::mock::MockGpuProbe;
    use crate::core::queue::SubmitSpec;
    use std::path::PathBuf;

    struct Fixture {
        scheduler: Arc<Scheduler>,
        queue: Arc<TaskQueue>,
        monitor: Arc<ResourceMonitor>,
        gpu_probe: MockGpuProbe,
        _workdir: tempfile::TempDir,
        workdir_path: PathBuf,
    }

    fn fixture(gpu_probe: MockGpuProbe, cpu_probe: MockCpuProbe) -> Fixture {
        let workdir = tempfile::tempdir().unwrap();
        let workdir_path = workdir.path().to_path_buf();

        let queue = Arc::new(TaskQueue::new(None));
        let monitor = Arc::new(ResourceMonitor::new(
            Box::new(gpu_probe.clone()),
            Box::new(cpu_probe),
            64,
            8,
            2000,
        ));
        let executor = Arc::new(Executor::new(None, false));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&monitor),
            executor,
            EventBus::new(),
            Arc::new(Shutdown::new()),
            1000,
            500,
        ));

        Fixture {
            scheduler,
            queue,
            monitor,
            gpu_probe,
            _workdir: workdir,
            workdir_path,
        }
    }

    fn idle_fixture() -> Fixture {
        fixture(
            MockGpuProbe::all_idle(8),
            MockCpuProbe::uniform(40.0, 64, 5.0),
        )
    }

    fn submit_script(fx: &Fixture, body: &str, ncpu: u32, ngpu: u32) -> u64 {
        let script = fx.workdir_path.join(format!("job_{}.sh", fx.queue.len()));
        std::fs::write(&script, body).unwrap();
        fx.queue.submit(SubmitSpec {
            script_path: script,
            workdir: fx.workdir_path.clone(),
            ncpu,
            ngpu,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn lifecycle_pending_running_completed() {
        let fx = idle_fixture();
        let id = submit_script(&fx, "exit 42\n", 1, 1);

        assert!(fx.scheduler.dispatch_once().await);
        let task = fx.queue.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.pid > 0);
        assert_eq!(task.allocated_cpus.len(), 1);
        assert_eq!(task.allocated_gpus, vec![0]);

        // Reap until the child's exit is observed (the reap loop itself
        // must collect the status, or the exit code would be lost).
        for _ in 0..100 {
            fx.scheduler.reap_once().await;
            if fx.queue.get(id).unwrap().status != TaskStatus::Running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let task = fx.queue.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.exit_code, 42);
        assert!(task.duration_seconds() >= 0);

        // Resources returned to the pool.
        assert!(fx.monitor.reserved_cpus().await.is_empty());
        assert!(fx.monitor.reserved_gpus().await.is_empty());
    }

    #[tokio::test]
    async fn head_of_line_blocks_later_tasks() {
        let gpu = MockGpuProbe::all_idle(8);
        for index in 0..7 {
            gpu.set_used(index, 9000); // only GPU 7 idle
        }
        let fx = fixture(gpu, MockCpuProbe::uniform(40.0, 64, 5.0));

        let a = submit_script(&fx, "exit 0\n", 0, 4);
        let b = submit_script(&fx, "exit 0\n", 0, 1);

        // A cannot fit and B must not jump the queue.
        assert!(!fx.scheduler.dispatch_once().await);
        assert_eq!(fx.queue.get(a).unwrap().status, TaskStatus::Pending);
        assert_eq!(fx.queue.get(b).unwrap().status, TaskStatus::Pending);
        assert!(fx.monitor.reserved_gpus().await.is_empty());

        // Free three more devices; the next iteration starts A, B stays.
        for index in 4..7 {
            fx.gpu_probe.set_used(index, 0);
        }
        assert!(fx.scheduler.dispatch_once().await);
        assert_eq!(fx.queue.get(a).unwrap().status, TaskStatus::Running);
        assert_eq!(fx.queue.get(b).unwrap().status, TaskStatus::Pending);

        fx.scheduler.terminate(a, true).await;
    }

    #[tokio::test]
    async fn spawn_failure_releases_and_fails_the_task() {
        let fx = idle_fixture();
        let id = fx.queue.submit(SubmitSpec {
            script_path: fx.workdir_path.join("missing.sh"),
            workdir: PathBuf::from("/nonexistent/workdir"),
            ncpu: 1,
            ngpu: 1,
            ..Default::default()
        });

        assert!(!fx.scheduler.dispatch_once().await);
        assert_eq!(fx.queue.get(id).unwrap().status, TaskStatus::Failed);
        assert!(fx.monitor.reserved_cpus().await.is_empty());
        assert!(fx.monitor.reserved_gpus().await.is_empty());
    }

    #[tokio::test]
    async fn impossible_request_fails_instead_of_blocking_forever() {
        let fx = idle_fixture();
        let id = submit_script(&fx, "exit 0\n", 0, 9);

        assert!(!fx.scheduler.dispatch_once().await);
        assert_eq!(fx.queue.get(id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn terminate_kills_and_removes_a_running_task() {
        let fx = idle_fixture();
        let id = submit_script(&fx, "sleep 30\n", 1, 0);

        assert!(fx.scheduler.dispatch_once().await);
        let pid = fx.queue.get(id).unwrap().pid;
        assert!(pid > 0);

        assert!(fx.scheduler.terminate(id, false).await);
        assert!(fx.queue.get(id).is_none());
        assert!(fx.monitor.reserved_cpus().await.is_empty());

        let executor = Executor::new(None, false);
        assert!(!executor.is_alive(pid));
    }

    #[tokio::test]
    async fn terminate_is_a_noop_for_non_running_tasks() {
        let fx = idle_fixture();
        let id = submit_script(&fx, "exit 0\n", 1, 0);

        assert!(!fx.scheduler.terminate(id, false).await);
        assert_eq!(fx.queue.get(id).unwrap().status, TaskStatus::Pending);
        assert!(!fx.scheduler.terminate(9999, false).await);
    }

    #[tokio::test]
    async fn recovery_adopts_live_tasks_and_fails_dead_ones() {
        let fx = idle_fixture();

        // A genuinely live process for the adopted task.
        let live = submit_script(&fx, "sleep 30\n", 0, 0);
        let executor = Executor::new(None, false);
        let task = fx.queue.get(live).unwrap();
        let pid = executor.spawn(&task, &[], &[]).unwrap();
        assert!(fx.queue.mark_running(live, pid, vec![2, 3], vec![1]));

        // A task whose pid is long gone.
        let dead = submit_script(&fx, "exit 0\n", 0, 0);
        assert!(fx.queue.mark_running(dead, 999_999_999, vec![10], vec![5]));

        fx.scheduler.recover().await;

        assert_eq!(fx.queue.get(live).unwrap().status, TaskStatus::Running);
        assert_eq!(fx.queue.get(dead).unwrap().status, TaskStatus::Failed);

        let reserved_cpus = fx.monitor.reserved_cpus().await;
        assert!(reserved_cpus.contains(&2) && reserved_cpus.contains(&3));
        assert!(!reserved_cpus.contains(&10));
        assert_eq!(
            fx.monitor.reserved_gpus().await.into_iter().collect::<Vec<_>>(),
            vec![1]
        );

        executor.signal(pid, true);
        executor.wait(pid, 5000).await;
    }
}
