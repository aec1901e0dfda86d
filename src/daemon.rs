use crate::config::Config;
use crate::core::cpu::ProcStatCpuProbe;
use crate::core::events::{EventBus, SchedulerEvent};
use crate::core::executor::Executor;
use crate::core::gpu::NvidiaSmiProbe;
use crate::core::monitor::ResourceMonitor;
use crate::core::queue::{SubmitSpec, TaskQueue};
use crate::core::scheduler::Scheduler;
use crate::core::task::{Task, TaskStatus};
use crate::error::{ErrorCode, RequestError};
use crate::ipc::protocol::{
    DeleteAllResponse, DeleteRequest, DeleteResponse, MsgType, QueueResponse, SubmitRequest,
    SubmitResponse, TaskDetailResponse, TaskInfoRequest, TaskLogRequest, TaskLogResponse,
    TaskSummary,
};
use crate::ipc::server::{IpcServer, RequestHandler};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Process-wide shutdown flag. Signal handlers and the SHUTDOWN request
/// only ever set it; the accept loop and main task observe it.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// The daemon: owns every component, wires them together, and translates
/// socket requests into operations on the queue, monitor, and scheduler.
pub struct Daemon {
    config: Config,
    queue: Arc<TaskQueue>,
    monitor: Arc<ResourceMonitor>,
    executor: Arc<Executor>,
    scheduler: Arc<Scheduler>,
    events: EventBus,
    shutdown: Arc<Shutdown>,
}

impl Daemon {
    pub fn new(config: Config) -> Arc<Self> {
        let queue = Arc::new(TaskQueue::new(Some(config.tasks_file())));
        let monitor = Arc::new(ResourceMonitor::new(
            Box::new(NvidiaSmiProbe),
            Box::new(ProcStatCpuProbe::new(
                config.cpu_util_threshold,
                config.cpu_check_duration_ms,
                config.cpu_check_interval_ms,
            )),
            config.total_cpus,
            config.total_gpus,
            config.gpu_memory_threshold_mb,
        ));
        let executor = Arc::new(Executor::new(
            config.log_dir.clone(),
            config.enable_job_log,
        ));
        let events = EventBus::new();
        let shutdown = Arc::new(Shutdown::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&monitor),
            Arc::clone(&executor),
            events.clone(),
            Arc::clone(&shutdown),
            config.scheduling_interval_ms,
            config.process_check_interval_ms,
        ));

        Arc::new(Self {
            config,
            queue,
            monitor,
            executor,
            scheduler,
            events,
            shutdown,
        })
    }

    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Bring everything up, serve requests until shutdown, then stop the
    /// loops and persist the queue.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config.data_dir)?;
        self.config.save()?;

        if let Err(e) = self.queue.reload() {
            // A corrupt snapshot must not brick the daemon; keep a copy
            // and start fresh.
            tracing::error!("cannot load queue state: {e:#}; starting fresh");
            let tasks_file = self.config.tasks_file();
            let backup = tasks_file.with_extension("json.backup");
            if std::fs::copy(&tasks_file, &backup).is_ok() {
                tracing::warn!("backed up unreadable state to {}", backup.display());
            }
            self.queue.clear();
        }

        self.monitor
            .set_excluded_cpus(self.config.excluded_cpus.clone())
            .await;
        self.monitor
            .set_excluded_gpus(self.config.excluded_gpus.clone())
            .await;

        self.scheduler.recover().await;
        self.scheduler.start();
        self.spawn_event_logger();
        install_signal_handlers(Arc::clone(&self.shutdown));

        // A bind failure is fatal and aborts startup.
        let server = IpcServer::bind(self.config.socket_path.clone())?;
        let handler: Arc<dyn RequestHandler> = Arc::clone(self) as Arc<dyn RequestHandler>;
        server.run(handler, Arc::clone(&self.shutdown)).await;

        tracing::info!("shutting down");
        self.scheduler.stop();
        self.queue.persist()?;
        Ok(())
    }

    fn spawn_event_logger(&self) {
        let mut events = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SchedulerEvent::TaskStateChanged { task_id, from, to }) => {
                        tracing::info!("task {task_id}: {from} -> {to}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("event logger lagged, skipped {skipped} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn persist_or_shutdown(&self) {
        if let Err(e) = self.queue.persist() {
            tracing::error!("cannot persist queue, shutting down: {e:#}");
            self.shutdown.request();
        }
    }

    async fn handle_submit(&self, payload: Value) -> Result<Value, RequestError> {
        let request: SubmitRequest = parse_payload(payload)?;

        if request.ncpu < 0 || request.ngpu < 0 {
            return Err(RequestError::new(
                ErrorCode::ResourceInvalidSpec,
                format!("negative resource count: ncpu={} ngpu={}", request.ncpu, request.ngpu),
            ));
        }
        let script_path = Path::new(&request.script_path);
        if !script_path.is_file() {
            return Err(RequestError::new(
                ErrorCode::TaskScriptNotFound,
                format!("script file not found: {}", request.script_path),
            ));
        }
        let workdir = Path::new(&request.workdir);
        if !workdir.is_dir() {
            return Err(RequestError::new(
                ErrorCode::WorkdirNotFound,
                format!("working directory not found: {}", request.workdir),
            ));
        }

        let id = self.queue.submit(SubmitSpec {
            script_path: script_path.to_path_buf(),
            workdir: workdir.to_path_buf(),
            ncpu: request.ncpu as u32,
            ngpu: request.ngpu as u32,
            requested_cpus: request.specific_cpus,
            requested_gpus: request.specific_gpus,
            log_file: request.log_file,
        });
        tracing::info!(
            "task {id} submitted: script={} workdir={}",
            request.script_path,
            request.workdir
        );
        self.persist_or_shutdown();
        self.scheduler.wake();

        let response = SubmitResponse { task_id: id };
        Ok(json!(response))
    }

    fn handle_query(&self, include_terminal: bool) -> Result<Value, RequestError> {
        let mut running = self.queue.running();
        running.sort_by_key(|t| t.id);

        let response = QueueResponse {
            running: running.iter().map(summarize).collect(),
            pending: self.queue.pending().iter().map(summarize).collect(),
            completed: if include_terminal {
                let mut terminal: Vec<Task> = self
                    .queue
                    .all()
                    .into_iter()
                    .filter(Task::is_terminal)
                    .collect();
                terminal.sort_by_key(|t| t.id);
                terminal.iter().map(summarize).collect()
            } else {
                Vec::new()
            },
        };
        Ok(json!(response))
    }

    async fn handle_delete(&self, payload: Value) -> Result<Value, RequestError> {
        let request: DeleteRequest = parse_payload(payload)?;
        let mut results = Vec::with_capacity(request.task_ids.len());

        for id in request.task_ids {
            let result = match self.queue.get(id) {
                None => false,
                Some(task) if task.status == TaskStatus::Running => {
                    self.scheduler.terminate(id, false).await
                }
                Some(_) => self.queue.delete(id),
            };
            tracing::info!("delete task {id}: {result}");
            results.push(result);
        }

        self.persist_or_shutdown();
        let response = DeleteResponse { results };
        Ok(json!(response))
    }

    async fn handle_delete_all(&self) -> Result<Value, RequestError> {
        let mut response = DeleteAllResponse::default();

        for task in self.queue.all() {
            let deleted = match task.status {
                TaskStatus::Running => {
                    let ok = self.scheduler.terminate(task.id, false).await;
                    if ok {
                        response.running_terminated += 1;
                    }
                    ok
                }
                TaskStatus::Pending => {
                    let ok = self.queue.delete(task.id);
                    if ok {
                        response.pending_deleted += 1;
                    }
                    ok
                }
                _ => {
                    let ok = self.queue.delete(task.id);
                    if ok {
                        response.completed_deleted += 1;
                    }
                    ok
                }
            };
            if deleted {
                response.deleted_count += 1;
            }
        }

        tracing::info!("deleted {} tasks", response.deleted_count);
        self.persist_or_shutdown();
        Ok(json!(response))
    }

    fn handle_task_info(&self, payload: Value) -> Result<Value, RequestError> {
        let request: TaskInfoRequest = parse_payload(payload)?;
        let task = self.queue.get(request.task_id).ok_or_else(|| {
            RequestError::new(
                ErrorCode::TaskNotFound,
                format!("task {} not found", request.task_id),
            )
        })?;

        let response = TaskDetailResponse {
            found: true,
            id: task.id,
            status: task.status.to_string(),
            script: task.script_path.display().to_string(),
            workdir: task.workdir.display().to_string(),
            ncpu: task.ncpu,
            ngpu: task.ngpu,
            specific_cpus: task.requested_cpus.clone(),
            specific_gpus: task.requested_gpus.clone(),
            allocated_cpus: task.allocated_cpus.clone(),
            allocated_gpus: task.allocated_gpus.clone(),
            log_file: task.log_file.clone(),
            exit_code: task.exit_code,
            pid: task.pid,
            submit_time: format_time(Some(task.submit_time)),
            start_time: format_time(task.start_time),
            end_time: format_time(task.end_time),
            duration_seconds: task.duration_seconds(),
        };
        Ok(json!(response))
    }

    fn handle_task_log(&self, payload: Value) -> Result<Value, RequestError> {
        let request: TaskLogRequest = parse_payload(payload)?;
        let task = self.queue.get(request.task_id).ok_or_else(|| {
            RequestError::new(
                ErrorCode::TaskNotFound,
                format!("task {} not found", request.task_id),
            )
        })?;

        let path = self.executor.resolve_log_path(&task).ok_or_else(|| {
            RequestError::new(
                ErrorCode::FileNotFound,
                "no log file configured for this task",
            )
        })?;

        let content = std::fs::read_to_string(&path).map_err(|_| {
            RequestError::new(
                ErrorCode::FileNotFound,
                format!("log file not found: {}", path.display()),
            )
        })?;

        let content = if request.tail_lines > 0 {
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(request.tail_lines);
            let mut tail = lines[start..].join("\n");
            if !tail.is_empty() {
                tail.push('\n');
            }
            tail
        } else {
            content
        };

        let response = TaskLogResponse {
            task_id: task.id,
            found: true,
            log_path: path.display().to_string(),
            content,
            error: String::new(),
        };
        Ok(json!(response))
    }
}

#[async_trait]
impl RequestHandler for Daemon {
    async fn handle(&self, msg_type: MsgType, payload: Value) -> (MsgType, Value) {
        let result = match msg_type {
            MsgType::Submit => self.handle_submit(payload).await,
            MsgType::QueryQueue => self.handle_query(false),
            MsgType::QueryQueueAll => self.handle_query(true),
            MsgType::DeleteTask => self.handle_delete(payload).await,
            MsgType::DeleteAll => self.handle_delete_all().await,
            MsgType::GetTaskInfo => self.handle_task_info(payload),
            MsgType::GetTaskLog => self.handle_task_log(payload),
            MsgType::Shutdown => Ok(json!({"message": "server shutting down"})),
            MsgType::Ok | MsgType::Error => Err(RequestError::new(
                ErrorCode::IpcProtocolError,
                format!("{} is not a request", msg_type.as_str()),
            )),
        };

        match result {
            Ok(payload) => (MsgType::Ok, payload),
            Err(e) => {
                tracing::warn!("{} failed: {e}", msg_type.as_str());
                (
                    MsgType::Error,
                    json!({"code": e.code.as_i32(), "message": e.message}),
                )
            }
        }
    }
}

fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T, RequestError> {
    serde_json::from_value(payload).map_err(|e| {
        RequestError::new(
            ErrorCode::FileParseError,
            format!("failed to parse request: {e}"),
        )
    })
}

fn summarize(task: &Task) -> TaskSummary {
    // Pending rows show what was requested; nothing is allocated yet.
    let (cpus, gpus) = if task.status == TaskStatus::Pending {
        (task.requested_cpus.clone(), task.requested_gpus.clone())
    } else {
        (task.allocated_cpus.clone(), task.allocated_gpus.clone())
    };
    TaskSummary {
        id: task.id,
        status: task.status.to_string(),
        script: task.script_path.display().to_string(),
        workdir: task.workdir.display().to_string(),
        cpus,
        gpus,
        exit_code: task.exit_code,
        duration_seconds: task.duration_seconds(),
    }
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(t) => t
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => String::new(),
    }
}

fn install_signal_handlers(shutdown: Arc<Shutdown>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let term = signal(SignalKind::terminate());
        let int = signal(SignalKind::interrupt());
        let (Ok(mut term), Ok(mut int)) = (term, int) else {
            tracing::error!("cannot install signal handlers");
            return;
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        tracing::info!("signal received, requesting shutdown");
        shutdown.request();
    });
}
