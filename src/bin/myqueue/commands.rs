use crate::cli::{ServerArgs, SubmitArgs};
use anyhow::{bail, Context, Result};
use myqueue::config::{default_data_dir, Config};
use myqueue::core::cpu::ProcStatCpuProbe;
use myqueue::core::gpu::NvidiaSmiProbe;
use myqueue::core::monitor::ResourceMonitor;
use myqueue::daemon::Daemon;
use myqueue::ipc::client::IpcClient;
use myqueue::ipc::protocol::{QueueResponse, SubmitRequest, TaskSummary};
use myqueue::utils::{absolute_path, parse_id_range, parse_int_list, parse_workdirs_file};
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// The daemon answers on its socket only while it is alive; a refused
/// connection means no instance is running.
fn server_is_running(config: &Config) -> bool {
    std::os::unix::net::UnixStream::connect(&config.socket_path).is_ok()
}

async fn connect(config: &Config) -> Result<IpcClient> {
    IpcClient::connect(&config.socket_path).await
}

fn load_config() -> Config {
    Config::load(&default_data_dir())
}

pub fn server(args: ServerArgs, verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>) -> Result<()> {
    let mut config = load_config();

    if let Some(dir) = args.log_dir {
        config.log_dir = Some(absolute_path(&dir.display().to_string()));
    }
    if args.job_log {
        config.enable_job_log = true;
    }
    if let Some(mb) = args.gpu_memory {
        config.gpu_memory_threshold_mb = mb;
    }
    if let Some(percent) = args.cpu_usage {
        config.cpu_util_threshold = percent;
    }
    if let Some(list) = args.excluded_cpus {
        config.excluded_cpus = parse_int_list(&list);
    }
    if let Some(list) = args.excluded_gpus {
        config.excluded_gpus = parse_int_list(&list);
    }

    if server_is_running(&config) {
        bail!("server is already running on {}", config.socket_path.display());
    }

    if args.init {
        println!("Initializing queue data...");
        let _ = std::fs::remove_file(config.tasks_file());
    }

    println!("Starting myqueue server...");
    println!("  Socket:    {}", config.socket_path.display());
    println!("  Data dir:  {}", config.data_dir.display());
    if let Some(dir) = &config.log_dir {
        println!("  Log dir:   {}", dir.display());
    }
    println!(
        "  Job log:   {}",
        if config.enable_job_log { "enabled" } else { "disabled" }
    );
    println!("  GPU memory threshold: {} MB", config.gpu_memory_threshold_mb);
    println!("  CPU usage threshold:  {}%", config.cpu_util_threshold);

    if !args.foreground {
        // Fork before any runtime or logging threads exist.
        daemonize::Daemonize::new()
            .working_directory("/")
            .start()
            .context("failed to daemonize")?;
    }

    // Tracing goes to the log directory (and to stderr in the foreground).
    let _guard = init_daemon_tracing(&config, args.foreground, verbosity)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let daemon = Daemon::new(config);
        daemon.run().await
    })
}

fn init_daemon_tracing(
    config: &Config,
    foreground: bool,
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let console_layer = foreground
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, "server.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(verbosity.tracing_level_filter())
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

pub async fn stop() -> Result<()> {
    let config = load_config();
    let mut client = connect(&config).await?;
    client.shutdown().await?;
    println!("Server shutdown requested");
    Ok(())
}

pub fn init() -> Result<()> {
    let config = load_config();
    if server_is_running(&config) {
        bail!("server is running; stop it first with 'myqueue stop'");
    }

    println!("Initializing myqueue data in {}", config.data_dir.display());
    if std::fs::remove_file(config.tasks_file()).is_ok() {
        println!("  Removed {}", config.tasks_file().display());
    }
    if std::fs::remove_file(&config.socket_path).is_ok() {
        println!("  Removed {}", config.socket_path.display());
    }
    println!("Queue is now empty");
    Ok(())
}

pub async fn submit(args: SubmitArgs) -> Result<()> {
    let config = load_config();
    let mut client = connect(&config).await?;

    let script = absolute_path(&args.script).display().to_string();
    let specific_cpus = args.cpus.as_deref().map(parse_int_list).unwrap_or_default();
    let specific_gpus = args.gpus.as_deref().map(parse_int_list).unwrap_or_default();
    let log_file = args.log_file.unwrap_or_default();

    // Batch mode: one task per listed directory.
    if let Some(file) = args.workdirs_file {
        let (valid, invalid) = parse_workdirs_file(&file)
            .with_context(|| format!("reading workdir list {}", file.display()))?;
        for dir in &invalid {
            eprintln!("skipping missing directory: {dir}");
        }
        if valid.is_empty() {
            bail!("no usable working directories in {}", file.display());
        }
        for dir in valid {
            let id = client
                .submit(&SubmitRequest {
                    script_path: script.clone(),
                    workdir: absolute_path(&dir).display().to_string(),
                    ncpu: args.ncpu,
                    ngpu: args.ngpu,
                    specific_cpus: specific_cpus.clone(),
                    specific_gpus: specific_gpus.clone(),
                    log_file: log_file.clone(),
                })
                .await?;
            println!("Submitted task {id} ({dir})");
        }
        return Ok(());
    }

    let workdir = match args.workdir {
        Some(dir) => absolute_path(&dir),
        None => std::env::current_dir()?,
    };
    let id = client
        .submit(&SubmitRequest {
            script_path: script,
            workdir: workdir.display().to_string(),
            ncpu: args.ncpu,
            ngpu: args.ngpu,
            specific_cpus,
            specific_gpus,
            log_file,
        })
        .await?;
    println!("Submitted task {id}");
    Ok(())
}

#[derive(Tabled)]
struct QueueRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "EXIT")]
    exit: String,
    #[tabled(rename = "TIME")]
    time: String,
    #[tabled(rename = "CPUS")]
    cpus: String,
    #[tabled(rename = "GPUS")]
    gpus: String,
    #[tabled(rename = "WORKDIR")]
    workdir: String,
}

fn queue_row(task: &TaskSummary) -> QueueRow {
    let terminal = matches!(task.status.as_str(), "completed" | "failed" | "cancelled");
    QueueRow {
        id: task.id,
        status: task.status.clone(),
        exit: if terminal {
            task.exit_code.to_string()
        } else {
            "-".to_string()
        },
        time: if task.status == "pending" {
            "-".to_string()
        } else {
            myqueue::utils::format_duration_secs(task.duration_seconds)
        },
        cpus: myqueue::utils::join_ids(&task.cpus),
        gpus: myqueue::utils::join_ids(&task.gpus),
        workdir: task.workdir.clone(),
    }
}

pub async fn queue(all: bool, summary: bool) -> Result<()> {
    let config = load_config();
    let mut client = connect(&config).await?;
    let response: QueueResponse = client.query_queue(all).await?;

    let running = response.running.len();
    let pending = response.pending.len();
    let completed = response.completed.len();

    if !summary {
        let rows: Vec<QueueRow> = response
            .running
            .iter()
            .chain(response.pending.iter())
            .chain(response.completed.iter())
            .map(queue_row)
            .collect();
        if rows.is_empty() {
            println!("Queue is empty");
            return Ok(());
        }
        println!("{}", Table::new(&rows).with(Style::sharp()));
    }

    if all {
        println!("Total: {running} running, {pending} pending, {completed} completed");
    } else {
        println!("Total: {running} running, {pending} pending");
    }
    Ok(())
}

pub async fn delete(spec: &str) -> Result<()> {
    let config = load_config();
    let mut client = connect(&config).await?;

    if spec.eq_ignore_ascii_case("all") {
        let response = client.delete_all().await?;
        println!(
            "Deleted {} tasks ({} running terminated, {} pending, {} completed)",
            response.deleted_count,
            response.running_terminated,
            response.pending_deleted,
            response.completed_deleted
        );
        return Ok(());
    }

    let ids = parse_id_range(spec);
    if ids.is_empty() {
        bail!("invalid id or range: {spec}");
    }
    let results = client.delete_tasks(ids.clone()).await?;
    for (id, ok) in ids.iter().zip(results) {
        if ok {
            println!("Deleted task {id}");
        } else {
            eprintln!("Task {id} not found");
        }
    }
    Ok(())
}

pub async fn info(id: u64) -> Result<()> {
    let config = load_config();
    let mut client = connect(&config).await?;
    let detail = client.task_info(id).await?;

    println!("Task {}", detail.id);
    println!("  Status:       {}", detail.status);
    println!("  Script:       {}", detail.script);
    println!("  Workdir:      {}", detail.workdir);
    println!("  Requested:    {} cpus, {} gpus", detail.ncpu, detail.ngpu);
    if !detail.specific_cpus.is_empty() || !detail.specific_gpus.is_empty() {
        println!(
            "  Explicit ids: cpus [{}], gpus [{}]",
            myqueue::utils::join_ids(&detail.specific_cpus),
            myqueue::utils::join_ids(&detail.specific_gpus)
        );
    }
    println!(
        "  Allocated:    cpus [{}], gpus [{}]",
        myqueue::utils::join_ids(&detail.allocated_cpus),
        myqueue::utils::join_ids(&detail.allocated_gpus)
    );
    if !detail.log_file.is_empty() {
        println!("  Log file:     {}", detail.log_file);
    }
    if detail.pid > 0 {
        println!("  PID:          {}", detail.pid);
    }
    println!("  Submitted:    {}", detail.submit_time);
    if !detail.start_time.is_empty() {
        println!("  Started:      {}", detail.start_time);
    }
    if !detail.end_time.is_empty() {
        println!("  Ended:        {}", detail.end_time);
        println!("  Exit code:    {}", detail.exit_code);
    }
    println!(
        "  Duration:     {}",
        myqueue::utils::format_duration_secs(detail.duration_seconds)
    );
    Ok(())
}

pub async fn log(id: u64, tail: Option<usize>) -> Result<()> {
    let config = load_config();
    let mut client = connect(&config).await?;
    let response = client.task_log(id, tail.unwrap_or(0)).await?;

    eprintln!("==> {} <==", response.log_path);
    print!("{}", response.content);
    Ok(())
}

/// Local resource snapshot; reads the hardware directly, no daemon needed.
pub async fn resources() -> Result<()> {
    let config = load_config();
    let monitor = ResourceMonitor::new(
        Box::new(NvidiaSmiProbe),
        Box::new(ProcStatCpuProbe::new(
            config.cpu_util_threshold,
            config.cpu_check_duration_ms,
            config.cpu_check_interval_ms,
        )),
        config.total_cpus,
        config.total_gpus,
        config.gpu_memory_threshold_mb,
    );
    let (cpus, gpus) = monitor.status().await;

    #[derive(Tabled)]
    struct GpuRow {
        #[tabled(rename = "ID")]
        id: u32,
        #[tabled(rename = "STATE")]
        state: &'static str,
        #[tabled(rename = "MEMORY")]
        memory: String,
    }

    let rows: Vec<GpuRow> = gpus
        .iter()
        .map(|g| GpuRow {
            id: g.index,
            state: if g.busy { "busy" } else { "idle" },
            memory: format!("{}/{} MB", g.used_mb, g.total_mb),
        })
        .collect();
    println!("=== GPU status (busy over {} MB) ===", config.gpu_memory_threshold_mb);
    if rows.is_empty() {
        println!("no GPUs detected");
    } else {
        println!("{}", Table::new(&rows).with(Style::sharp()));
    }

    println!(
        "\n=== CPU status (busy at or over {}%) ===",
        config.cpu_util_threshold
    );
    for group in [1u8, 2] {
        let members: Vec<_> = cpus.iter().filter(|c| c.affinity_group == group).collect();
        let idle = members
            .iter()
            .filter(|c| c.utilization < config.cpu_util_threshold && !c.reserved)
            .count();
        let range = monitor.cpu_range_for_group(group);
        println!(
            "Group {group} (cores {}-{}): {idle}/{} idle",
            range.start,
            range.end.saturating_sub(1),
            members.len()
        );
    }
    Ok(())
}
