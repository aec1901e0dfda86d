use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "myqueue",
    version,
    about = "User-level batch scheduler for GPU compute jobs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the background daemon
    Server(ServerArgs),
    /// Stop the running daemon
    Stop,
    /// Reset queue data (the daemon must be stopped first)
    Init,
    /// Submit a task to the queue
    Sb(SubmitArgs),
    /// Show the task queue
    Sq {
        /// Pass "all" to include completed tasks
        scope: Option<String>,
        /// Print only the summary line
        #[arg(short, long)]
        summary: bool,
    },
    /// Delete tasks: a single id, an inclusive range "a-b", or "all"
    Del {
        spec: String,
    },
    /// Show detailed information about one task
    Info {
        id: u64,
    },
    /// Show a task's log output
    Log {
        id: u64,
        /// Show only the last N lines
        #[arg(short = 'n', long = "tail", value_name = "LINES")]
        tail: Option<usize>,
    },
    /// Show the current CPU/GPU resource status
    Res,
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Write daemon logs to this directory
    #[arg(long = "log", value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Write each job's merged output to <workdir>/job.log
    #[arg(long = "joblog")]
    pub job_log: bool,

    /// GPU busy threshold in MB
    #[arg(long = "gpumemory", value_name = "MB")]
    pub gpu_memory: Option<u64>,

    /// CPU utilization threshold in percent
    #[arg(long = "cpuusage", value_name = "PERCENT")]
    pub cpu_usage: Option<f64>,

    /// CPU cores hidden from allocation, e.g. "0,1,2"
    #[arg(long = "excpus", value_name = "LIST")]
    pub excluded_cpus: Option<String>,

    /// GPU devices hidden from allocation, e.g. "0,1"
    #[arg(long = "exgpus", value_name = "LIST")]
    pub excluded_gpus: Option<String>,

    /// Stay in the foreground instead of daemonizing
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Clear persisted queue data before starting
    #[arg(long)]
    pub init: bool,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Script to execute
    pub script: String,

    /// Number of CPU cores
    #[arg(long, default_value_t = 1)]
    pub ncpu: i64,

    /// Number of GPU devices
    #[arg(long, default_value_t = 1)]
    pub ngpu: i64,

    /// Specific CPU cores to use, e.g. "0,1,2"
    #[arg(long = "cpus", value_name = "LIST")]
    pub cpus: Option<String>,

    /// Specific GPU devices to use, e.g. "0,1"
    #[arg(long = "gpus", value_name = "LIST")]
    pub gpus: Option<String>,

    /// Working directory for the task (default: current directory)
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// File listing one working directory per line for a batch submission
    #[arg(long = "workdirs", alias = "ws", value_name = "FILE")]
    pub workdirs_file: Option<PathBuf>,

    /// Job log file name, relative to the workdir
    #[arg(long = "logfile", value_name = "NAME")]
    pub log_file: Option<String>,
}
