use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daemon configuration.
///
/// Loaded from `<data_dir>/config.json` when present, overridden by
/// command-line flags, and saved back on startup so the next run sees the
/// effective values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// A device whose used memory exceeds this is physically busy.
    pub gpu_memory_threshold_mb: u64,
    /// A core at or above this utilization is not admissible.
    pub cpu_util_threshold: f64,
    /// Sustained observation window for the CPU idle check.
    pub cpu_check_duration_ms: u64,
    /// Sampling interval inside the window.
    pub cpu_check_interval_ms: u64,

    pub scheduling_interval_ms: u64,
    pub process_check_interval_ms: u64,

    /// Fixed topology: dual-socket host, half the cores per socket.
    pub total_cpus: u32,
    pub total_gpus: u32,

    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    /// Daemon log directory; also the fallback target for task output.
    pub log_dir: Option<PathBuf>,
    /// Write each job's merged output to `<workdir>/job.log` by default.
    pub enable_job_log: bool,

    pub excluded_cpus: Vec<u32>,
    pub excluded_gpus: Vec<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gpu_memory_threshold_mb: 2000,
            cpu_util_threshold: 40.0,
            cpu_check_duration_ms: 3000,
            cpu_check_interval_ms: 500,
            scheduling_interval_ms: 1000,
            process_check_interval_ms: 500,
            total_cpus: 64,
            total_gpus: 8,
            socket_path: default_socket_path(),
            data_dir: default_data_dir(),
            log_dir: None,
            enable_job_log: false,
            excluded_cpus: Vec::new(),
            excluded_gpus: Vec::new(),
        }
    }
}

/// `/tmp/myqueue_<user>.sock`
pub fn default_socket_path() -> PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/myqueue_{user}.sock"))
}

/// `<home>/.myqueue/<hostname>/`
pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    home.join(".myqueue").join(host)
}

impl Config {
    pub fn tasks_file(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// Load from `<data_dir>/config.json`; a missing or unreadable file
    /// yields the defaults (with `data_dir` kept).
    pub fn load(data_dir: &Path) -> Self {
        let file = data_dir.join("config.json");
        let mut config = match std::fs::read_to_string(&file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("ignoring malformed {}: {e}", file.display());
                Config::default()
            }),
            Err(_) => Config::default(),
        };
        config.data_dir = data_dir.to_path_buf();
        config
    }

    pub fn save(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(self.config_file(), json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.gpu_memory_threshold_mb, 2000);
        assert_eq!(config.cpu_util_threshold, 40.0);
        assert_eq!(config.cpu_check_duration_ms, 3000);
        assert_eq!(config.scheduling_interval_ms, 1000);
        assert_eq!(config.process_check_interval_ms, 500);
        assert_eq!(config.total_cpus, 64);
        assert_eq!(config.total_gpus, 8);
        assert!(!config.enable_job_log);
    }

    #[test]
    fn socket_path_embeds_the_user() {
        let path = default_socket_path().display().to_string();
        assert!(path.starts_with("/tmp/myqueue_"));
        assert!(path.ends_with(".sock"));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.gpu_memory_threshold_mb = 4096;
        config.excluded_cpus = vec![0, 1];
        config.save().unwrap();

        let loaded = Config::load(dir.path());
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_missing_file_gives_defaults_with_data_dir_kept() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load(dir.path());
        assert_eq!(loaded.data_dir, dir.path());
        assert_eq!(loaded.total_gpus, 8);
    }
}
