use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Kernel per-core time counters from one `/proc/stat` sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_time(&self) -> u64 {
        self.idle + self.iowait
    }
}

/// Parse one per-core line (`cpu3 10 0 5 ...`). The aggregate `cpu` line
/// and non-cpu lines return `None`. Fields beyond `idle` may be absent.
pub fn parse_stat_line(line: &str) -> Option<(u32, CpuTimes)> {
    let mut fields = line.split_whitespace();
    let label = fields.next()?;
    let core: u32 = label.strip_prefix("cpu")?.parse().ok()?;

    let mut values = fields.map(|f| f.parse::<u64>().unwrap_or(0));
    let times = CpuTimes {
        user: values.next()?,
        nice: values.next()?,
        system: values.next()?,
        idle: values.next()?,
        iowait: values.next().unwrap_or(0),
        irq: values.next().unwrap_or(0),
        softirq: values.next().unwrap_or(0),
        steal: values.next().unwrap_or(0),
    };
    Some((core, times))
}

fn read_proc_stat() -> std::io::Result<HashMap<u32, CpuTimes>> {
    let content = std::fs::read_to_string("/proc/stat")?;
    Ok(content.lines().filter_map(parse_stat_line).collect())
}

/// Utilization between two samples as a percentage, clamped to [0, 100].
pub fn utilization_between(prev: &CpuTimes, curr: &CpuTimes) -> f64 {
    let total = curr.total().saturating_sub(prev.total());
    if total == 0 {
        return 0.0;
    }
    let idle = curr.idle_time().saturating_sub(prev.idle_time());
    let busy = total.saturating_sub(idle);
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Per-core utilization source with the sustained-idle admission check.
///
/// Production reads `/proc/stat`; tests inject fixed utilizations.
#[async_trait]
pub trait CpuProbe: Send + Sync {
    /// Current utilization of one core in percent; negative on read error.
    async fn utilization(&self, core: u32) -> f64;

    /// True iff every sample across the observation window stays strictly
    /// below the utilization threshold. Any sample at or above it, or a
    /// read error, fails immediately.
    async fn is_sustained_idle(&self, core: u32) -> bool;

    /// One-shot utilization of every core, for status reporting.
    async fn sample_all(&self) -> HashMap<u32, f64>;
}

/// `/proc/stat`-backed probe.
pub struct ProcStatCpuProbe {
    util_threshold: f64,
    window: Duration,
    sample_interval: Duration,
}

/// Gap between the two counter snapshots of a single utilization reading.
const SNAPSHOT_GAP: Duration = Duration::from_millis(100);

impl ProcStatCpuProbe {
    pub fn new(util_threshold: f64, window_ms: u64, sample_interval_ms: u64) -> Self {
        Self {
            util_threshold,
            window: Duration::from_millis(window_ms),
            sample_interval: Duration::from_millis(sample_interval_ms.max(1)),
        }
    }
}

#[async_trait]
impl CpuProbe for ProcStatCpuProbe {
    async fn utilization(&self, core: u32) -> f64 {
        let Ok(first) = read_proc_stat() else {
            return -1.0;
        };
        let Some(prev) = first.get(&core).copied() else {
            return -1.0;
        };

        tokio::time::sleep(SNAPSHOT_GAP).await;

        let Ok(second) = read_proc_stat() else {
            return -1.0;
        };
        let Some(curr) = second.get(&core).copied() else {
            return -1.0;
        };
        utilization_between(&prev, &curr)
    }

    async fn is_sustained_idle(&self, core: u32) -> bool {
        let samples = (self.window.as_millis() / self.sample_interval.as_millis()).max(1) as u32;

        for i in 0..samples {
            let util = self.utilization(core).await;
            if util < 0.0 || util >= self.util_threshold {
                return false;
            }
            if i + 1 < samples {
                tokio::time::sleep(self.sample_interval).await;
            }
        }
        true
    }

    async fn sample_all(&self) -> HashMap<u32, f64> {
        let Ok(first) = read_proc_stat() else {
            return HashMap::new();
        };
        tokio::time::sleep(SNAPSHOT_GAP).await;
        let Ok(second) = read_proc_stat() else {
            return HashMap::new();
        };

        second
            .iter()
            .filter_map(|(core, curr)| {
                first
                    .get(core)
                    .map(|prev| (*core, utilization_between(prev, curr)))
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Probe with fixed utilizations; the sustained check collapses to a
    /// single threshold comparison. Clones share state.
    #[derive(Clone)]
    pub struct MockCpuProbe {
        utils: Arc<Mutex<HashMap<u32, f64>>>,
        threshold: f64,
    }

    impl MockCpuProbe {
        pub fn new(threshold: f64) -> Self {
            Self {
                utils: Arc::new(Mutex::new(HashMap::new())),
                threshold,
            }
        }

        pub fn uniform(threshold: f64, cores: u32, util: f64) -> Self {
            let probe = Self::new(threshold);
            for core in 0..cores {
                probe.set(core, util);
            }
            probe
        }

        pub fn set(&self, core: u32, util: f64) {
            self.utils.lock().unwrap().insert(core, util);
        }
    }

    #[async_trait]
    impl CpuProbe for MockCpuProbe {
        async fn utilization(&self, core: u32) -> f64 {
            self.utils.lock().unwrap().get(&core).copied().unwrap_or(-1.0)
        }

        async fn is_sustained_idle(&self, core: u32) -> bool {
            let util = self.utilization(core).await;
            util >= 0.0 && util < self.threshold
        }

        async fn sample_all(&self) -> HashMap<u32, f64> {
            self.utils.lock().unwrap().clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_per_core_line() {
        let (core, times) =
            parse_stat_line("cpu7 4705 150 1120 16250 520 30 45 0 0 0").unwrap();
        assert_eq!(core, 7);
        assert_eq!(times.user, 4705);
        assert_eq!(times.idle, 16250);
        assert_eq!(times.steal, 0);
    }

    #[test]
    fn parse_skips_aggregate_and_noise() {
        assert!(parse_stat_line("cpu 100 0 50 800").is_none());
        assert!(parse_stat_line("intr 123456").is_none());
        assert!(parse_stat_line("ctxt 99").is_none());
    }

    #[test]
    fn parse_tolerates_short_lines() {
        // Older kernels report only the first four fields.
        let (core, times) = parse_stat_line("cpu0 10 0 5 85").unwrap();
        assert_eq!(core, 0);
        assert_eq!(times.iowait, 0);
        assert_eq!(times.total(), 100);
    }

    #[test]
    fn utilization_from_counter_deltas() {
        let prev = CpuTimes {
            user: 100,
            system: 50,
            idle: 850,
            ..Default::default()
        };
        // +40 busy, +60 idle over the interval -> 40%.
        let curr = CpuTimes {
            user: 130,
            system: 60,
            idle: 910,
            ..Default::default()
        };
        let util = utilization_between(&prev, &curr);
        assert!((util - 40.0).abs() < 1e-9);
    }

    #[test]
    fn utilization_zero_delta_is_zero() {
        let sample = CpuTimes {
            user: 5,
            idle: 95,
            ..Default::default()
        };
        assert_eq!(utilization_between(&sample, &sample), 0.0);
    }

    #[test]
    fn utilization_is_clamped() {
        // Counters that went backwards (core hotplug) must not escape [0, 100].
        let prev = CpuTimes {
            user: 100,
            idle: 100,
            ..Default::default()
        };
        let curr = CpuTimes {
            user: 150,
            idle: 50,
            ..Default::default()
        };
        let util = utilization_between(&prev, &curr);
        assert!((0.0..=100.0).contains(&util));
    }

    #[tokio::test]
    async fn mock_sustained_idle_threshold_is_exclusive() {
        let probe = mock::MockCpuProbe::new(40.0);
        probe.set(0, 39.9);
        probe.set(1, 40.0);
        probe.set(2, 40.1);

        assert!(probe.is_sustained_idle(0).await);
        // Exactly at the threshold is not available.
        assert!(!probe.is_sustained_idle(1).await);
        assert!(!probe.is_sustained_idle(2).await);
        // Unknown core reads as an error, fails closed.
        assert!(!probe.is_sustained_idle(63).await);
    }
}
