use crate::core::cpu::CpuProbe;
use crate::core::gpu::{GpuProbe, GpuSample};
use crate::error::AllocError;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use tokio::sync::Mutex;

/// Result of a successful allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub cpus: Vec<u32>,
    pub gpus: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct CpuStatus {
    pub core: u32,
    pub utilization: f64,
    pub affinity_group: u8,
    pub reserved: bool,
}

#[derive(Debug, Clone)]
pub struct GpuStatus {
    pub index: u32,
    pub used_mb: u64,
    pub total_mb: u64,
    pub busy: bool,
    pub reserved: bool,
}

#[derive(Debug, Default)]
struct MonitorState {
    reserved_cpus: BTreeSet<u32>,
    reserved_gpus: BTreeSet<u32>,
    excluded_cpus: BTreeSet<u32>,
    excluded_gpus: BTreeSet<u32>,
}

/// Union of the CPU and GPU probes with reservation bookkeeping and the
/// allocation policy.
///
/// The whole of `allocate` runs under one lock so GPU reservation, affinity
/// derivation, and the check-then-reserve CPU walk are atomic with respect
/// to other allocators. The CPU walk awaits inside the lock on purpose:
/// allocation is a slow operation and concurrent allocators must queue.
pub struct ResourceMonitor {
    state: Mutex<MonitorState>,
    gpu_probe: Box<dyn GpuProbe>,
    cpu_probe: Box<dyn CpuProbe>,
    total_cpus: u32,
    total_gpus: u32,
    gpu_memory_threshold_mb: u64,
}

impl ResourceMonitor {
    pub fn new(
        gpu_probe: Box<dyn GpuProbe>,
        cpu_probe: Box<dyn CpuProbe>,
        total_cpus: u32,
        total_gpus: u32,
        gpu_memory_threshold_mb: u64,
    ) -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            gpu_probe,
            cpu_probe,
            total_cpus,
            total_gpus,
            gpu_memory_threshold_mb,
        }
    }

    /// Devices below the midpoint belong to group 1, the rest to group 2,
    /// mirroring the two NUMA sockets.
    pub fn affinity_group(&self, gpu: u32) -> u8 {
        if gpu < self.total_gpus / 2 {
            1
        } else {
            2
        }
    }

    pub fn cpu_range_for_group(&self, group: u8) -> Range<u32> {
        let half = self.total_cpus / 2;
        match group {
            1 => 0..half,
            2 => half..self.total_cpus,
            _ => 0..self.total_cpus,
        }
    }

    /// 0 means "no constraint": either no GPUs, or a set spanning both
    /// groups (legal only for explicit multi-group requests).
    fn derive_group(&self, gpus: &[u32]) -> u8 {
        let mut groups = gpus.iter().map(|&g| self.affinity_group(g));
        match groups.next() {
            None => 0,
            Some(first) => {
                if groups.all(|g| g == first) {
                    first
                } else {
                    0
                }
            }
        }
    }

    fn validate(
        &self,
        ncpu: u32,
        ngpu: u32,
        req_cpus: &[u32],
        req_gpus: &[u32],
    ) -> Result<(), AllocError> {
        if ncpu > self.total_cpus {
            return Err(AllocError::InvalidRequest(format!(
                "ncpu {} exceeds {} cores",
                ncpu, self.total_cpus
            )));
        }
        if ngpu > self.total_gpus {
            return Err(AllocError::InvalidRequest(format!(
                "ngpu {} exceeds {} devices",
                ngpu, self.total_gpus
            )));
        }
        if let Some(&bad) = req_cpus.iter().find(|&&c| c >= self.total_cpus) {
            return Err(AllocError::InvalidRequest(format!("no such core {bad}")));
        }
        if let Some(&bad) = req_gpus.iter().find(|&&g| g >= self.total_gpus) {
            return Err(AllocError::InvalidRequest(format!("no such device {bad}")));
        }
        Ok(())
    }

    /// Memory readings keyed by device, or `None` when the tool failed and
    /// every device must count as busy.
    fn gpu_usage(&self) -> Option<HashMap<u32, u64>> {
        match self.gpu_probe.query() {
            Ok(samples) => Some(samples.iter().map(|s| (s.index, s.used_mb)).collect()),
            Err(e) => {
                tracing::warn!("GPU query failed, treating all devices as busy: {e}");
                None
            }
        }
    }

    fn gpu_busy(&self, usage: &Option<HashMap<u32, u64>>, gpu: u32) -> bool {
        match usage {
            // A device the tool did not list does not exist for us.
            None => true,
            Some(map) => map
                .get(&gpu)
                .map(|&used| used > self.gpu_memory_threshold_mb)
                .unwrap_or(true),
        }
    }

    /// Atomically reserve `ncpu` cores and `ngpu` devices, honoring explicit
    /// requests, exclusions, physical busyness, and CPU-GPU affinity.
    ///
    /// On `Err` the reserved sets are exactly what they were before the
    /// call; partial reservations are rolled back.
    pub async fn allocate(
        &self,
        ncpu: u32,
        ngpu: u32,
        req_cpus: &[u32],
        req_gpus: &[u32],
    ) -> Result<Allocation, AllocError> {
        self.validate(ncpu, ngpu, req_cpus, req_gpus)?;

        let mut state = self.state.lock().await;

        // GPU phase: explicit ids verified as-is, auto-selection scans in
        // ascending id order (deterministic by contract).
        let gpus = if !req_gpus.is_empty() {
            let usage = self.gpu_usage();
            for &gpu in req_gpus {
                if state.excluded_gpus.contains(&gpu)
                    || state.reserved_gpus.contains(&gpu)
                    || self.gpu_busy(&usage, gpu)
                {
                    return Err(AllocError::Unavailable);
                }
            }
            req_gpus.to_vec()
        } else if ngpu > 0 {
            let usage = self.gpu_usage();
            let mut picked = Vec::with_capacity(ngpu as usize);
            for gpu in 0..self.total_gpus {
                if picked.len() == ngpu as usize {
                    break;
                }
                if state.excluded_gpus.contains(&gpu)
                    || state.reserved_gpus.contains(&gpu)
                    || self.gpu_busy(&usage, gpu)
                {
                    continue;
                }
                picked.push(gpu);
            }
            if picked.len() < ngpu as usize {
                return Err(AllocError::Unavailable);
            }
            picked
        } else {
            Vec::new()
        };
        state.reserved_gpus.extend(&gpus);

        // CPU phase, constrained to the affinity group of the chosen GPUs.
        let group = self.derive_group(&gpus);
        let pool = self.cpu_range_for_group(group);

        let mut cpus = Vec::with_capacity(ncpu as usize);
        if !req_cpus.is_empty() {
            for &core in req_cpus {
                if state.excluded_cpus.contains(&core)
                    || state.reserved_cpus.contains(&core)
                    || !self.cpu_probe.is_sustained_idle(core).await
                {
                    for gpu in &gpus {
                        state.reserved_gpus.remove(gpu);
                    }
                    return Err(AllocError::Unavailable);
                }
            }
            cpus = req_cpus.to_vec();
            state.reserved_cpus.extend(&cpus);
        } else if ncpu > 0 {
            let mut candidates: Vec<u32> = pool
                .filter(|core| {
                    !state.reserved_cpus.contains(core) && !state.excluded_cpus.contains(core)
                })
                .collect();

            // Shuffling spreads load across the group; each accepted core is
            // reserved before the next candidate is checked.
            candidates.shuffle(&mut rand::rng());

            for core in candidates {
                if cpus.len() == ncpu as usize {
                    break;
                }
                if self.cpu_probe.is_sustained_idle(core).await {
                    state.reserved_cpus.insert(core);
                    cpus.push(core);
                }
            }

            if cpus.len() < ncpu as usize {
                for core in &cpus {
                    state.reserved_cpus.remove(core);
                }
                for gpu in &gpus {
                    state.reserved_gpus.remove(gpu);
                }
                return Err(AllocError::Unavailable);
            }
            cpus.sort_unstable();
        }

        Ok(Allocation { cpus, gpus })
    }

    /// Return resources to the pool. Unknown ids are ignored; releasing
    /// twice is harmless.
    pub async fn release(&self, cpus: &[u32], gpus: &[u32]) {
        let mut state = self.state.lock().await;
        for core in cpus {
            state.reserved_cpus.remove(core);
        }
        for gpu in gpus {
            state.reserved_gpus.remove(gpu);
        }
    }

    /// Re-enter reservations for tasks adopted at startup, before the
    /// dispatch loop starts handing out resources.
    pub async fn restore_reservations(&self, cpus: &[u32], gpus: &[u32]) {
        let mut state = self.state.lock().await;
        state.reserved_cpus.extend(cpus);
        state.reserved_gpus.extend(gpus);
    }

    /// Exclusions apply to future allocations only; current holders run to
    /// completion.
    pub async fn set_excluded_cpus(&self, cpus: Vec<u32>) {
        self.state.lock().await.excluded_cpus = cpus.into_iter().collect();
    }

    pub async fn set_excluded_gpus(&self, gpus: Vec<u32>) {
        self.state.lock().await.excluded_gpus = gpus.into_iter().collect();
    }

    pub async fn reserved_cpus(&self) -> BTreeSet<u32> {
        self.state.lock().await.reserved_cpus.clone()
    }

    pub async fn reserved_gpus(&self) -> BTreeSet<u32> {
        self.state.lock().await.reserved_gpus.clone()
    }

    /// Snapshot of both resource kinds for status reporting.
    pub async fn status(&self) -> (Vec<CpuStatus>, Vec<GpuStatus>) {
        let utils = self.cpu_probe.sample_all().await;
        let gpu_rows = match self.gpu_probe.query() {
            Ok(samples) => samples,
            // Unreadable inventory reports as fully busy.
            Err(_) => (0..self.total_gpus)
                .map(|index| GpuSample {
                    index,
                    used_mb: self.gpu_memory_threshold_mb + 1,
                    total_mb: 0,
                })
                .collect(),
        };

        let state = self.state.lock().await;
        let half = self.total_cpus / 2;

        let cpus = (0..self.total_cpus)
            .map(|core| CpuStatus {
                core,
                utilization: utils.get(&core).copied().unwrap_or(0.0),
                affinity_group: if core < half { 1 } else { 2 },
                reserved: state.reserved_cpus.contains(&core),
            })
            .collect();

        let gpus = gpu_rows
            .into_iter()
            .map(|sample| GpuStatus {
                index: sample.index,
                used_mb: sample.used_mb,
                total_mb: sample.total_mb,
                busy: sample.used_mb > self.gpu_memory_threshold_mb,
                reserved: state.reserved_gpus.contains(&sample.index),
            })
            .collect();

        (cpus, gpus)
    }
}
