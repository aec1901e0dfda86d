use anyhow::{bail, Context};
use std::process::Command;

/// One device row from the inventory tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuSample {
    pub index: u32,
    pub used_mb: u64,
    pub total_mb: u64,
}

/// Source of per-device memory readings.
///
/// An `Err` means the tool is missing or its output unusable; the monitor
/// then treats every device as busy.
pub trait GpuProbe: Send + Sync {
    fn query(&self) -> anyhow::Result<Vec<GpuSample>>;
}

/// Probe backed by `nvidia-smi` CSV output.
pub struct NvidiaSmiProbe;

impl NvidiaSmiProbe {
    /// Parse `index, memory.used, memory.total` lines. Blank lines are
    /// skipped; a malformed line fails the whole reading so the caller
    /// falls back to the busy-everywhere default.
    pub fn parse_output(output: &str) -> anyhow::Result<Vec<GpuSample>> {
        let mut samples = Vec::new();
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 3 {
                bail!("unexpected nvidia-smi line: {line:?}");
            }
            samples.push(GpuSample {
                index: fields[0].parse().context("device index")?,
                used_mb: fields[1].parse().context("used memory")?,
                total_mb: fields[2].parse().context("total memory")?,
            });
        }
        Ok(samples)
    }
}

impl GpuProbe for NvidiaSmiProbe {
    fn query(&self) -> anyhow::Result<Vec<GpuSample>> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .context("running nvidia-smi")?;

        if !output.status.success() {
            bail!("nvidia-smi exited with {}", output.status);
        }

        Self::parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Probe answering from a caller-supplied sample list. Clones share
    /// state, so tests can adjust readings after handing one to a monitor.
    #[derive(Clone)]
    pub struct MockGpuProbe {
        samples: Arc<Mutex<anyhow::Result<Vec<GpuSample>>>>,
    }

    impl MockGpuProbe {
        pub fn new(samples: Vec<GpuSample>) -> Self {
            Self {
                samples: Arc::new(Mutex::new(Ok(samples))),
            }
        }

        pub fn failing() -> Self {
            Self {
                samples: Arc::new(Mutex::new(Err(anyhow::anyhow!("tool unavailable")))),
            }
        }

        /// All `count` devices idle at 0 MB used.
        pub fn all_idle(count: u32) -> Self {
            Self::new(
                (0..count)
                    .map(|index| GpuSample {
                        index,
                        used_mb: 0,
                        total_mb: 16384,
                    })
                    .collect(),
            )
        }

        pub fn set_used(&self, index: u32, used_mb: u64) {
            if let Ok(samples) = self.samples.lock().unwrap().as_mut() {
                if let Some(sample) = samples.iter_mut().find(|s| s.index == index) {
                    sample.used_mb = used_mb;
                }
            }
        }
    }

    impl GpuProbe for MockGpuProbe {
        fn query(&self) -> anyhow::Result<Vec<GpuSample>> {
            match &*self.samples.lock().unwrap() {
                Ok(samples) => Ok(samples.clone()),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_well_formed_output() {
        let samples =
            NvidiaSmiProbe::parse_output("0, 1234, 16384\n1, 567, 16384\n\n2, 0, 24576\n")
                .unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(
            samples[0],
            GpuSample {
                index: 0,
                used_mb: 1234,
                total_mb: 16384
            }
        );
        assert_eq!(samples[2].total_mb, 24576);
    }

    #[test]
    fn parse_empty_output() {
        assert!(NvidiaSmiProbe::parse_output("").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(NvidiaSmiProbe::parse_output("0, 1234").is_err());
        assert!(NvidiaSmiProbe::parse_output("zero, 1, 2").is_err());
        assert!(NvidiaSmiProbe::parse_output("NVIDIA-SMI has failed").is_err());
    }
}
