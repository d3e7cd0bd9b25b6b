use std::time::Duration;

use serde::Serialize;

use crate::config::{LARGE_MEMORY_WARNING_MB, MAX_MEMORY_MB_PER_WORKER, MIB};
use crate::error::StressError;

/// Workload parameters as they arrive from the command line, unchecked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadRequest {
    /// 0 means "every core on this host".
    pub cores: usize,
    pub duration_secs: u64,
    pub intensity: u32,
    pub memory_workers: usize,
    pub memory_mb_per_worker: u64,
}

/// A validated, immutable description of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkloadSpec {
    cores: usize,
    duration_secs: u64,
    intensity: u32,
    memory_workers: usize,
    memory_mb_per_worker: u64,
}

impl WorkloadSpec {
    /// Validate against the host's logical core count from `num_cpus`.
    pub fn from_request(request: WorkloadRequest) -> Result<Self, StressError> {
        Self::validate(request, num_cpus::get())
    }

    /// Validate with an explicit host core count.
    pub fn validate(request: WorkloadRequest, host_cores: usize) -> Result<Self, StressError> {
        if request.duration_secs == 0 {
            return Err(StressError::Validation("duration must be positive".into()));
        }
        if request.intensity == 0 {
            return Err(StressError::Validation("intensity must be positive".into()));
        }
        if request.memory_workers > 0 {
            if request.memory_mb_per_worker == 0 {
                return Err(StressError::Validation("memory size must be positive".into()));
            }
            if request.memory_mb_per_worker > MAX_MEMORY_MB_PER_WORKER {
                return Err(StressError::Validation(format!(
                    "memory size {} MiB exceeds the {} MiB per-worker limit",
                    request.memory_mb_per_worker, MAX_MEMORY_MB_PER_WORKER
                )));
            }
            let total = (request.memory_workers as u64)
                .checked_mul(request.memory_mb_per_worker)
                .and_then(|mb| mb.checked_mul(MIB))
                .and_then(|bytes| usize::try_from(bytes).ok());
            if total.is_none() {
                return Err(StressError::Validation(
                    "total memory request does not fit in the address space".into(),
                ));
            }
        }

        let cores = if request.cores == 0 {
            host_cores.max(1)
        } else {
            request.cores
        };

        Ok(Self {
            cores,
            duration_secs: request.duration_secs,
            intensity: request.intensity,
            memory_workers: request.memory_workers,
            memory_mb_per_worker: request.memory_mb_per_worker,
        })
    }

    /// Non-fatal concerns worth telling the user about before starting.
    pub fn warnings(&self, host_cores: usize) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.cores > host_cores {
            warnings.push(format!(
                "Requesting {} cores but system has {}",
                self.cores, host_cores
            ));
        }
        if self.memory_workers > 0 && self.memory_mb_per_worker > LARGE_MEMORY_WARNING_MB {
            warnings.push(format!(
                "Large memory allocation ({}MB per process)",
                self.memory_mb_per_worker
            ));
        }
        warnings
    }

    /// Drop the memory workers, used by the legacy CPU-only mode.
    pub fn cpu_only(self) -> Self {
        Self {
            memory_workers: 0,
            ..self
        }
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn intensity(&self) -> u32 {
        self.intensity
    }

    pub fn memory_workers(&self) -> usize {
        self.memory_workers
    }

    pub fn memory_mb_per_worker(&self) -> u64 {
        self.memory_mb_per_worker
    }

    pub fn total_workers(&self) -> usize {
        self.cores + self.memory_workers
    }
}
