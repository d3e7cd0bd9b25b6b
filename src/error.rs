use std::io;

use thiserror::Error;

use crate::supervisor::WorkerKind;

#[derive(Debug, Error)]
pub enum StressError {
    /// Malformed workload, caught before anything is spawned.
    #[error("invalid workload: {0}")]
    Validation(String),

    /// The OS refused to create a worker. Already-spawned workers have been
    /// stopped by the time this is returned.
    #[error("failed to spawn {kind} worker {id}: {source}")]
    Spawn {
        id: u32,
        kind: WorkerKind,
        #[source]
        source: io::Error,
    },

    #[error("could not allocate {size_mb} MiB")]
    Allocation { size_mb: u64 },

    #[error("temperature sensors not available")]
    SensorUnavailable,

    #[error("no {0} workers are running")]
    NoRunningWorkers(WorkerKind),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StressError {
    /// Errors that end the run before or during startup.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StressError::Allocation { .. } | StressError::SensorUnavailable)
    }
}
