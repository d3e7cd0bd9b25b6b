//! Controlled CPU and memory load with live host telemetry.
//!
//! A run spawns one worker process per stressed core plus any number of
//! memory workers, samples the host while they run, and guarantees every
//! worker is gone before the controlling process exits.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod cpu_stress;
pub mod dashboard;
pub mod error;
pub mod logging;
pub mod memory_stress;
pub mod sampler;
pub mod shutdown;
pub mod supervisor;
pub mod worker;
pub mod workload;

pub use error::StressError;
pub use sampler::{MetricSnapshot, MetricsSampler};
pub use shutdown::{RunState, RunSummary, ShutdownCause, ShutdownCoordinator};
pub use supervisor::{ReapReport, WorkerHandle, WorkerKind, WorkerState, WorkerSupervisor};
pub use workload::{WorkloadRequest, WorkloadSpec};
