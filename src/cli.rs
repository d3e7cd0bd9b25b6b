use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    DisplayMode, RunConfig, DEFAULT_DURATION_SECS, DEFAULT_MEMORY_MB,
};
use crate::worker::{WorkerArgs, WorkerJob};
use crate::workload::WorkloadRequest;

#[derive(Parser, Debug)]
#[command(
    name = "stress-tester",
    version,
    about = "CPU & memory stress tester with real-time monitoring"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Number of CPU cores to stress (0 = all)
    #[arg(short, long, default_value_t = 0)]
    pub cores: usize,

    /// Duration in seconds
    #[arg(short, long, default_value_t = DEFAULT_DURATION_SECS)]
    pub time: u64,

    /// CPU workload intensity factor
    #[arg(short, long, default_value_t = 1)]
    pub intensity: u32,

    /// Number of memory stress processes
    #[arg(short, long, default_value_t = 0)]
    pub memory_processes: usize,

    /// Memory allocation size per process in MB
    #[arg(short = 's', long, default_value_t = DEFAULT_MEMORY_MB)]
    pub memory_size: u64,

    /// Run CPU stress test only (legacy mode)
    #[arg(long)]
    pub cpu_only: bool,

    /// Directory for the per-run log file
    #[arg(long, default_value = ".")]
    pub log_dir: PathBuf,

    /// Sampling / refresh period in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub refresh_ms: u64,

    /// Do not draw the dashboard
    #[arg(short, long)]
    pub quiet: bool,

    /// Log at debug level, including every snapshot
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a single worker; used internally by the supervisor.
    #[command(hide = true)]
    Worker {
        #[command(subcommand)]
        job: WorkerCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    Cpu {
        #[command(flatten)]
        common: WorkerCommon,
        #[arg(long, default_value_t = 1)]
        intensity: u32,
    },
    Memory {
        #[command(flatten)]
        common: WorkerCommon,
        #[arg(long)]
        size_mb: u64,
    },
}

#[derive(Args, Debug)]
pub struct WorkerCommon {
    #[arg(long)]
    pub id: u32,
    /// Pid of the controlling process
    #[arg(long)]
    pub parent: Option<u32>,
    /// Stop on our own after this many seconds
    #[arg(long)]
    pub deadline_secs: Option<u64>,
}

impl Cli {
    pub fn workload_request(&self) -> WorkloadRequest {
        WorkloadRequest {
            cores: self.cores,
            duration_secs: self.time,
            intensity: self.intensity,
            memory_workers: if self.cpu_only { 0 } else { self.memory_processes },
            memory_mb_per_worker: self.memory_size,
        }
    }

    pub fn run_config(&self) -> RunConfig {
        let display = if self.quiet {
            DisplayMode::Quiet
        } else if self.cpu_only {
            DisplayMode::Legacy
        } else {
            DisplayMode::Dashboard
        };
        RunConfig {
            log_dir: self.log_dir.clone(),
            sample_interval: RunConfig::sample_interval_from_millis(self.refresh_ms),
            display,
            verbose: self.verbose,
        }
    }
}

impl WorkerCommand {
    pub fn into_args(self) -> WorkerArgs {
        let (common, job) = match self {
            Self::Cpu { common, intensity } => (common, WorkerJob::Cpu { intensity }),
            Self::Memory { common, size_mb } => (common, WorkerJob::Memory { size_mb }),
        };
        WorkerArgs {
            id: common.id,
            parent: common.parent,
            deadline_secs: common.deadline_secs,
            job,
        }
    }
}
