use std::path::PathBuf;
use std::time::Duration;

/// How long `stop_all` waits for cooperative exits before killing stragglers.
pub const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Upper bound between two stop-flag checks inside a worker.
pub const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(20);

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// sysinfo needs at least this long between CPU refreshes for usage to move.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// Pause between two full passes over a memory worker's buffer.
pub const MEMORY_TOUCH_INTERVAL: Duration = Duration::from_millis(100);

/// How often the coordinator looks for a kind of worker that has died out.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Workers stop on their own this long after the run duration, in case the
/// controlling process never gets to stop them.
pub const BACKSTOP_SLACK: Duration = Duration::from_secs(5);

pub const DEFAULT_DURATION_SECS: u64 = 10;
pub const DEFAULT_MEMORY_MB: u64 = 100;

/// Hard ceiling for a single memory worker (1 TiB).
pub const MAX_MEMORY_MB_PER_WORKER: u64 = 1024 * 1024;

/// Above this a memory request is allowed but warned about.
pub const LARGE_MEMORY_WARNING_MB: u64 = 1000;

/// Snapshots kept for slow readers before the oldest are dropped.
pub const SNAPSHOT_BUFFER: usize = 64;

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Dashboard,
    Legacy,
    Quiet,
}

/// Settings of the controlling process that do not shape the workload itself.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub log_dir: PathBuf,
    pub sample_interval: Duration,
    pub display: DisplayMode,
    pub verbose: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            display: DisplayMode::Dashboard,
            verbose: false,
        }
    }
}

impl RunConfig {
    /// Clamp a requested refresh period to something the sampler can honour.
    pub fn sample_interval_from_millis(ms: u64) -> Duration {
        Duration::from_millis(ms).max(MIN_SAMPLE_INTERVAL)
    }
}
