use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::{BACKSTOP_SLACK, GRACE_PERIOD};
use crate::error::StressError;
use crate::workload::WorkloadSpec;

/// Line a worker prints on stdout once its load is live.
pub const READY_LINE: &str = "ready";

/// Exit code of a memory worker that could not get its buffer.
pub const EXIT_ALLOCATION_FAILED: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Cpu,
    Memory,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Starting,
    Running,
    StopRequested,
    Stopped,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    fn can_become(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Starting, Running | StopRequested | Stopped | Failed)
                | (Running, StopRequested | Stopped | Failed)
                | (StopRequested, Stopped | Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    Graceful,
    Forced,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHandle {
    pub id: u32,
    pub kind: WorkerKind,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub stop_mode: Option<StopMode>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub graceful: usize,
    pub forced: usize,
    pub failed: usize,
    /// Workers that outlived even the kill; also counted in `failed`.
    pub unresponsive: usize,
}

/// Per-state head count over a set of handles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCensus {
    pub starting: usize,
    pub running: usize,
    pub stop_requested: usize,
    pub stopped: usize,
    pub failed: usize,
}

impl WorkerCensus {
    pub fn of(handles: &[WorkerHandle], kind: Option<WorkerKind>) -> Self {
        let mut census = Self::default();
        for handle in handles.iter().filter(|h| kind.map_or(true, |k| h.kind == k)) {
            match handle.state {
                WorkerState::Starting => census.starting += 1,
                WorkerState::Running => census.running += 1,
                WorkerState::StopRequested => census.stop_requested += 1,
                WorkerState::Stopped => census.stopped += 1,
                WorkerState::Failed => census.failed += 1,
            }
        }
        census
    }

    pub fn live(&self) -> usize {
        self.starting + self.running + self.stop_requested
    }
}

/// Builds the command that runs one worker.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, id: u32, kind: WorkerKind, spec: &WorkloadSpec) -> Command;
}

/// Runs workers by re-executing a program with its `worker` subcommand.
#[derive(Debug, Clone)]
pub struct ExecLauncher {
    program: PathBuf,
}

impl ExecLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl WorkerLauncher for ExecLauncher {
    fn command(&self, id: u32, kind: WorkerKind, spec: &WorkloadSpec) -> Command {
        let backstop = spec.duration() + BACKSTOP_SLACK;
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg(kind.to_string())
            .arg("--id")
            .arg(id.to_string())
            .arg("--parent")
            .arg(std::process::id().to_string())
            .arg("--deadline-secs")
            .arg(backstop.as_secs().to_string());
        match kind {
            WorkerKind::Cpu => cmd.arg("--intensity").arg(spec.intensity().to_string()),
            WorkerKind::Memory => cmd
                .arg("--size-mb")
                .arg(spec.memory_mb_per_worker().to_string()),
        };
        cmd
    }
}

struct WorkerSlot {
    id: u32,
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

type Handles = Arc<Mutex<Vec<WorkerHandle>>>;

/// Sole owner of the run's workers. Every state change of a handle goes
/// through here or through the monitor task the supervisor spawned for it.
pub struct WorkerSupervisor {
    launcher: Box<dyn WorkerLauncher>,
    handles: Handles,
    slots: AsyncMutex<Vec<WorkerSlot>>,
    report: Mutex<Option<ReapReport>>,
}

impl WorkerSupervisor {
    pub fn new(launcher: impl WorkerLauncher + 'static) -> Self {
        Self {
            launcher: Box::new(launcher),
            handles: Arc::new(Mutex::new(Vec::new())),
            slots: AsyncMutex::new(Vec::new()),
            report: Mutex::new(None),
        }
    }

    /// Spawn `spec.cores()` CPU workers and `spec.memory_workers()` memory
    /// workers without waiting for them. If any spawn fails, the ones already
    /// started are stopped before the error comes back.
    pub async fn start(&self, spec: &WorkloadSpec) -> Result<Vec<WorkerHandle>, StressError> {
        let mut slots = self.slots.lock().await;
        if !slots.is_empty() || self.lock_report().is_some() {
            return Err(StressError::Validation(
                "workers were already started for this run".into(),
            ));
        }

        let plan = std::iter::repeat(WorkerKind::Cpu)
            .take(spec.cores())
            .chain(std::iter::repeat(WorkerKind::Memory).take(spec.memory_workers()));

        for (id, kind) in (0u32..).zip(plan) {
            match self.spawn_one(id, kind, spec) {
                Ok(slot) => slots.push(slot),
                Err(source) => {
                    warn!(worker_id = id, %kind, error = %source, "spawn failed, rolling back");
                    let report = self.reap(&mut slots, GRACE_PERIOD).await;
                    *self.lock_report() = Some(report);
                    return Err(StressError::Spawn { id, kind, source });
                }
            }
        }

        Ok(self.live_handles())
    }

    fn spawn_one(&self, id: u32, kind: WorkerKind, spec: &WorkloadSpec) -> io::Result<WorkerSlot> {
        let mut cmd = self.launcher.command(id, kind, spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let child = cmd.spawn()?;
        let pid = child.id();

        self.lock_handles().push(WorkerHandle {
            id,
            kind,
            state: WorkerState::Starting,
            started_at: Utc::now(),
            pid,
            stop_mode: None,
            failure: None,
        });
        info!(worker_id = id, %kind, pid = ?pid, "worker spawned");

        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(child, id, Arc::clone(&self.handles), kill_rx));
        Ok(WorkerSlot {
            id,
            pid,
            kill: Some(kill_tx),
            monitor,
        })
    }

    /// Ask every live worker to stop, wait up to `grace`, then kill the rest.
    /// A second call after completion returns the first report untouched.
    pub async fn stop_all(&self, grace: Duration) -> ReapReport {
        let mut slots = self.slots.lock().await;
        let cached = *self.lock_report();
        if let Some(report) = cached {
            debug!("stop_all called again after completion");
            return report;
        }
        let report = self.reap(&mut slots, grace).await;
        *self.lock_report() = Some(report);
        info!(
            graceful = report.graceful,
            forced = report.forced,
            failed = report.failed,
            "all workers reaped"
        );
        report
    }

    async fn reap(&self, slots: &mut [WorkerSlot], grace: Duration) -> ReapReport {
        let deadline = Instant::now() + grace;

        for slot in slots.iter_mut() {
            if slot.monitor.is_finished() {
                continue;
            }
            if transition(&self.handles, slot.id, WorkerState::StopRequested) {
                debug!(worker_id = slot.id, "stop requested");
                if !slot.pid.is_some_and(signal_terminate) {
                    force(slot);
                }
            }
        }

        for slot in slots.iter_mut() {
            if slot.monitor.is_finished() {
                continue;
            }
            if timeout_at(deadline, &mut slot.monitor).await.is_err() {
                warn!(worker_id = slot.id, "grace period expired, killing worker");
                force(slot);
            }
        }

        let kill_deadline = Instant::now() + grace;
        let mut unresponsive = 0;
        for slot in slots.iter_mut() {
            if slot.monitor.is_finished() {
                continue;
            }
            if timeout_at(kill_deadline, &mut slot.monitor).await.is_err() {
                warn!(worker_id = slot.id, pid = ?slot.pid, "worker did not terminate after kill");
                slot.monitor.abort();
                unresponsive += 1;
                settle_state(
                    &self.handles,
                    slot.id,
                    WorkerState::Failed,
                    None,
                    Some("did not terminate after kill".into()),
                );
            }
        }

        let handles = self.lock_handles();
        ReapReport {
            graceful: count_mode(&handles, StopMode::Graceful),
            forced: count_mode(&handles, StopMode::Forced),
            failed: WorkerCensus::of(&handles, None).failed,
            unresponsive,
        }
    }

    /// Snapshot of every handle of this run, terminal ones included.
    pub fn live_handles(&self) -> Vec<WorkerHandle> {
        self.lock_handles().clone()
    }

    /// A kind that was requested but has no live worker left, with at least
    /// one of them failed.
    pub fn exhausted_kind(&self, spec: &WorkloadSpec) -> Option<WorkerKind> {
        let handles = self.lock_handles();
        [
            (WorkerKind::Cpu, spec.cores()),
            (WorkerKind::Memory, spec.memory_workers()),
        ]
        .into_iter()
        .filter(|(_, requested)| *requested > 0)
        .find(|(kind, requested)| {
            let census = WorkerCensus::of(&handles, Some(*kind));
            census.live() == 0 && census.failed > 0 && census.stopped + census.failed == *requested
        })
        .map(|(kind, _)| kind)
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<WorkerHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_report(&self) -> MutexGuard<'_, Option<ReapReport>> {
        self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn force(slot: &mut WorkerSlot) {
    if let Some(kill) = slot.kill.take() {
        let _ = kill.send(());
    }
}

fn count_mode(handles: &[WorkerHandle], mode: StopMode) -> usize {
    handles.iter().filter(|h| h.stop_mode == Some(mode)).count()
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // a child whose monitor has not reaped it yet.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> bool {
    false
}

/// True if the status is the default action of the SIGTERM we sent.
#[cfg(unix)]
fn died_of_sigterm(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc::SIGTERM)
}

#[cfg(not(unix))]
fn died_of_sigterm(_status: ExitStatus) -> bool {
    false
}

fn lock(handles: &Mutex<Vec<WorkerHandle>>) -> MutexGuard<'_, Vec<WorkerHandle>> {
    handles.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transition(handles: &Mutex<Vec<WorkerHandle>>, id: u32, next: WorkerState) -> bool {
    settle_state(handles, id, next, None, None)
}

fn settle_state(
    handles: &Mutex<Vec<WorkerHandle>>,
    id: u32,
    next: WorkerState,
    stop_mode: Option<StopMode>,
    failure: Option<String>,
) -> bool {
    let mut handles = lock(handles);
    let Some(handle) = handles.iter_mut().find(|h| h.id == id) else {
        return false;
    };
    if !handle.state.can_become(next) {
        return false;
    }
    handle.state = next;
    if stop_mode.is_some() {
        handle.stop_mode = stop_mode;
    }
    if failure.is_some() {
        handle.failure = failure;
    }
    true
}

/// Follows one child from spawn to exit and records how it ended.
async fn monitor(
    mut child: Child,
    id: u32,
    handles: Handles,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let mut killed = false;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim() == READY_LINE
                            && transition(&handles, id, WorkerState::Running)
                        {
                            info!(worker_id = id, "worker running");
                        }
                    }
                    _ => break,
                },
                _ = &mut kill_rx => {
                    killed = true;
                    break;
                }
            }
        }
    }

    if !killed {
        tokio::select! {
            status = child.wait() => {
                record_exit(&handles, id, status, false);
                return;
            }
            _ = &mut kill_rx => {}
        }
    }

    let _ = child.start_kill();
    let status = child.wait().await;
    record_exit(&handles, id, status, true);
}

fn record_exit(handles: &Mutex<Vec<WorkerHandle>>, id: u32, status: io::Result<ExitStatus>, forced: bool) {
    let stop_requested = lock(handles)
        .iter()
        .any(|h| h.id == id && h.state == WorkerState::StopRequested);

    let (state, mode, failure) = match status {
        Err(err) => (WorkerState::Failed, None, Some(format!("wait failed: {err}"))),
        Ok(status) if status.code() == Some(EXIT_ALLOCATION_FAILED) => (
            WorkerState::Failed,
            None,
            Some("allocation failed".to_string()),
        ),
        Ok(_) if forced => (WorkerState::Stopped, Some(StopMode::Forced), None),
        Ok(status) if status.success() || (stop_requested && died_of_sigterm(status)) => {
            (WorkerState::Stopped, Some(StopMode::Graceful), None)
        }
        Ok(status) => (WorkerState::Failed, None, Some(format!("exited with {status}"))),
    };

    if !settle_state(handles, id, state, mode, failure.clone()) {
        return;
    }
    match (state, mode) {
        (WorkerState::Failed, _) => {
            warn!(worker_id = id, reason = failure.as_deref().unwrap_or(""), "worker failed")
        }
        (_, Some(StopMode::Forced)) => info!(worker_id = id, graceful = false, "worker stopped"),
        _ => info!(worker_id = id, graceful = true, "worker stopped"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::workload::WorkloadRequest;

    /// Launches shell snippets instead of real workers.
    struct ScriptLauncher {
        cpu: &'static str,
        memory: &'static str,
    }

    impl WorkerLauncher for ScriptLauncher {
        fn command(&self, _id: u32, kind: WorkerKind, _spec: &WorkloadSpec) -> Command {
            let script = match kind {
                WorkerKind::Cpu => self.cpu,
                WorkerKind::Memory => self.memory,
            };
            if script.starts_with('/') {
                return Command::new(script);
            }
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            cmd
        }
    }

    const COOPERATIVE: &str = "echo ready; exec sleep 30";
    const STUBBORN: &str = "trap '' TERM; echo ready; while :; do sleep 0.05; done";
    const CRASH_ON_TERM: &str = "trap 'exit 7' TERM; echo ready; while :; do sleep 0.05; done";
    const ALLOC_FAIL: &str = "exit 3";
    const MISSING: &str = "/nonexistent/stress-worker";

    fn spec(cores: usize, memory_workers: usize) -> WorkloadSpec {
        WorkloadSpec::validate(
            WorkloadRequest {
                cores,
                duration_secs: 5,
                intensity: 1,
                memory_workers,
                memory_mb_per_worker: 1,
            },
            4,
        )
        .unwrap()
    }

    async fn wait_until(supervisor: &WorkerSupervisor, pred: impl Fn(&[WorkerHandle]) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred(&supervisor.live_handles()) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn state_machine_only_moves_forward() {
        use WorkerState::*;
        assert!(Starting.can_become(Running));
        assert!(Running.can_become(Failed));
        assert!(StopRequested.can_become(Stopped));
        assert!(!Stopped.can_become(Running));
        assert!(!Failed.can_become(Stopped));
        assert!(!StopRequested.can_become(Running));
    }

    #[tokio::test]
    async fn start_returns_one_handle_per_worker() {
        let supervisor = WorkerSupervisor::new(ScriptLauncher {
            cpu: COOPERATIVE,
            memory: COOPERATIVE,
        });
        let handles = supervisor.start(&spec(2, 1)).await.unwrap();
        assert_eq!(handles.len(), 3);
        assert!(handles
            .iter()
            .all(|h| matches!(h.state, WorkerState::Starting | WorkerState::Running)));
        assert_eq!(handles.iter().filter(|h| h.kind == WorkerKind::Memory).count(), 1);

        wait_until(&supervisor, |h| WorkerCensus::of(h, None).running == 3).await;
        let report = supervisor.stop_all(GRACE_PERIOD).await;
        assert_eq!(report.graceful, 3);
        assert_eq!(report.forced, 0);
        assert!(supervisor.live_handles().iter().all(|h| h.state == WorkerState::Stopped));
    }

    #[tokio::test]
    async fn stubborn_workers_are_killed_after_grace() {
        let supervisor = WorkerSupervisor::new(ScriptLauncher {
            cpu: STUBBORN,
            memory: COOPERATIVE,
        });
        supervisor.start(&spec(1, 0)).await.unwrap();
        wait_until(&supervisor, |h| WorkerCensus::of(h, None).running == 1).await;

        let started = Instant::now();
        let report = supervisor.stop_all(Duration::from_millis(200)).await;
        assert_eq!(report.forced, 1);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(supervisor.live_handles().iter().all(|h| !h.state.is_live()));
    }

    #[tokio::test]
    async fn stop_all_is_idempotent() {
        let supervisor = WorkerSupervisor::new(ScriptLauncher {
            cpu: COOPERATIVE,
            memory: COOPERATIVE,
        });
        supervisor.start(&spec(1, 0)).await.unwrap();
        let first = supervisor.stop_all(GRACE_PERIOD).await;
        let second = supervisor.stop_all(GRACE_PERIOD).await;
        assert_eq!(first, second);
        assert!(supervisor.start(&spec(1, 0)).await.is_err());
    }

    #[tokio::test]
    async fn spawn_failure_rolls_back_started_workers() {
        let supervisor = WorkerSupervisor::new(ScriptLauncher {
            cpu: COOPERATIVE,
            memory: MISSING,
        });
        let err = supervisor.start(&spec(2, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            StressError::Spawn { id: 2, kind: WorkerKind::Memory, .. }
        ));

        let handles = supervisor.live_handles();
        assert_eq!(handles.len(), 2);
        assert!(handles.iter().all(|h| h.state == WorkerState::Stopped));
    }

    #[tokio::test]
    async fn allocation_failure_is_contained() {
        let supervisor = WorkerSupervisor::new(ScriptLauncher {
            cpu: COOPERATIVE,
            memory: ALLOC_FAIL,
        });
        let spec = spec(1, 2);
        supervisor.start(&spec).await.unwrap();
        wait_until(&supervisor, |h| WorkerCensus::of(h, Some(WorkerKind::Memory)).failed == 2).await;

        assert_eq!(supervisor.exhausted_kind(&spec), Some(WorkerKind::Memory));
        let cpu = WorkerCensus::of(&supervisor.live_handles(), Some(WorkerKind::Cpu));
        assert_eq!(cpu.live(), 1);

        let report = supervisor.stop_all(GRACE_PERIOD).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.graceful, 1);
    }

    #[tokio::test]
    async fn error_exit_after_stop_request_is_a_failure() {
        let supervisor = WorkerSupervisor::new(ScriptLauncher {
            cpu: CRASH_ON_TERM,
            memory: COOPERATIVE,
        });
        supervisor.start(&spec(1, 1)).await.unwrap();
        wait_until(&supervisor, |h| WorkerCensus::of(h, None).running == 2).await;

        let report = supervisor.stop_all(GRACE_PERIOD).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.graceful, 1);
        let handles = supervisor.live_handles();
        let cpu = handles.iter().find(|h| h.kind == WorkerKind::Cpu).unwrap();
        assert_eq!(cpu.state, WorkerState::Failed);
        assert_eq!(cpu.stop_mode, None);
        assert!(cpu.failure.as_deref().unwrap().contains('7'));
        let memory = handles.iter().find(|h| h.kind == WorkerKind::Memory).unwrap();
        assert_eq!(memory.stop_mode, Some(StopMode::Graceful));
    }

    #[test]
    fn census_counts_by_kind() {
        let handle = |id, kind, state| WorkerHandle {
            id,
            kind,
            state,
            started_at: Utc::now(),
            pid: None,
            stop_mode: None,
            failure: None,
        };
        let handles = vec![
            handle(0, WorkerKind::Cpu, WorkerState::Running),
            handle(1, WorkerKind::Cpu, WorkerState::Stopped),
            handle(2, WorkerKind::Memory, WorkerState::Failed),
        ];
        let cpu = WorkerCensus::of(&handles, Some(WorkerKind::Cpu));
        assert_eq!((cpu.running, cpu.stopped, cpu.failed), (1, 1, 0));
        assert_eq!(WorkerCensus::of(&handles, None).live(), 1);
    }
}
