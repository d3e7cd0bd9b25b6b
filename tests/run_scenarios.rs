//! End-to-end runs against the real worker binary.
#![cfg(unix)]

use std::time::{Duration, Instant};

use stress_tester::cancel::CancellationSource;
use stress_tester::config::{GRACE_PERIOD, MAX_MEMORY_MB_PER_WORKER};
use stress_tester::sampler::{MetricsSampler, SystemProbe};
use stress_tester::shutdown::SamplerControl;
use stress_tester::supervisor::{ExecLauncher, StopMode};
use stress_tester::{
    RunState, RunSummary, ShutdownCause, ShutdownCoordinator, WorkerKind, WorkerState,
    WorkerSupervisor, WorkloadRequest, WorkloadSpec,
};

const BINARY: &str = env!("CARGO_BIN_EXE_stress-tester");

fn spec(cores: usize, duration_secs: u64, memory_workers: usize, memory_mb: u64) -> WorkloadSpec {
    WorkloadSpec::from_request(WorkloadRequest {
        cores,
        duration_secs,
        intensity: 1,
        memory_workers,
        memory_mb_per_worker: memory_mb,
    })
    .unwrap()
}

fn sampler() -> SamplerControl {
    let (stop, token) = CancellationSource::new();
    let (_snapshots, task) =
        MetricsSampler::start(SystemProbe::new(), Duration::from_millis(200), token);
    SamplerControl { stop, task }
}

async fn run(spec: &WorkloadSpec, coordinator: &ShutdownCoordinator) -> RunSummary {
    let supervisor = WorkerSupervisor::new(ExecLauncher::new(BINARY));
    let summary = coordinator.run(spec, &supervisor, sampler()).await.unwrap();
    assert_eq!(coordinator.state(), RunState::Terminated);
    assert!(supervisor.live_handles().iter().all(|h| h.state.is_terminal()));
    summary
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cpu_run_finishes_on_duration() {
    let spec = spec(2, 1, 0, 0);
    let coordinator = ShutdownCoordinator::new(GRACE_PERIOD);
    let started = Instant::now();

    let summary = run(&spec, &coordinator).await;

    assert_eq!(summary.cause, ShutdownCause::DurationElapsed);
    assert!(!summary.is_fatal());
    assert_eq!(summary.handles.len(), 2);
    assert!(summary
        .handles
        .iter()
        .all(|h| h.kind == WorkerKind::Cpu && h.state == WorkerState::Stopped));
    assert_eq!(summary.report.failed, 0);
    assert!(summary.snapshots >= 1);
    assert!(started.elapsed() < Duration::from_secs(1) + GRACE_PERIOD * 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_workers_hold_their_buffers_until_stopped() {
    let spec = spec(1, 1, 2, 16);
    let coordinator = ShutdownCoordinator::new(GRACE_PERIOD);

    let summary = run(&spec, &coordinator).await;

    assert_eq!(summary.cause, ShutdownCause::DurationElapsed);
    assert_eq!(summary.handles.len(), 3);
    let memory: Vec<_> = summary
        .handles
        .iter()
        .filter(|h| h.kind == WorkerKind::Memory)
        .collect();
    assert_eq!(memory.len(), 2);
    assert!(memory
        .iter()
        .all(|h| h.state == WorkerState::Stopped && h.stop_mode == Some(StopMode::Graceful)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_ends_the_run_early() {
    let spec = spec(2, 30, 0, 0);
    let coordinator = ShutdownCoordinator::new(GRACE_PERIOD);
    let trigger = coordinator.trigger();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.fire(ShutdownCause::Interrupted);
    });
    let started = Instant::now();

    let summary = run(&spec, &coordinator).await;

    assert_eq!(summary.cause, ShutdownCause::Interrupted);
    assert!(!summary.is_fatal());
    assert!(summary.handles.iter().all(|h| h.state == WorkerState::Stopped));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[cfg(target_pointer_width = "64")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsatisfiable_memory_fails_the_run() {
    let spec = spec(1, 30, 2, MAX_MEMORY_MB_PER_WORKER);
    let coordinator = ShutdownCoordinator::new(GRACE_PERIOD);
    let started = Instant::now();

    let summary = run(&spec, &coordinator).await;

    assert!(summary.is_fatal(), "cause was {}", summary.cause);
    let memory: Vec<_> = summary
        .handles
        .iter()
        .filter(|h| h.kind == WorkerKind::Memory)
        .collect();
    assert_eq!(memory.len(), 2);
    assert!(memory.iter().all(|h| h.state == WorkerState::Failed));
    assert!(memory
        .iter()
        .all(|h| h.failure.as_deref() == Some("allocation failed")));
    let cpu = summary
        .handles
        .iter()
        .find(|h| h.kind == WorkerKind::Cpu)
        .unwrap();
    assert_eq!(cpu.state, WorkerState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(10));
}
