use std::io::{self, Write};
use std::sync::Arc;

use crate::config::DisplayMode;
use crate::sampler::{HostInfo, MetricSnapshot, SnapshotStream};
use crate::shutdown::{RunSummary, ShutdownCause};
use crate::supervisor::{WorkerCensus, WorkerHandle, WorkerSupervisor};
use crate::workload::WorkloadSpec;

const BAR_CELLS: usize = 20;
const RULE_WIDTH: usize = 60;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Render snapshots as they arrive until the sampler stops.
pub async fn drive(
    mode: DisplayMode,
    spec: WorkloadSpec,
    mut snapshots: SnapshotStream,
    supervisor: Arc<WorkerSupervisor>,
) {
    while let Some(snapshot) = snapshots.next().await {
        let handles = supervisor.live_handles();
        let mut out = io::stdout().lock();
        let rendered = match mode {
            DisplayMode::Dashboard => render_dashboard(&mut out, &spec, &snapshot, &handles),
            DisplayMode::Legacy => render_legacy(&mut out, &snapshot),
            DisplayMode::Quiet => Ok(()),
        };
        if rendered.and_then(|_| out.flush()).is_err() {
            break;
        }
    }
}

/// `█` for every 5%, `░` for the rest.
pub fn bar(percent: f64) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 5.0) as usize).min(BAR_CELLS);
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_CELLS - filled))
}

pub fn render_dashboard(
    out: &mut impl Write,
    spec: &WorkloadSpec,
    snapshot: &MetricSnapshot,
    handles: &[WorkerHandle],
) -> io::Result<()> {
    let heavy = "=".repeat(RULE_WIDTH);
    let light = "-".repeat(RULE_WIDTH);

    // clear screen, cursor home
    write!(out, "\x1B[2J\x1B[H")?;
    writeln!(out, "{heavy}")?;
    writeln!(out, "CPU & MEMORY STRESS TESTER DASHBOARD")?;
    writeln!(out, "{heavy}")?;
    writeln!(out, "Elapsed Time: {:.1}s", snapshot.elapsed.as_secs_f64())?;
    writeln!(out, "CPU Cores Stressed: {}", spec.cores())?;
    let memory_mb = if spec.memory_workers() > 0 {
        spec.memory_mb_per_worker()
    } else {
        0
    };
    writeln!(out, "Memory Stress Size: {memory_mb}MB per process")?;
    writeln!(out, "Intensity Level: {}", spec.intensity())?;
    writeln!(out, "{light}")?;

    writeln!(out, "Overall CPU Usage: {:.1}%", snapshot.overall_cpu_percent)?;
    writeln!(out, "Per-Core Usage:")?;
    for (i, usage) in snapshot.per_core_percent.iter().enumerate() {
        let usage = f64::from(*usage);
        writeln!(out, "   Core {i:2}: [{}] {usage:5.1}%", bar(usage))?;
    }
    writeln!(out, "{light}")?;

    let memory_percent = snapshot.memory_percent();
    writeln!(out, "Memory Usage: {memory_percent:.1}%")?;
    writeln!(
        out,
        "Used: {:.2}GB / {:.2}GB",
        snapshot.memory_used_bytes as f64 / GIB,
        snapshot.memory_total_bytes as f64 / GIB
    )?;
    writeln!(out, "   Memory: [{}] {memory_percent:.1}%", bar(memory_percent))?;
    writeln!(out, "{light}")?;

    writeln!(out, "Temperature Information:")?;
    write_temperatures(out, snapshot, "   ")?;
    writeln!(out, "{light}")?;

    let census = WorkerCensus::of(handles, None);
    writeln!(
        out,
        "Workers: {} running, {} starting, {} stopping, {} stopped, {} failed",
        census.running, census.starting, census.stop_requested, census.stopped, census.failed
    )?;
    writeln!(out, "{light}")?;
    writeln!(out, "Press Ctrl+C to stop the stress test gracefully")?;
    writeln!(out, "{heavy}")
}

/// Host summary and run configuration, printed once before workers start.
pub fn render_banner(
    out: &mut impl Write,
    host: &HostInfo,
    spec: &WorkloadSpec,
    legacy: bool,
) -> io::Result<()> {
    writeln!(
        out,
        "System: {} cores ({} logical)",
        host.physical_cores, host.logical_cores
    )?;
    writeln!(
        out,
        "Memory: {:.1}GB total, {:.1}GB available",
        host.memory_total_bytes as f64 / GIB,
        host.memory_available_bytes as f64 / GIB
    )?;

    if legacy {
        return writeln!(
            out,
            "Legacy mode: Stressing {} cores for {}s at intensity {}...",
            spec.cores(),
            spec.duration().as_secs(),
            spec.intensity()
        );
    }

    writeln!(out, "Configuration:")?;
    writeln!(out, "   • CPU cores: {}", spec.cores())?;
    writeln!(out, "   • Duration: {}s", spec.duration().as_secs())?;
    writeln!(out, "   • CPU intensity: {}", spec.intensity())?;
    if spec.memory_workers() > 0 {
        writeln!(out, "   • Memory processes: {}", spec.memory_workers())?;
        writeln!(out, "   • Memory size: {}MB per process", spec.memory_mb_per_worker())?;
    }
    writeln!(out)
}

/// Closing lines once every worker is gone.
pub fn render_summary(out: &mut impl Write, summary: &RunSummary) -> io::Result<()> {
    match &summary.cause {
        ShutdownCause::DurationElapsed => writeln!(out, "\nStress test completed successfully!")?,
        ShutdownCause::Interrupted => writeln!(out, "\nTest interrupted by user")?,
        ShutdownCause::Failure(reason) => writeln!(out, "\nError during stress test: {reason}")?,
    }
    writeln!(
        out,
        "Workers: {} stopped gracefully, {} forced, {} failed",
        summary.report.graceful, summary.report.forced, summary.report.failed
    )?;
    for handle in summary.handles.iter().filter(|h| h.failure.is_some()) {
        writeln!(
            out,
            "   {} worker {}: {}",
            handle.kind,
            handle.id,
            handle.failure.as_deref().unwrap_or_default()
        )?;
    }
    Ok(())
}

/// One short block per sample, as the CPU-only mode always printed.
pub fn render_legacy(out: &mut impl Write, snapshot: &MetricSnapshot) -> io::Result<()> {
    writeln!(out, "CPU Usage: {:.1}%", snapshot.overall_cpu_percent)?;
    write_temperatures(out, snapshot, "")?;
    writeln!(out, "{}", "-".repeat(20))
}

fn write_temperatures(out: &mut impl Write, snapshot: &MetricSnapshot, indent: &str) -> io::Result<()> {
    if snapshot.sensors.is_empty() {
        return writeln!(out, "{indent}Temperature sensors not available");
    }
    for sensor in &snapshot.sensors {
        writeln!(out, "{indent}Temp ({}): {:.1}°C", sensor.label, sensor.celsius)?;
    }
    Ok(())
}
