use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use stress_tester::cancel::CancellationSource;
use stress_tester::cli::{Cli, Command};
use stress_tester::config::{DisplayMode, GRACE_PERIOD};
use stress_tester::dashboard;
use stress_tester::logging;
use stress_tester::sampler::{HostInfo, MetricsSampler, SystemProbe};
use stress_tester::shutdown::{SamplerControl, ShutdownTrigger};
use stress_tester::supervisor::ExecLauncher;
use stress_tester::{
    worker, RunSummary, ShutdownCause, ShutdownCoordinator, WorkerSupervisor, WorkloadSpec,
};

const EXIT_FATAL: u8 = 1;
const EXIT_INVALID_ARGUMENT: u8 = 2;

fn main() -> ExitCode {
    let mut cli = Cli::parse();

    if let Some(Command::Worker { job }) = cli.command.take() {
        let code = worker::run(job.into_args());
        return ExitCode::from(u8::try_from(code).unwrap_or(EXIT_FATAL));
    }

    let mut spec = match WorkloadSpec::from_request(cli.workload_request()) {
        Ok(spec) => spec,
        Err(err) => {
            eprintln!("❌ Invalid argument: {err}");
            return ExitCode::from(EXIT_INVALID_ARGUMENT);
        }
    };
    if cli.cpu_only {
        spec = spec.cpu_only();
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("❌ Failed to start the async runtime: {err}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match runtime.block_on(run(cli, spec)) {
        Ok(summary) if !summary.is_fatal() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(EXIT_FATAL),
        Err(err) => {
            error!("stress test aborted: {err:#}");
            eprintln!("\n❌ Error during stress test: {err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli, spec: WorkloadSpec) -> anyhow::Result<RunSummary> {
    let config = cli.run_config();
    let (log_path, run_id) =
        logging::init(&config.log_dir, config.verbose).context("could not create the log file")?;

    let host = HostInfo::probe();
    let legacy = config.display == DisplayMode::Legacy;
    dashboard::render_banner(&mut io::stdout(), &host, &spec, legacy)?;
    for warning in spec.warnings(host.logical_cores) {
        println!("⚠️  Warning: {warning}");
        warn!(%warning, "workload warning");
    }
    let workload = serde_json::to_string(&spec)?;
    info!(%run_id, %workload, "starting stress test");

    let launcher = ExecLauncher::current_exe().context("cannot locate the worker executable")?;
    let supervisor = Arc::new(WorkerSupervisor::new(launcher));
    let coordinator = ShutdownCoordinator::new(GRACE_PERIOD);
    listen_for_interrupts(coordinator.trigger());

    let (sampler_stop, sampler_token) = CancellationSource::new();
    let (snapshots, sampler_task) =
        MetricsSampler::start(SystemProbe::new(), config.sample_interval, sampler_token);
    let display = tokio::spawn(dashboard::drive(
        config.display,
        spec,
        snapshots,
        Arc::clone(&supervisor),
    ));

    let outcome = coordinator
        .run(
            &spec,
            &supervisor,
            SamplerControl {
                stop: sampler_stop,
                task: sampler_task,
            },
        )
        .await;
    if let Err(err) = display.await {
        warn!(%err, "dashboard task ended abnormally");
    }
    let summary = outcome?;

    dashboard::render_summary(&mut io::stdout(), &summary)?;
    println!("Log written to {}", log_path.display());
    let report = serde_json::to_string(&summary)?;
    info!(cause = %summary.cause, summary = %report, "stress test finished");
    Ok(summary)
}

/// Ctrl+C (and SIGTERM on unix) fire the run's single shutdown trigger.
fn listen_for_interrupts(trigger: ShutdownTrigger) {
    let on_ctrl_c = trigger.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if on_ctrl_c.fire(ShutdownCause::Interrupted) {
                println!("\n🛑 Interrupt received. Shutting down gracefully...");
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                warn!(%err, "cannot listen for SIGTERM");
                return;
            }
        };
        while terminate.recv().await.is_some() {
            trigger.fire(ShutdownCause::Interrupted);
        }
    });
    #[cfg(not(unix))]
    drop(trigger);
}
