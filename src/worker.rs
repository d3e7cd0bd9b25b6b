//! Entry point of a worker process. The controlling process re-executes its
//! own binary with the hidden `worker` subcommand; everything here runs in the
//! child and never logs.

use std::io::{self, Write};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use crate::cpu_stress::stress_cpu;
use crate::error::StressError;
use crate::memory_stress::stress_memory;
use crate::supervisor::{EXIT_ALLOCATION_FAILED, READY_LINE};

/// Raised by SIGTERM/SIGINT. A signal handler can only reach a static.
static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerJob {
    Cpu { intensity: u32 },
    Memory { size_mb: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerArgs {
    pub id: u32,
    pub parent: Option<u32>,
    pub deadline_secs: Option<u64>,
    pub job: WorkerJob,
}

/// Run one worker to completion and return its process exit code.
pub fn run(args: WorkerArgs) -> i32 {
    install_stop_handlers();
    if orphaned(args.parent) {
        return 0;
    }

    let deadline = args
        .deadline_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    let result = match args.job {
        WorkerJob::Cpu { intensity } => {
            announce_ready();
            stress_cpu(intensity, &STOP, deadline);
            Ok(())
        }
        WorkerJob::Memory { size_mb } => {
            stress_memory(size_mb, &STOP, deadline, announce_ready).map(|_| ())
        }
    };
    exit_code(&result)
}

pub fn exit_code(result: &Result<(), StressError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(StressError::Allocation { .. }) => EXIT_ALLOCATION_FAILED,
        Err(_) => 1,
    }
}

fn announce_ready() {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{READY_LINE}");
    let _ = stdout.flush();
}

#[cfg(unix)]
extern "C" fn on_stop_signal(_sig: libc::c_int) {
    STOP.store(true, std::sync::atomic::Ordering::SeqCst);
}

#[cfg(unix)]
fn install_stop_handlers() {
    let handler = on_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
    }
    stop_with_parent();
}

#[cfg(target_os = "linux")]
fn stop_with_parent() {
    // SAFETY: PR_SET_PDEATHSIG takes a signal number and touches no memory.
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn stop_with_parent() {}

#[cfg(not(unix))]
fn install_stop_handlers() {}

/// True if the process that spawned us is already gone.
#[cfg(unix)]
fn orphaned(parent: Option<u32>) -> bool {
    // SAFETY: getppid cannot fail and has no preconditions.
    let actual = unsafe { libc::getppid() };
    parent.is_some_and(|expected| u32::try_from(actual).ok() != Some(expected))
}

#[cfg(not(unix))]
fn orphaned(_parent: Option<u32>) -> bool {
    false
}
