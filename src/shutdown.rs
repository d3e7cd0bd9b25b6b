use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cancel::{CancellationSource, CancellationToken};
use crate::config::HEALTH_CHECK_INTERVAL;
use crate::error::StressError;
use crate::sampler::SamplerTask;
use crate::supervisor::{ReapReport, WorkerHandle, WorkerSupervisor};
use crate::workload::WorkloadSpec;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum ShutdownCause {
    DurationElapsed,
    Interrupted,
    Failure(String),
}

impl ShutdownCause {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DurationElapsed => write!(f, "duration elapsed"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Failure(reason) => write!(f, "failure: {reason}"),
        }
    }
}

/// init → running → shutting-down → terminated, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Init,
    Running,
    ShuttingDown,
    Terminated,
}

struct TriggerInner {
    cause: OnceCell<ShutdownCause>,
    source: CancellationSource,
}

/// Shared handle for firing the run's single cancellation. The first cause
/// to arrive is kept; later ones are ignored.
#[derive(Clone)]
pub struct ShutdownTrigger {
    inner: Arc<TriggerInner>,
}

impl ShutdownTrigger {
    fn new() -> Self {
        let (source, _) = CancellationSource::new();
        Self {
            inner: Arc::new(TriggerInner {
                cause: OnceCell::new(),
                source,
            }),
        }
    }

    /// Returns true if this call started the shutdown.
    pub fn fire(&self, cause: ShutdownCause) -> bool {
        if let Err(cause) = self.inner.cause.set(cause) {
            debug!(%cause, "shutdown already triggered, ignoring");
            return false;
        }
        if let Some(cause) = self.inner.cause.get() {
            info!(%cause, "cancellation triggered");
        }
        self.inner.source.cancel();
        true
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        self.inner.cause.get().cloned()
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.source.token()
    }

    /// Wait for the winning cause.
    pub async fn fired(&self) -> ShutdownCause {
        self.token().cancelled().await;
        self.cause()
            .unwrap_or_else(|| ShutdownCause::Failure("cancelled without a cause".into()))
    }
}

/// The sampler's own stop signal plus its task, handed to the coordinator so
/// it can stop sampling after the workers are gone.
pub struct SamplerControl {
    pub stop: CancellationSource,
    pub task: SamplerTask,
}

impl SamplerControl {
    async fn finish(self) -> u64 {
        self.stop.cancel();
        self.task.join().await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub cause: ShutdownCause,
    pub report: ReapReport,
    pub handles: Vec<WorkerHandle>,
    pub snapshots: u64,
}

impl RunSummary {
    pub fn is_fatal(&self) -> bool {
        self.cause.is_fatal()
    }
}

pub struct ShutdownCoordinator {
    trigger: ShutdownTrigger,
    state: Mutex<RunState>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            trigger: ShutdownTrigger::new(),
            state: Mutex::new(RunState::Init),
            grace,
        }
    }

    /// Handle for external trigger sources such as an interrupt listener.
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, next: RunState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if next <= *state {
            return false;
        }
        info!(from = ?*state, to = ?next, "run state changed");
        *state = next;
        true
    }

    /// Drive one run: start the workers, wait for the first trigger, then
    /// stop workers, stop the sampler and return only once both are done.
    pub async fn run(
        &self,
        spec: &WorkloadSpec,
        supervisor: &WorkerSupervisor,
        sampler: SamplerControl,
    ) -> Result<RunSummary, StressError> {
        if self.state() != RunState::Init {
            return Err(StressError::Validation("run was already started".into()));
        }

        if let Err(err) = supervisor.start(spec).await {
            self.trigger.fire(ShutdownCause::Failure(err.to_string()));
            self.advance(RunState::ShuttingDown);
            sampler.finish().await;
            self.advance(RunState::Terminated);
            return Err(err);
        }
        self.advance(RunState::Running);

        self.watch(spec, supervisor).await;
        let cause = self.trigger.fired().await;

        self.advance(RunState::ShuttingDown);
        let report = supervisor.stop_all(self.grace).await;
        if report.unresponsive > 0 {
            warn!(unresponsive = report.unresponsive, "some workers ignored the kill");
        }
        let snapshots = sampler.finish().await;
        self.advance(RunState::Terminated);

        Ok(RunSummary {
            cause,
            report,
            handles: supervisor.live_handles(),
            snapshots,
        })
    }

    /// Race the duration timer and the health check against any external
    /// trigger until one of them fires.
    async fn watch(&self, spec: &WorkloadSpec, supervisor: &WorkerSupervisor) {
        let deadline = Instant::now() + spec.duration();
        let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut token = self.trigger.token();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = sleep_until(deadline) => {
                    self.trigger.fire(ShutdownCause::DurationElapsed);
                }
                _ = health.tick() => {
                    if let Some(kind) = supervisor.exhausted_kind(spec) {
                        let err = StressError::NoRunningWorkers(kind);
                        self.trigger.fire(ShutdownCause::Failure(err.to_string()));
                    }
                }
            }
        }
    }
}
