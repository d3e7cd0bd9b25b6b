use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Components, System};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::SNAPSHOT_BUFFER;
use crate::error::StressError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub label: String,
    pub celsius: f32,
}

/// One immutable reading of host telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Time since the sampler started.
    pub elapsed: Duration,
    pub overall_cpu_percent: f32,
    pub per_core_percent: Vec<f32>,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    /// Hottest sensor, if any sensor could be read.
    pub temperature_celsius: Option<f32>,
    pub sensors: Vec<SensorReading>,
}

impl MetricSnapshot {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            0.0
        } else {
            self.memory_used_bytes as f64 / self.memory_total_bytes as f64 * 100.0
        }
    }
}

/// Raw values read from the OS, before the sampler stamps them.
#[derive(Debug)]
pub struct Reading {
    pub per_core_percent: Vec<f32>,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub sensors: Result<Vec<SensorReading>, StressError>,
}

impl Default for Reading {
    fn default() -> Self {
        Self {
            per_core_percent: Vec::new(),
            memory_used_bytes: 0,
            memory_total_bytes: 0,
            sensors: Err(StressError::SensorUnavailable),
        }
    }
}

/// Where readings come from. Must only look at the OS, never at workers.
/// `read` may block; the sampler calls it off the async workers.
pub trait Probe: Send + 'static {
    fn read(&mut self) -> Reading;
}

/// `sysinfo`-backed probe.
pub struct SystemProbe {
    sys: System,
    components: Components,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        // first CPU refresh only sets the baseline for usage deltas
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self {
            sys,
            components: Components::new_with_refreshed_list(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for SystemProbe {
    fn read(&mut self) -> Reading {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        Reading {
            per_core_percent: self.sys.cpus().iter().map(|cpu| cpu.cpu_usage()).collect(),
            memory_used_bytes: self.sys.used_memory(),
            memory_total_bytes: self.sys.total_memory(),
            sensors: read_temperatures(&mut self.components),
        }
    }
}

/// Refresh the known sensors and keep those reporting a usable temperature.
pub fn read_temperatures(components: &mut Components) -> Result<Vec<SensorReading>, StressError> {
    for component in components.list_mut() {
        component.refresh();
    }
    let readings: Vec<SensorReading> = components
        .list()
        .iter()
        .filter_map(|c| {
            c.temperature()
                .filter(|t| t.is_finite() && *t > 0.0)
                .map(|celsius| SensorReading {
                    label: c.label().to_string(),
                    celsius,
                })
        })
        .collect();
    if readings.is_empty() {
        Err(StressError::SensorUnavailable)
    } else {
        Ok(readings)
    }
}

/// Lazy, time-ordered sequence of snapshots. Ends after the sampler stops.
/// A reader that falls more than the buffer behind loses the oldest entries.
pub struct SnapshotStream {
    rx: broadcast::Receiver<MetricSnapshot>,
    dropped: u64,
}

impl SnapshotStream {
    pub async fn next(&mut self) -> Option<MetricSnapshot> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(RecvError::Lagged(n)) => self.dropped += n,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Snapshots skipped because this reader fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// An independent reader starting at the next snapshot.
    pub fn resubscribe(&self) -> Self {
        Self {
            rx: self.rx.resubscribe(),
            dropped: 0,
        }
    }
}

/// Join handle of a running sampler.
pub struct SamplerTask {
    join: JoinHandle<u64>,
}

impl SamplerTask {
    /// Wait for the sampling loop to finish; returns how many snapshots it made.
    pub async fn join(self) -> u64 {
        match self.join.await {
            Ok(produced) => produced,
            Err(err) => {
                warn!(%err, "sampler task ended abnormally");
                0
            }
        }
    }
}

pub struct MetricsSampler;

impl MetricsSampler {
    /// Start polling `probe` every `interval` until `token` is cancelled.
    pub fn start<P: Probe>(
        probe: P,
        interval: Duration,
        token: CancellationToken,
    ) -> (SnapshotStream, SamplerTask) {
        let (tx, rx) = broadcast::channel(SNAPSHOT_BUFFER);
        let join = tokio::spawn(sample_loop(probe, interval, token, tx));
        (SnapshotStream { rx, dropped: 0 }, SamplerTask { join })
    }
}

async fn sample_loop<P: Probe>(
    mut probe: P,
    interval: Duration,
    mut token: CancellationToken,
    tx: broadcast::Sender<MetricSnapshot>,
) -> u64 {
    let started = Instant::now();
    let mut ticker = tokio::time::interval_at(started + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<DateTime<Utc>> = None;
    let mut produced = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let read = tokio::task::spawn_blocking(move || {
            let reading = probe.read();
            (probe, reading)
        });
        let reading = match read.await {
            Ok((returned, reading)) => {
                probe = returned;
                reading
            }
            Err(err) => {
                warn!(%err, "probe failed, sampler stopping");
                break;
            }
        };

        let snapshot = stamp(reading, started.elapsed(), &mut last);
        if let Ok(json) = serde_json::to_string(&snapshot) {
            debug!(snapshot = %json, "snapshot produced");
        }
        produced += 1;
        // no receivers is fine, the snapshot just goes nowhere
        let _ = tx.send(snapshot);
    }

    info!(produced, "sampler stopped");
    produced
}

fn stamp(reading: Reading, elapsed: Duration, last: &mut Option<DateTime<Utc>>) -> MetricSnapshot {
    let now = Utc::now();
    let timestamp = match *last {
        Some(prev) if prev > now => prev,
        _ => now,
    };
    *last = Some(timestamp);

    let overall_cpu_percent = if reading.per_core_percent.is_empty() {
        0.0
    } else {
        reading.per_core_percent.iter().sum::<f32>() / reading.per_core_percent.len() as f32
    };
    let sensors = reading.sensors.unwrap_or_default();
    let temperature_celsius = sensors.iter().map(|s| s.celsius).reduce(f32::max);

    MetricSnapshot {
        timestamp,
        elapsed,
        overall_cpu_percent,
        per_core_percent: reading.per_core_percent,
        memory_used_bytes: reading.memory_used_bytes,
        memory_total_bytes: reading.memory_total_bytes,
        temperature_celsius,
        sensors,
    }
}

/// Static facts about the host, printed before a run.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub physical_cores: usize,
    pub logical_cores: usize,
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
}

impl HostInfo {
    pub fn probe() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            physical_cores: num_cpus::get_physical(),
            logical_cores: num_cpus::get(),
            memory_total_bytes: sys.total_memory(),
            memory_available_bytes: sys.available_memory(),
        }
    }
}
