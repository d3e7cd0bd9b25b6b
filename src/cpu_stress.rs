use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

/// Arithmetic steps between two stop-flag checks.
pub const BASE_ITERATIONS: u64 = 200_000;

/// Pause after each cycle. Longer cycles (higher intensity) spend a larger
/// share of wall time computing.
pub const CYCLE_REST: Duration = Duration::from_millis(1);

/// Burn one core until `stop` is raised or `deadline` passes.
/// Returns the number of completed cycles.
pub fn stress_cpu(intensity: u32, stop: &AtomicBool, deadline: Option<Instant>) -> u64 {
    let intensity = u64::from(intensity.max(1));
    let mut rng = rand::rng();
    let mut x = 1.0f64;
    let mut cycles = 0u64;

    'run: loop {
        for _ in 0..intensity {
            if should_stop(stop, deadline) {
                break 'run;
            }
            x = burn_chunk(x);
        }
        // keep the accumulator from settling into a constant
        x += rng.random::<f64>() * 0.001;
        cycles += 1;
        thread::sleep(CYCLE_REST);
    }

    black_box(x);
    cycles
}

fn burn_chunk(mut x: f64) -> f64 {
    for _ in 0..BASE_ITERATIONS {
        x = black_box(x * 1.000001);
        x /= 1.000001;
    }
    x
}

fn should_stop(stop: &AtomicBool, deadline: Option<Instant>) -> bool {
    stop.load(Ordering::SeqCst) || deadline.is_some_and(|d| Instant::now() >= d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn returns_promptly_when_already_stopped() {
        let stop = AtomicBool::new(true);
        let start = Instant::now();
        assert_eq!(stress_cpu(1000, &stop, None), 0);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn stops_at_deadline() {
        let stop = AtomicBool::new(false);
        let start = Instant::now();
        let cycles = stress_cpu(1, &stop, Some(start + Duration::from_millis(100)));
        assert!(cycles > 0);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn observes_stop_flag_within_a_bounded_interval_at_high_intensity() {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || stress_cpu(10_000, &flag, None));

        thread::sleep(Duration::from_millis(50));
        let requested = Instant::now();
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(requested.elapsed() < Duration::from_millis(250));
    }
}
