use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};

use rand::Rng;
use sysinfo::System;

use crate::config::{CANCEL_CHECK_INTERVAL, MEMORY_TOUCH_INTERVAL, MIB};
use crate::error::StressError;

const PAGE_SIZE: usize = 4096;

/// Pages written between two stop-flag checks during a touch pass (64 MiB).
const PAGES_PER_CHECK: usize = 16 * 1024;

/// Allocate `size_mb` MiB and keep it resident until `stop` is raised or
/// `deadline` passes. `on_ready` runs once the buffer is committed and the
/// first touch pass is done. Returns the number of completed touch passes.
pub fn stress_memory(
    size_mb: u64,
    stop: &AtomicBool,
    deadline: Option<Instant>,
    on_ready: impl FnOnce(),
) -> Result<u64, StressError> {
    let mut memory_block = allocate(size_mb)?;
    let mut on_ready = Some(on_ready);
    let mut rng = rand::rng();
    let mut passes = 0u64;

    while !should_stop(stop, deadline) {
        let seed: u8 = rng.random();
        if !touch(&mut memory_block, seed, stop) {
            break;
        }
        passes += 1;
        black_box(checksum(&memory_block));
        if let Some(ready) = on_ready.take() {
            ready();
        }
        rest(MEMORY_TOUCH_INTERVAL, stop, deadline);
    }

    drop(memory_block);
    Ok(passes)
}

/// Reserve and commit the whole buffer, or fail without touching anything.
fn allocate(size_mb: u64) -> Result<Vec<u8>, StressError> {
    let too_big = || StressError::Allocation { size_mb };
    let bytes = size_mb
        .checked_mul(MIB)
        .and_then(|b| usize::try_from(b).ok())
        .ok_or_else(too_big)?;

    if bytes as u64 > available_bytes() {
        return Err(too_big());
    }

    let mut memory_block = Vec::new();
    memory_block.try_reserve_exact(bytes).map_err(|_| too_big())?;
    memory_block.resize(bytes, 0u8);
    Ok(memory_block)
}

/// Physical memory plus swap the OS could still hand out.
pub fn available_bytes() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory().saturating_add(sys.free_swap())
}

/// Write one byte per page. Returns false if interrupted by `stop`.
fn touch(memory_block: &mut [u8], seed: u8, stop: &AtomicBool) -> bool {
    for (i, page) in memory_block.chunks_mut(PAGE_SIZE).enumerate() {
        if i % PAGES_PER_CHECK == 0 && stop.load(Ordering::SeqCst) {
            return false;
        }
        page[0] = seed.wrapping_add(i as u8);
    }
    true
}

fn checksum(memory_block: &[u8]) -> u64 {
    memory_block
        .iter()
        .step_by(PAGE_SIZE)
        .fold(0u64, |acc, b| acc.wrapping_add(u64::from(*b)))
}

fn rest(total: Duration, stop: &AtomicBool, deadline: Option<Instant>) {
    let until = Instant::now() + total;
    while Instant::now() < until && !should_stop(stop, deadline) {
        sleep(CANCEL_CHECK_INTERVAL.min(until.saturating_duration_since(Instant::now())));
    }
}

fn should_stop(stop: &AtomicBool, deadline: Option<Instant>) -> bool {
    stop.load(Ordering::SeqCst) || deadline.is_some_and(|d| Instant::now() >= d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn touches_until_deadline() {
        let stop = AtomicBool::new(false);
        let mut ready = false;
        let passes = stress_memory(
            4,
            &stop,
            Some(Instant::now() + Duration::from_millis(250)),
            || ready = true,
        )
        .unwrap();
        assert!(ready);
        assert!(passes >= 1);
    }

    #[test]
    fn unsatisfiable_request_fails_before_ready() {
        let stop = AtomicBool::new(false);
        let mut ready = false;
        let err = stress_memory(u64::MAX / MIB, &stop, None, || ready = true).unwrap_err();
        assert!(matches!(err, StressError::Allocation { .. }));
        assert!(!ready);
    }

    #[test]
    fn ready_follows_the_first_touch_pass() {
        let stop = AtomicBool::new(false);
        let passes = stress_memory(4, &stop, None, || stop.store(true, Ordering::SeqCst)).unwrap();
        assert_eq!(passes, 1);

        let mut ready = false;
        let passes = stress_memory(4, &stop, None, || ready = true).unwrap();
        assert_eq!(passes, 0);
        assert!(!ready);
    }

    #[test]
    fn stop_flag_releases_the_buffer_promptly() {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || stress_memory(8, &flag, None, || {}));

        thread::sleep(Duration::from_millis(150));
        let requested = Instant::now();
        stop.store(true, Ordering::SeqCst);
        assert!(handle.join().unwrap().is_ok());
        assert!(requested.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn touch_writes_every_page() {
        let mut block = vec![0u8; PAGE_SIZE * 3];
        let stop = AtomicBool::new(false);
        assert!(touch(&mut block, 7, &stop));
        assert_eq!(block[0], 7);
        assert_eq!(block[PAGE_SIZE], 8);
        assert_eq!(block[PAGE_SIZE * 2], 9);
        assert_eq!(checksum(&block), 24);
    }
}
