use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use tracing::{info, Level};
use uuid::Uuid;

use crate::error::StressError;

/// `stress_test_YYYYmmdd_HHMMSS.log`
pub fn log_file_name(started: DateTime<Local>) -> String {
    format!("stress_test_{}.log", started.format("%Y%m%d_%H%M%S"))
}

/// Send all tracing output of this process to a fresh per-run file.
/// Returns the file's path and the run id written as its first line.
pub fn init(log_dir: &Path, verbose: bool) -> Result<(PathBuf, Uuid), StressError> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(log_file_name(Local::now()));
    let file = File::create(&path)?;

    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .with_max_level(level)
        .try_init()
        .map_err(|err| StressError::Io(std::io::Error::other(err.to_string())))?;

    let run_id = Uuid::new_v4();
    info!(%run_id, log_file = %path.display(), "log file created");
    Ok((path, run_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_carries_the_start_time() {
        let started = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(log_file_name(started), "stress_test_20240309_070501.log");
    }
}
