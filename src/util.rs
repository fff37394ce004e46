use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use walkdir::WalkDir;

/// Check whether an optional cancellation flag has been raised.
#[must_use]
pub fn cancel_requested(cancel: &Option<Arc<AtomicBool>>) -> bool {
    cancel
        .as_ref()
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Render a human-friendly transfer speed string.
#[must_use]
pub fn format_speed(bytes_per_sec: f32) -> String {
    const KIB: f32 = 1024.0;
    const MIB: f32 = KIB * 1024.0;

    if bytes_per_sec < KIB {
        format!("{bytes_per_sec:.0} B/s")
    } else if bytes_per_sec < MIB {
        format!("{:.1} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / MIB)
    }
}

/// Compute download progress as a fraction in `0..=1`.
#[must_use]
pub fn progress_fraction(downloaded: u64, total: Option<u64>) -> f32 {
    match total {
        Some(total) if total > 0 => (downloaded as f32 / total as f32).min(1.0),
        _ => 0.0,
    }
}

/// Default minimum change between two reported extraction progress values.
pub const REPORTED_PROGRESS_BUFFER: f32 = 0.01;

/// Drops progress values that are too close to the last reported one.
///
/// `0` and `1` always pass so listeners see the start and the end.
#[derive(Clone, Debug)]
pub struct ProgressThrottle {
    buffer: f32,
    last: Option<f32>,
}

impl ProgressThrottle {
    pub fn new(buffer: f32) -> Self {
        Self { buffer, last: None }
    }

    pub fn should_report(&mut self, progress: f32) -> bool {
        let edge = progress <= 0.0 || progress >= 1.0;
        if !edge
            && let Some(last) = self.last
            && (progress - last).abs() < self.buffer
        {
            return false;
        }
        self.last = Some(progress);
        true
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(REPORTED_PROGRESS_BUFFER)
    }
}

/// Recursively copy `from` into `to`.
pub fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Move a directory, copying and deleting when a rename is not possible.
pub fn move_dir(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Rename fails across devices.
    debug!("move: copying {} to {}", from.display(), to.display());
    copy_dir(from, to)?;
    fs::remove_dir_all(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn formats_speed_human_readable() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(2_048.0), "2.0 KB/s");
        assert_eq!(format_speed(5_242_880.0), "5.0 MB/s");
    }

    #[test]
    fn calculates_progress_fraction() {
        assert_eq!(progress_fraction(0, Some(10)), 0.0);
        assert_eq!(progress_fraction(5, Some(10)), 0.5);
        assert_eq!(progress_fraction(10, Some(10)), 1.0);
        assert_eq!(progress_fraction(5, None), 0.0);
    }

    #[test]
    fn respects_optional_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!cancel_requested(&Some(flag.clone())));
        flag.store(true, Ordering::SeqCst);
        assert!(cancel_requested(&Some(flag)));
        assert!(!cancel_requested(&None));
    }

    #[test]
    fn throttles_small_progress_steps() {
        let mut throttle = ProgressThrottle::new(0.1);
        assert!(throttle.should_report(0.0));
        assert!(!throttle.should_report(0.05));
        assert!(throttle.should_report(0.1));
        assert!(!throttle.should_report(0.15));
        assert!(throttle.should_report(0.3));
        assert!(throttle.should_report(1.0));
    }

    #[test]
    fn always_reports_edges() {
        let mut throttle = ProgressThrottle::new(0.5);
        assert!(throttle.should_report(0.0));
        assert!(throttle.should_report(0.0));
        assert!(throttle.should_report(1.0));
    }

    #[test]
    fn moves_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a");
        fs::create_dir_all(from.join("res").join("pack")).unwrap();
        fs::write(from.join("res").join("file.txt"), "x").unwrap();

        let to = dir.path().join("b").join("a");
        move_dir(&from, &to).unwrap();
        assert!(!from.exists());
        assert!(to.join("res").join("pack").is_dir());
        assert_eq!(fs::read_to_string(to.join("res").join("file.txt")).unwrap(), "x");
    }
}
