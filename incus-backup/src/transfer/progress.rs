//! Byte-level progress tracking for transfers.
//!
//! Transfer speeds, completion estimates and the console renderer used by
//! the CLI.

use super::ProgressCallback;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Progress information for one transfer
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Total bytes to transfer, when known
    pub total_bytes: Option<u64>,

    /// Bytes transferred so far
    pub transferred_bytes: u64,

    /// Current transfer speed in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: Option<u64>,

    /// Percentage complete (0-100), when the total is known
    pub percent_complete: Option<f64>,
}

impl TransferProgress {
    pub fn new(total_bytes: Option<u64>) -> Self {
        Self {
            total_bytes,
            transferred_bytes: 0,
            bytes_per_second: 0,
            eta_seconds: None,
            percent_complete: None,
        }
    }

    /// Update progress with new transferred bytes
    pub fn update(&mut self, transferred_bytes: u64) {
        self.transferred_bytes = transferred_bytes;
        self.percent_complete = match self.total_bytes {
            Some(total) if total > 0 => Some((transferred_bytes as f64 / total as f64) * 100.0),
            _ => None,
        };
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total_bytes, Some(total) if self.transferred_bytes >= total)
    }
}

/// Progress tracker with time-based speed calculation
pub struct ProgressTracker {
    last_update_time: Instant,
    last_bytes: u64,
    progress: TransferProgress,
}

impl ProgressTracker {
    pub fn new(total_bytes: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            last_update_time: now,
            last_bytes: 0,
            progress: TransferProgress::new(total_bytes),
        }
    }

    /// Update progress and calculate speed
    pub fn update(&mut self, transferred_bytes: u64) -> &TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        if elapsed > 0.0 {
            let bytes_diff = transferred_bytes.saturating_sub(self.last_bytes);
            self.progress.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        self.progress.eta_seconds = match self.progress.total_bytes {
            Some(total) if self.progress.bytes_per_second > 0 => {
                Some(total.saturating_sub(transferred_bytes) / self.progress.bytes_per_second)
            }
            _ => None,
        };

        self.progress.update(transferred_bytes);
        self.last_update_time = now;
        self.last_bytes = transferred_bytes;

        &self.progress
    }
}

/// One console line for a transfer.
pub fn render_line(label: &str, progress: &TransferProgress) -> String {
    let mut line = format!("{}: {}", label, format_bytes(progress.transferred_bytes));
    if let Some(total) = progress.total_bytes {
        line.push_str(&format!(" / {}", format_bytes(total)));
    }
    if let Some(percent) = progress.percent_complete {
        line.push_str(&format!(" ({:.1}%)", percent));
    }
    line.push_str(&format!(" {}", format_speed(progress.bytes_per_second)));
    if let Some(eta) = progress.eta_seconds {
        line.push_str(&format!(" ETA {}", format_duration(eta)));
    }
    line
}

/// Advance the tracker of `label` and render its line. A finished label is
/// dropped so the next transfer under the same label starts fresh.
fn advance(trackers: &mut HashMap<String, ProgressTracker>, label: &str, bytes: u64, expected: Option<u64>) -> String {
    let tracker = trackers
        .entry(label.to_string())
        .or_insert_with(|| ProgressTracker::new(expected));
    let progress = tracker.update(bytes);
    let line = render_line(label, progress);
    if progress.is_complete() {
        trackers.remove(label);
    }
    line
}

/// Progress callback that writes one line per update to stderr.
pub fn console_callback() -> ProgressCallback {
    let trackers: Arc<Mutex<HashMap<String, ProgressTracker>>> = Arc::new(Mutex::new(HashMap::new()));
    Arc::new(move |bytes: u64, expected: Option<u64>, label: &str| {
        let Ok(mut trackers) = trackers.lock() else {
            return;
        };
        let line = advance(&mut trackers, label, bytes, expected);
        let _ = writeln!(std::io::stderr(), "{}", line);
    })
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_transfer_progress_update() {
        let mut progress = TransferProgress::new(Some(1000));
        progress.update(500);
        assert_eq!(progress.transferred_bytes, 500);
        assert!((progress.percent_complete.unwrap() - 50.0).abs() < 0.01);
        assert!(!progress.is_complete());

        progress.update(1000);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_unknown_total() {
        let mut progress = TransferProgress::new(None);
        progress.update(500);
        assert!(progress.percent_complete.is_none());
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_progress_tracker() {
        let mut tracker = ProgressTracker::new(Some(1000));

        let prog = tracker.update(100);
        assert_eq!(prog.transferred_bytes, 100);

        thread::sleep(Duration::from_millis(100));
        let prog = tracker.update(500);
        assert_eq!(prog.transferred_bytes, 500);
        assert!(prog.bytes_per_second > 0);
        assert!(prog.eta_seconds.is_some());
    }

    #[test]
    fn test_finished_label_starts_fresh() {
        let mut trackers = HashMap::new();
        advance(&mut trackers, "web", 400, Some(1000));
        assert!(trackers.contains_key("web"));

        let line = advance(&mut trackers, "web", 1000, Some(1000));
        assert!(line.contains("(100.0%)"), "got {line}");
        assert!(trackers.is_empty());

        advance(&mut trackers, "web", 10, Some(20));
        assert_eq!(trackers["web"].progress.total_bytes, Some(20));
    }

    #[test]
    fn test_render_line() {
        let mut progress = TransferProgress::new(Some(2048));
        progress.update(1024);
        progress.bytes_per_second = 1024;
        progress.eta_seconds = Some(1);
        assert_eq!(render_line("web", &progress), "web: 1.00 KB / 2.00 KB (50.0%) 1.00 KB/s ETA 1s");

        let unknown = TransferProgress::new(None);
        assert_eq!(render_line("db", &unknown), "db: 0.00 B 0.00 B/s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024), "1.00 KB/s");
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
