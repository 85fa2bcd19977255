//! Transfer throughput and human-readable formatting.

use std::time::{Duration, Instant};

/// Measures bytes moved during one invocation.
///
/// Resumed transfers only count what this invocation sent, so the rate is
/// not inflated by bytes a previous run already delivered.
#[derive(Debug, Clone)]
pub struct Throughput {
    started: Instant,
    bytes: u64,
    files: u64,
}

impl Throughput {
    pub fn start() -> Self {
        Self { started: Instant::now(), bytes: 0, files: 0 }
    }

    pub fn add_bytes(&mut self, n: u64) {
        self.bytes += n;
    }

    pub fn add_file(&mut self) {
        self.files += 1;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn files(&self) -> u64 {
        self.files
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average bytes per second since `start`.
    pub fn bytes_per_second(&self) -> u64 {
        rate(self.bytes, self.elapsed())
    }

    /// Seconds until `remaining` bytes are through at the current rate.
    pub fn eta_seconds(&self, remaining: u64) -> Option<u64> {
        match self.bytes_per_second() {
            0 => None,
            bps => Some(remaining / bps),
        }
    }

    /// One-line summary for the job log.
    pub fn summary(&self) -> String {
        format!(
            "{} files, {} in {} ({})",
            self.files,
            format_bytes(self.bytes),
            format_duration(self.elapsed().as_secs()),
            format_speed(self.bytes_per_second())
        )
    }
}

fn rate(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        0
    }
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

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
