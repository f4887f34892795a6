//! Phase progress reporting.
//!
//! Long phases (library load, prefetch, matching) report through
//! [`PhaseProgress`]: an indicatif bar on a terminal, or periodic
//! `[PHASE] n/total (pct%)` lines in log-only mode for tail-friendly output.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global flag for log-only mode (set from args in main)
pub static LOG_ONLY: AtomicBool = AtomicBool::new(false);

pub fn set_log_only(value: bool) {
    LOG_ONLY.store(value, Ordering::Relaxed);
}

pub fn is_log_only() -> bool {
    LOG_ONLY.load(Ordering::Relaxed)
}

/// Format duration in human-readable format
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.1}m", secs / 60.0)
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{msg} {spinner} [{elapsed_precise}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Progress of one named phase. Safe to advance from several threads.
pub struct PhaseProgress {
    phase: &'static str,
    bar: ProgressBar,
    total: u64,
    done: AtomicU64,
    log_every: u64,
    started: Instant,
}

impl PhaseProgress {
    /// Bounded phase with a known item count.
    pub fn new(phase: &'static str, total: u64, msg: &str) -> Self {
        let bar = ProgressBar::new(total);
        if is_log_only() {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        } else {
            bar.set_style(bar_style());
        }
        bar.set_message(msg.to_string());
        Self {
            phase,
            bar,
            total,
            done: AtomicU64::new(0),
            log_every: (total / 20).max(1),
            started: Instant::now(),
        }
    }

    /// Phase of unknown length, shown as a spinner.
    pub fn spinner(phase: &'static str, msg: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        if is_log_only() {
            bar.set_draw_target(ProgressDrawTarget::hidden());
            eprintln!("[{}] {}", phase, msg);
        } else {
            bar.set_style(spinner_style());
            bar.enable_steady_tick(Duration::from_millis(100));
        }
        bar.set_message(msg.to_string());
        Self {
            phase,
            bar,
            total: 0,
            done: AtomicU64::new(0),
            log_every: u64::MAX,
            started: Instant::now(),
        }
    }

    pub fn inc(&self, n: u64) {
        self.bar.inc(n);
        let current = self.done.fetch_add(n, Ordering::Relaxed) + n;
        if is_log_only() && self.total > 0 && (current % self.log_every == 0 || current == self.total) {
            let pct = 100.0 * current as f64 / self.total as f64;
            eprintln!("[{}] {}/{} ({:.1}%)", self.phase, current, self.total, pct);
        }
    }

    pub fn position(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Close the bar and print the phase summary line.
    pub fn finish(&self, summary: &str) {
        self.bar.finish_and_clear();
        eprintln!("[{}] {} ({})", self.phase, summary, format_duration(self.elapsed()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1.5m");
    }

    #[test]
    fn test_phase_progress_counts() {
        let progress = PhaseProgress::new("TEST", 10, "counting");
        progress.inc(3);
        progress.inc(2);
        assert_eq!(progress.position(), 5);
        progress.finish("done");
    }
}
