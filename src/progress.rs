//! Progress reporting for the workcircle CLI
//!
//! Provides a live spinner fed from the run's shared counters and the
//! end-of-run summary.

use crate::engine::{CompletionStatus, RunReport, RunStats};
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Progress reporter that displays run status
pub struct ProgressReporter {
    /// Progress bar
    bar: ProgressBar,

    /// Stop signal
    stop: Arc<AtomicBool>,

    /// Background updater
    updater: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            bar,
            stop: Arc::new(AtomicBool::new(false)),
            updater: None,
        }
    }

    /// Refresh the display from the live counters until finished
    pub fn watch(&mut self, stats: Arc<RunStats>, ranks: usize) {
        let bar = self.bar.clone();
        let stop = Arc::clone(&self.stop);
        let start = Instant::now();

        let spawned = thread::Builder::new()
            .name("circle-progress".into())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    bar.set_message(status_line(&stats, ranks, start.elapsed()));
                    thread::sleep(Duration::from_millis(200));
                }
            });

        // A missing spinner is cosmetic; the run goes on without it
        self.updater = spawned.ok();
    }

    /// Finish the progress display with a final message
    pub fn finish(&mut self, message: &str) {
        self.stop_updater();
        self.bar.finish_with_message(message.to_string());
    }

    fn stop_updater(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(updater) = self.updater.take() {
            let _ = updater.join();
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn status_line(stats: &RunStats, ranks: usize, elapsed: Duration) -> String {
    let processed = stats.items_processed.load(Ordering::Relaxed);
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        processed as f64 / secs
    } else {
        0.0
    };

    format!(
        "Processed: {} | Pending: {} | Stolen: {} | Rate: {:.0}/s | Ranks: {}",
        format_number(processed),
        format_number(stats.pending()),
        format_number(stats.items_stolen.load(Ordering::Relaxed)),
        rate,
        ranks,
    )
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| {
            chunk
                .iter()
                .rev()
                .map(|&b| b as char)
                .collect::<String>()
        })
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a summary of the run
pub fn print_summary(report: &RunReport, checkpoint_dir: &Path) {
    let title = match report.status {
        CompletionStatus::Completed => style("Run Complete").green().bold(),
        CompletionStatus::Aborted => style("Run Aborted").yellow().bold(),
        CompletionStatus::RestartFailed => style("Restart Failed").red().bold(),
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Processed:").bold(),
        format_number(report.items_processed())
    );
    println!(
        "  {} {}",
        style("Stolen:").bold(),
        format_number(report.items_stolen())
    );
    println!(
        "  {} {}/{}",
        style("Active ranks:").bold(),
        report.active_ranks(),
        report.ranks.len()
    );
    println!(
        "  {} {:.1}s ({:.0} items/sec)",
        style("Duration:").bold(),
        report.duration.as_secs_f64(),
        report.items_per_second()
    );
    if report.status == CompletionStatus::Aborted {
        println!(
            "  {} {}",
            style("Remaining:").yellow().bold(),
            format_number(report.items_remaining() as u64)
        );
        println!(
            "  {} {} ({})",
            style("Checkpoints:").bold(),
            checkpoint_dir.display(),
            format_size(report.checkpoint_bytes(), BINARY)
        );
    }
    println!();
}

/// Print a header at the start of the run
pub fn print_header(command: &str, ranks: usize, split: &str, checkpoint_dir: &Path) {
    println!();
    println!(
        "{} {}",
        style("workcircle").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Command:").bold(), command);
    println!("  {} {} ({} split)", style("Ranks:").bold(), ranks, split);
    println!(
        "  {} {}",
        style("Checkpoints:").bold(),
        checkpoint_dir.display()
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(1234567890), "1,234,567,890");
    }

    #[test]
    fn test_status_line() {
        let stats = RunStats::default();
        stats.items_enqueued.store(1500, Ordering::Relaxed);
        stats.items_processed.store(1000, Ordering::Relaxed);

        let line = status_line(&stats, 4, Duration::from_secs(2));
        assert!(line.contains("Processed: 1,000"));
        assert!(line.contains("Pending: 500"));
        assert!(line.contains("Rate: 500/s"));
        assert!(line.contains("Ranks: 4"));
    }
}
