//! Parallel xargs
//!
//! Rank 0 reads standard input, one work item per line. Lines are passed
//! through as read, blank ones included. Whichever rank dequeues a line runs
//! the command template for it through the shell.

use crate::engine::{current_rank, Circle, Handle};
use std::io::{self, BufRead};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Placeholder replaced by the input line
pub const PLACEHOLDER: &str = "{}";

/// Template used when none is given; echoes the lines like POSIX xargs
pub const DEFAULT_TEMPLATE: &str = "echo -n '{} '";

/// Command counters
#[derive(Debug, Default)]
pub struct XargsStats {
    /// Commands that exited successfully
    pub succeeded: AtomicU64,

    /// Commands that failed or could not be started
    pub failed: AtomicU64,
}

/// Build the shell command line for one input line
///
/// An empty template means [`DEFAULT_TEMPLATE`]. Every `{}` is replaced by
/// the line, or the line is appended if there is none.
pub fn build_command(template: &[String], line: &str) -> String {
    let joined = if template.is_empty() {
        DEFAULT_TEMPLATE.to_string()
    } else {
        template.join(" ")
    };
    if joined.contains(PLACEHOLDER) {
        joined.replace(PLACEHOLDER, line)
    } else {
        format!("{} {}", joined, line)
    }
}

/// Enqueue every line of `reader` as one work item
///
/// Returns the number of lines accepted.
pub fn enqueue_lines<R: BufRead>(reader: R, h: &mut dyn Handle) -> usize {
    let mut accepted = 0;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to read standard input");
                break;
            }
        };

        if h.enqueue_str(&line) {
            accepted += 1;
        } else {
            warn!(line = %line, "Input line rejected");
        }
    }
    accepted
}

/// Register xargs callbacks on `circle`
pub fn install(circle: &mut Circle, shell: String, template: Vec<String>) -> Arc<XargsStats> {
    let stats = Arc::new(XargsStats::default());

    circle.on_create(|h: &mut dyn Handle| {
        enqueue_lines(io::stdin().lock(), h);
    });

    let run_stats = Arc::clone(&stats);
    circle.on_process(move |h: &mut dyn Handle| {
        let Some(item) = h.dequeue() else {
            return;
        };
        let line = String::from_utf8_lossy(item.as_bytes());
        let command = build_command(&template, &line);

        debug!(rank = ?current_rank(), command = %command, "Running");
        let status = Command::new(&shell)
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => {
                run_stats.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(status) => {
                warn!(rank = ?current_rank(), command = %command, status = %status, "Command failed");
                run_stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(shell = %shell, error = %e, "Failed to start shell");
                run_stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalQueue;

    fn template(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lines_are_kept_as_read() {
        let input = io::Cursor::new("  a.log \n\nb.log\r\n");
        let mut queue = LocalQueue::new(1024);

        assert_eq!(enqueue_lines(input, &mut queue), 3);

        let mut lines = Vec::new();
        while let Some(item) = queue.dequeue() {
            lines.push(item.as_str().unwrap().to_string());
        }
        lines.reverse();
        assert_eq!(lines, vec!["  a.log ", "", "b.log"]);
    }

    #[test]
    fn test_build_command() {
        assert_eq!(build_command(&[], "ls -l"), "echo -n 'ls -l' ");
        assert_eq!(
            build_command(&template(&["gzip"]), "a.log"),
            "gzip a.log"
        );
        assert_eq!(
            build_command(&template(&["cp", "{}", "{}.bak"]), "f"),
            "cp f f.bak"
        );
    }
}
