//! workcircle - Distributed Work-Stealing Queue Runner
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use humansize::{format_size, BINARY};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use workcircle::commands::{walk, xargs, WalkStats, XargsStats};
use workcircle::config::{CliArgs, Command, LogLevel, WalkOptions};
use workcircle::progress::{print_header, print_summary, ProgressReporter};
use workcircle::{Circle, CircleConfig, CircleError, CompletionStatus};

fn main() -> ExitCode {
    match run() {
        Ok(status) => ExitCode::from(status.exit_code()),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            let code = e
                .downcast_ref::<CircleError>()
                .map(|e| e.exit_code())
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

/// What the subcommand reports after the run
enum Totals {
    Xargs(Arc<XargsStats>),
    Walk(Arc<WalkStats>),
}

fn run() -> Result<CompletionStatus> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Validate and create config
    let config = CircleConfig::from_args(&args.engine).context("Invalid configuration")?;

    // Setup logging
    setup_logging(config.log_level)?;

    let show_progress = !args.engine.quiet;
    let checkpoint_dir = config.checkpoint_dir.clone();
    let split = format!("{:?}", config.split).to_lowercase();
    let ranks = config.ranks;

    let mut circle = Circle::new(config).context("Failed to initialize circle")?;

    let (name, totals) = match args.command {
        Command::Xargs { shell, template } => {
            let stats = xargs::install(&mut circle, shell, template);
            ("xargs", Totals::Xargs(stats))
        }
        Command::Walk {
            path,
            max_depth,
            exclude_patterns,
        } => {
            let options = WalkOptions::new(path, max_depth, &exclude_patterns)
                .context("Invalid walk options")?;
            let stats = walk::install(&mut circle, options);
            ("walk", Totals::Walk(stats))
        }
    };

    if args.engine.restart {
        let items = circle
            .read_restarts()
            .context("Failed to load restart records")?;
        info!(items, "Resuming from checkpoint");
    }

    // Setup signal handler for cooperative abort
    let control = circle.control();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, checkpointing and aborting...");
        control.abort();
    })
    .context("Failed to set signal handler")?;

    // Print header and start progress reporter
    let mut progress = if show_progress {
        print_header(name, ranks, &split, &checkpoint_dir);
        let mut reporter = ProgressReporter::new();
        reporter.watch(circle.stats(), ranks);
        Some(reporter)
    } else {
        None
    };

    // Run the circle
    let report = circle.run().context("Run failed")?;

    // Finish progress
    if let Some(ref mut p) = progress {
        match report.status {
            CompletionStatus::Completed => p.finish("Run completed"),
            _ => p.finish("Run aborted"),
        }
    }

    if show_progress {
        print_summary(&report, &checkpoint_dir);
        print_totals(&totals);
    }

    match &totals {
        Totals::Xargs(stats) => {
            let failed = stats.failed.load(Ordering::Relaxed);
            if failed > 0 {
                warn!(failed, "Some commands failed");
            }
        }
        Totals::Walk(stats) => {
            let errors = stats.errors.load(Ordering::Relaxed);
            if errors > 0 {
                info!(errors, "Walk completed with errors");
            }
        }
    }

    if report.status == CompletionStatus::Aborted {
        info!(
            remaining = report.items_remaining(),
            dir = %checkpoint_dir.display(),
            "Run aborted, resume with --restart"
        );
    }

    Ok(report.status)
}

fn print_totals(totals: &Totals) {
    match totals {
        Totals::Xargs(stats) => {
            println!(
                "  {} {} ok, {} failed",
                style("Commands:").bold(),
                stats.succeeded.load(Ordering::Relaxed),
                stats.failed.load(Ordering::Relaxed)
            );
        }
        Totals::Walk(stats) => {
            println!(
                "  {} {} dirs, {} files, {}",
                style("Tree:").bold(),
                stats.dirs.load(Ordering::Relaxed),
                stats.files.load(Ordering::Relaxed),
                format_size(stats.bytes.load(Ordering::Relaxed), BINARY)
            );
            let errors = stats.errors.load(Ordering::Relaxed);
            if errors > 0 {
                println!("  {} {}", style("Errors:").yellow().bold(), errors);
            }
        }
    }
    println!();
}

fn setup_logging(level: LogLevel) -> Result<()> {
    let filter = EnvFilter::new(format!("workcircle={},warn", level.as_directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
