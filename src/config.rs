//! Configuration types for workcircle
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Engine configuration (`CircleConfig`) with validation
//! - Option flags mirroring the classic split/create bits
//! - Walk options for the `walk` subcommand

use crate::error::ConfigError;
use clap::{Args, Parser, Subcommand, ValueEnum};
use regex::Regex;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum reasonable rank count
pub const MAX_RANKS: usize = 1024;

/// Default maximum work item length (1 MiB)
pub const DEFAULT_MAX_ITEM_LEN: usize = 1 << 20;

/// Hard upper bound on the configurable item length (64 MiB)
pub const MAX_ITEM_LEN_LIMIT: usize = 64 << 20;

/// Distributed work-stealing queue runner
#[derive(Parser, Debug, Clone)]
#[command(
    name = "workcircle",
    version,
    about = "Distributed work-stealing queue runner",
    long_about = "Drains a dynamically generated pool of work items across many ranks.\n\n\
                  Idle ranks steal work from busy ones, a token ring detects global\n\
                  completion, and an interrupted run can be checkpointed and restarted.",
    after_help = "EXAMPLES:\n    \
        find . -name '*.log' | workcircle xargs gzip\n    \
        seq 1 1000 | workcircle -n 16 --split random xargs 'sleep 0.01; echo {}'\n    \
        workcircle walk /data -n 8 --exclude '\\.snapshot'\n    \
        workcircle --restart --checkpoint-dir ckpt walk /data  # Resume an aborted walk"
)]
pub struct CliArgs {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,

    /// Engine options shared by all subcommands
    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Engine options
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Number of ranks (worker threads)
    #[arg(short = 'n', long, default_value_t = default_ranks(), value_name = "NUM", global = true)]
    pub ranks: usize,

    /// Victim selection policy for work stealing
    #[arg(long, value_enum, default_value_t = SplitPolicy::Equal, global = true)]
    pub split: SplitPolicy,

    /// Run the create step on every rank instead of rank 0 only
    #[arg(long, global = true)]
    pub create_global: bool,

    /// Directory holding checkpoint records
    #[arg(long, default_value = ".", value_name = "DIR", global = true)]
    pub checkpoint_dir: PathBuf,

    /// Resume from checkpoint records instead of creating work
    #[arg(long, global = true)]
    pub restart: bool,

    /// With --restart, let ranks without a record start empty
    #[arg(long, requires = "restart", global = true)]
    pub start_empty: bool,

    /// Maximum work item length in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_ITEM_LEN, value_name = "BYTES", global = true)]
    pub max_item_len: usize,

    /// Bound on the number of items a rank may hold
    #[arg(long, value_name = "NUM", global = true)]
    pub queue_capacity: Option<usize>,

    /// Milliseconds to wait for a steal response before trying another victim
    #[arg(long, default_value = "1000", value_name = "MS", global = true)]
    pub steal_timeout: u64,

    /// Seed for random victim selection
    #[arg(long, value_name = "SEED", global = true)]
    pub seed: Option<u64>,

    /// Log verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, global = true)]
    pub log_level: LogLevel,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (same as --log-level debug)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a command template for every line of standard input
    Xargs {
        /// Shell used to run each command
        #[arg(long, default_value = "bash", value_name = "SHELL")]
        shell: String,

        /// Command template; `{}` is replaced by the input line
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "TEMPLATE")]
        template: Vec<String>,
    },

    /// Walk a local directory tree, one directory per work item
    Walk {
        /// Root directory
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Maximum directory depth (unlimited if not set)
        #[arg(short = 'd', long, value_name = "NUM")]
        max_depth: Option<usize>,

        /// Exclude paths matching pattern (can be repeated)
        #[arg(long = "exclude", value_name = "PATTERN", action = clap::ArgAction::Append)]
        exclude_patterns: Vec<String>,
    },
}

fn default_ranks() -> usize {
    num_cpus::get()
}

/// How an idle rank picks the victim of a steal request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SplitPolicy {
    /// Uniformly random peer
    Random,
    /// Ring successor; converges queue sizes toward balance
    #[default]
    Equal,
}

/// Which ranks run the create callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreatePolicy {
    /// Rank 0 only; everyone else starts empty and steals
    #[default]
    Coordinator,
    /// Every rank creates its own partition of the initial work
    Global,
}

/// What `read_restarts` does when a rank has no record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingRestart {
    /// Report `RestartError::Missing`
    #[default]
    Fail,
    /// Start that rank with an empty queue
    StartEmpty,
}

/// Log verbosity; has no effect on engine behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, ValueEnum)]
pub enum LogLevel {
    Fatal,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Directive for `tracing_subscriber::EnvFilter`
    ///
    /// tracing has no fatal level, so fatal maps onto error.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Fatal | LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Option bits accepted by [`CircleConfig::set_options`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u32);

impl Flags {
    /// Steal from random peers
    pub const SPLIT_RANDOM: Flags = Flags(1);
    /// Steal from the ring successor
    pub const SPLIT_EQUAL: Flags = Flags(1 << 1);
    /// Run the create callback on every rank
    pub const CREATE_GLOBAL: Flags = Flags(1 << 2);
    /// Default options
    pub const DEFAULT: Flags = Flags::SPLIT_EQUAL;

    /// Raw bit value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Check whether every bit of `other` is set
    pub fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// Validated engine configuration
///
/// Passed explicitly to [`crate::Circle::new`]; nothing here is global,
/// so several engines can run side by side in one process.
#[derive(Debug, Clone)]
pub struct CircleConfig {
    /// Number of ranks
    pub ranks: usize,

    /// Victim selection policy
    pub split: SplitPolicy,

    /// Creation policy
    pub create: CreatePolicy,

    /// Log verbosity (informational only)
    pub log_level: LogLevel,

    /// Maximum item length in bytes
    pub max_item_len: usize,

    /// Optional bound on items held per rank
    pub queue_capacity: Option<usize>,

    /// Time to wait for a steal response before retrying elsewhere
    pub steal_timeout: Duration,

    /// Mailbox poll interval while idle
    pub poll_interval: Duration,

    /// Upper bound on the back-off between empty steal attempts
    pub max_steal_backoff: Duration,

    /// Bound on the abort drain and park phase
    pub abort_drain_timeout: Duration,

    /// Directory holding checkpoint records
    pub checkpoint_dir: PathBuf,

    /// Behavior when a rank has no restart record
    pub missing_restart: MissingRestart,

    /// Seed for random victim selection (per rank: seed + rank)
    pub seed: Option<u64>,
}

impl Default for CircleConfig {
    fn default() -> Self {
        Self {
            ranks: 1,
            split: SplitPolicy::Equal,
            create: CreatePolicy::Coordinator,
            log_level: LogLevel::Warn,
            max_item_len: DEFAULT_MAX_ITEM_LEN,
            queue_capacity: None,
            steal_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(1),
            max_steal_backoff: Duration::from_millis(20),
            abort_drain_timeout: Duration::from_secs(30),
            checkpoint_dir: PathBuf::from("."),
            missing_restart: MissingRestart::Fail,
            seed: None,
        }
    }
}

impl CircleConfig {
    /// Configuration with `ranks` ranks and defaults everywhere else
    pub fn with_ranks(ranks: usize) -> Self {
        Self {
            ranks,
            ..Default::default()
        }
    }

    /// Apply option flags
    ///
    /// `SPLIT_RANDOM` wins if both split bits are set; with neither bit the
    /// split policy falls back to equal split. Without `CREATE_GLOBAL` only
    /// rank 0 creates work.
    pub fn set_options(&mut self, flags: Flags) {
        self.split = if flags.contains(Flags::SPLIT_RANDOM) {
            SplitPolicy::Random
        } else {
            SplitPolicy::Equal
        };
        self.create = if flags.contains(Flags::CREATE_GLOBAL) {
            CreatePolicy::Global
        } else {
            CreatePolicy::Coordinator
        };
    }

    /// Current options as flags
    pub fn options(&self) -> Flags {
        let mut flags = match self.split {
            SplitPolicy::Random => Flags::SPLIT_RANDOM,
            SplitPolicy::Equal => Flags::SPLIT_EQUAL,
        };
        if self.create == CreatePolicy::Global {
            flags |= Flags::CREATE_GLOBAL;
        }
        flags
    }

    /// Check limits and timing relationships
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ranks == 0 || self.ranks > MAX_RANKS {
            return Err(ConfigError::InvalidRankCount {
                count: self.ranks,
                max: MAX_RANKS,
            });
        }

        if self.max_item_len == 0 || self.max_item_len > MAX_ITEM_LEN_LIMIT {
            return Err(ConfigError::InvalidItemLength {
                len: self.max_item_len,
                max: MAX_ITEM_LEN_LIMIT,
            });
        }

        if let Some(capacity) = self.queue_capacity {
            if capacity == 0 {
                return Err(ConfigError::InvalidCapacity { capacity });
            }
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidTiming {
                reason: "poll interval must be non-zero".into(),
            });
        }

        if self.steal_timeout <= self.poll_interval {
            return Err(ConfigError::InvalidTiming {
                reason: format!(
                    "steal timeout {:?} must exceed poll interval {:?}",
                    self.steal_timeout, self.poll_interval
                ),
            });
        }

        if self.max_steal_backoff < self.poll_interval {
            return Err(ConfigError::InvalidTiming {
                reason: "max steal back-off must be at least the poll interval".into(),
            });
        }

        if self.checkpoint_dir.exists() && !self.checkpoint_dir.is_dir() {
            return Err(ConfigError::InvalidCheckpointDir {
                path: self.checkpoint_dir.clone(),
                reason: "not a directory".into(),
            });
        }

        Ok(())
    }

    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: &EngineArgs) -> Result<Self, ConfigError> {
        let log_level = if args.verbose {
            LogLevel::Debug
        } else {
            args.log_level
        };

        let config = Self {
            ranks: args.ranks,
            split: args.split,
            create: if args.create_global {
                CreatePolicy::Global
            } else {
                CreatePolicy::Coordinator
            },
            log_level,
            max_item_len: args.max_item_len,
            queue_capacity: args.queue_capacity,
            steal_timeout: Duration::from_millis(args.steal_timeout),
            checkpoint_dir: args.checkpoint_dir.clone(),
            missing_restart: if args.start_empty {
                MissingRestart::StartEmpty
            } else {
                MissingRestart::Fail
            },
            seed: args.seed,
            ..Default::default()
        };

        config.validate()?;
        Ok(config)
    }
}

/// Options for the `walk` subcommand
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Root directory
    pub root: PathBuf,

    /// Maximum traversal depth
    pub max_depth: Option<usize>,

    /// Compiled exclude patterns
    pub exclude_patterns: Vec<Regex>,
}

impl WalkOptions {
    /// Compile and validate walk options
    pub fn new(
        root: PathBuf,
        max_depth: Option<usize>,
        patterns: &[String],
    ) -> Result<Self, ConfigError> {
        if !root.is_dir() {
            return Err(ConfigError::InvalidValue {
                name: "PATH",
                value: root.display().to_string(),
                reason: "not a directory".into(),
            });
        }

        let exclude_patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::InvalidValue {
                    name: "--exclude",
                    value: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root,
            max_depth,
            exclude_patterns,
        })
    }

    /// Check if a path should be excluded
    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude_patterns.iter().any(|re| re.is_match(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CircleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.split, SplitPolicy::Equal);
        assert_eq!(config.create, CreatePolicy::Coordinator);
        assert_eq!(config.max_item_len, 1 << 20);
    }

    #[test]
    fn test_invalid_rank_count() {
        let config = CircleConfig::with_ranks(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRankCount { count: 0, .. })
        ));

        let config = CircleConfig::with_ranks(MAX_RANKS + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_timing() {
        let config = CircleConfig {
            steal_timeout: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTiming { .. })
        ));
    }

    #[test]
    fn test_set_options() {
        let mut config = CircleConfig::default();

        config.set_options(Flags::SPLIT_RANDOM | Flags::CREATE_GLOBAL);
        assert_eq!(config.split, SplitPolicy::Random);
        assert_eq!(config.create, CreatePolicy::Global);
        assert_eq!(config.options(), Flags::SPLIT_RANDOM | Flags::CREATE_GLOBAL);

        config.set_options(Flags::DEFAULT);
        assert_eq!(config.split, SplitPolicy::Equal);
        assert_eq!(config.create, CreatePolicy::Coordinator);

        // Random wins when both split bits are present
        config.set_options(Flags::SPLIT_RANDOM | Flags::SPLIT_EQUAL);
        assert_eq!(config.split, SplitPolicy::Random);
    }

    #[test]
    fn test_log_level_directive() {
        assert_eq!(LogLevel::Fatal.as_directive(), "error");
        assert_eq!(LogLevel::Debug.as_directive(), "debug");
        assert!(LogLevel::Info > LogLevel::Warn);
    }

    #[test]
    fn test_cli_parsing() {
        let args = CliArgs::parse_from([
            "workcircle",
            "-n",
            "4",
            "--split",
            "random",
            "xargs",
            "gzip",
            "{}",
        ]);
        let config = CircleConfig::from_args(&args.engine).unwrap();
        assert_eq!(config.ranks, 4);
        assert_eq!(config.split, SplitPolicy::Random);

        match args.command {
            Command::Xargs { template, shell } => {
                assert_eq!(template, vec!["gzip", "{}"]);
                assert_eq!(shell, "bash");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_exclude_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let options =
            WalkOptions::new(dir.path().to_path_buf(), None, &[r"\.snapshot".to_string()])
                .unwrap();

        assert!(options.is_excluded("/data/.snapshot/hourly.0"));
        assert!(!options.is_excluded("/data/myfile.txt"));

        let bad = WalkOptions::new(dir.path().to_path_buf(), None, &["(".to_string()]);
        assert!(bad.is_err());
    }
}
