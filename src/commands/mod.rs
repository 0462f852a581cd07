//! Callback sets behind the CLI subcommands

pub mod walk;
pub mod xargs;

pub use walk::WalkStats;
pub use xargs::XargsStats;
