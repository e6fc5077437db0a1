use std::path::PathBuf;

use clap::Parser;

/// indu - incremental disk usage analyzer
///
/// Scans a directory tree, measures its on-disk footprint and, when a cache
/// file is configured, replays unchanged subtrees from the previous run
/// instead of re-walking them.
#[derive(Parser, Debug)]
#[command(name = "indu")]
#[command(about = "Incremental disk usage scanner with a persistent cache")]
#[command(version)]
pub struct Args {
    /// Directory to scan
    #[arg(default_value = ".")]
    pub path: PathBuf,

    // ========================================================================
    // Cache options
    // ========================================================================
    /// Use FILE as incremental scan cache
    #[arg(short = 'C', long = "cache", value_name = "FILE")]
    pub cache: Option<PathBuf>,

    // ========================================================================
    // Scan options
    // ========================================================================
    /// Stay on the same filesystem
    #[arg(short = 'x', long = "one-file-system")]
    pub one_file_system: bool,

    /// Exclude files that match PATTERN
    #[arg(long = "exclude", value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Exclude files that match any pattern in FILE (one pattern per line)
    #[arg(short = 'X', long = "exclude-from", value_name = "FILE")]
    pub exclude_from: Vec<PathBuf>,

    /// Exclude directories containing CACHEDIR.TAG
    #[arg(long = "exclude-caches")]
    pub exclude_caches: bool,

    /// Follow symbolic links (excluding directories)
    #[arg(short = 'L', long = "follow-symlinks")]
    pub follow_symlinks: bool,

    /// Exclude Linux pseudo filesystems (procfs, sysfs, cgroup, ...)
    #[arg(long = "exclude-kernfs")]
    pub exclude_kernfs: bool,

    /// Exclude firmlinks on macOS
    #[arg(long = "exclude-firmlinks")]
    pub exclude_firmlinks: bool,

    // ========================================================================
    // Output options
    // ========================================================================
    /// Report apparent sizes instead of disk usage
    #[arg(long = "apparent-size")]
    pub apparent_size: bool,

    /// Maximum depth to display
    #[arg(short, long)]
    pub max_depth: Option<usize>,

    /// Suppress the tree report (useful when just refreshing the cache)
    #[arg(short, long)]
    pub quiet: bool,

    /// Display summary statistics after the scan
    #[arg(long)]
    pub stats: bool,
}

pub fn parse_args() -> Args {
    Args::parse()
}
