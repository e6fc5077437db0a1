mod report;

use std::process;
use std::time::Instant;

use anyhow::Result;

use indu_cache::CacheStore;
use indu_scan::{ExcludePatterns, ScanOptions};

fn main() -> Result<()> {
    env_logger::init();
    let args = indu_core::parse_args();

    if args.exclude_kernfs && !cfg!(target_os = "linux") {
        anyhow::bail!("the --exclude-kernfs flag is only supported on Linux");
    }

    // ========================================================================
    // Exclusion set
    // ========================================================================

    let mut exclude = ExcludePatterns::new();
    for pattern in &args.exclude {
        exclude.add(pattern)?;
    }
    for file in &args.exclude_from {
        exclude.add_file(file)?;
    }

    let opts = ScanOptions {
        one_file_system: args.one_file_system,
        exclude_kernfs: args.exclude_kernfs,
        exclude_firmlinks: args.exclude_firmlinks,
        follow_symlinks: args.follow_symlinks,
        cachedir_tags: args.exclude_caches,
        exclude,
    };

    // ========================================================================
    // Incremental cache
    // ========================================================================

    let mut cache = args.cache.as_deref().map(CacheStore::new);
    if let Some(cache) = cache.as_mut() {
        // A cache that cannot be read only costs the speedup.
        if let Err(err) = cache.load() {
            eprintln!("Warning: could not load cache file: {err:#}");
        }
    }

    // ========================================================================
    // Scan
    // ========================================================================

    let progress = !args.quiet && atty::is(atty::Stream::Stderr);
    let mut sink = report::TreeSink::new(progress);

    let scan_start = Instant::now();
    let status = match indu_scan::scan(&args.path, &opts, cache.as_mut(), &mut sink) {
        Ok(status) => status,
        Err(err) => {
            eprintln!("indu: {err:#}");
            process::exit(1);
        }
    };
    let scan_elapsed = scan_start.elapsed();

    // ========================================================================
    // Report
    // ========================================================================

    if !args.quiet {
        if let Some(root) = sink.take_root() {
            let stdout = std::io::stdout();
            report::print_report(&mut stdout.lock(), &root, args.max_depth, args.apparent_size)?;
        }
    }

    if args.stats {
        eprintln!();
        eprintln!("{:<16} {}", "Items scanned:", sink.items());
        eprintln!("{:<16} {:.3?}", "Scan time:", scan_elapsed);
        if let Some(cache_path) = args.cache.as_deref() {
            eprintln!("{:<16} {}", "Cache file:", cache_path.display());
        }
    }

    if status != 0 {
        process::exit(status);
    }
    Ok(())
}
