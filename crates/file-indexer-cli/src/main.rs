mod commands;
mod interrupt;
mod logging;
mod progress;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands, SearchBy};
use dotenv::dotenv;
use file_indexer_core::config::{load_configuration, non_overlapping_directories};
use file_indexer_core::progress::ErrorScope;
use file_indexer_core::storage::models::{DuplicateFilter, FileWithHash};
use file_indexer_core::{
    merge_databases, AppConfig, CancelToken, Database, Error, ScanSummary, Scanner,
};
use progress::CliObserver;
use tracing::{error, info, warn};

fn main() -> Result<()> {
    dotenv().ok();

    let args = Cli::parse();

    let mut config = match load_configuration() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };
    if let Some(db_path) = &args.db_path {
        config.db_path = db_path.clone();
    }
    if let Some(log_path) = &args.log_path {
        config.log_path = log_path.clone();
    }
    if let Some(machine_name) = &args.machine_name {
        config.machine_name = machine_name.clone();
    }

    let _guard = logging::init_logger(&config.log_path);

    match args.command {
        Some(Commands::Scan {
            paths,
            no_archives,
            ignore_rules,
            workers,
            batch_size,
        }) => {
            if no_archives {
                config.scan_archives = false;
            }
            if ignore_rules {
                config.enable_ignore_rules = true;
            }
            if workers.is_some() {
                config.workers = workers;
            }
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            for warning in config.validate() {
                warn!("{}", warning);
            }
            match run_scan(&config, paths)? {
                ScanExit::Completed => {}
                ScanExit::Failed => process::exit(2),
                ScanExit::Interrupted => process::exit(interrupt::INTERRUPTED_EXIT_CODE),
            }
        }
        Some(Commands::Stats) => run_stats(&config)?,
        Some(Commands::Duplicates {
            min_size,
            machine,
            page,
            per_page,
        }) => run_duplicates(
            &config,
            &DuplicateFilter {
                machine,
                min_size,
                page,
                per_page,
            },
        )?,
        Some(Commands::Search { query, by, limit }) => run_search(&config, &query, by, limit)?,
        Some(Commands::Merge { sources }) => run_merge(&config, &sources)?,
        Some(Commands::PrintConfig) => {
            for (key, value) in config.entries() {
                println!("{:<30} {}", key.cyan(), value);
            }
            for warning in config.validate() {
                println!("{} {}", "warning:".yellow(), warning);
            }
        }
        None => {
            Cli::command().print_long_help()?;
        }
    }

    Ok(())
}

fn open_database(config: &AppConfig) -> Result<Database> {
    Database::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path))
}

enum ScanExit {
    Completed,
    /// At least one root could not be scanned.
    Failed,
    Interrupted,
}

fn run_scan(config: &AppConfig, paths: Vec<PathBuf>) -> Result<ScanExit> {
    let roots: Vec<PathBuf> = paths
        .into_iter()
        .map(|path| std::path::absolute(&path).unwrap_or(path))
        .collect();
    let roots = non_overlapping_directories(roots);
    info!("Processing paths: {:?}", roots);

    let db = Arc::new(open_database(config)?);
    let options = config.scan_options()?;
    let observer = Arc::new(CliObserver::new());
    let cancel = CancelToken::new();
    if let Err(err) = interrupt::install(cancel.clone()) {
        warn!("{:#}", err);
    }
    let scanner = Scanner::new(db, options)
        .with_observer(observer.clone())
        .with_cancel_token(cancel.clone());

    let mut all_ok = true;
    for root in &roots {
        match scanner.scan(root) {
            Ok(summary) => print_summary(&summary),
            Err(Error::Cancelled) => {}
            Err(err) => {
                error!("Scan of {} failed: {}", root.display(), err);
                all_ok = false;
            }
        }
        if cancel.is_cancelled() {
            break;
        }
    }

    let counts = observer.counts();
    if counts.total_errors() > 0 {
        let scopes = [
            ErrorScope::FileScan,
            ErrorScope::DirList,
            ErrorScope::DirEntry,
            ErrorScope::ArchiveOpen,
            ErrorScope::ArchiveEntry,
            ErrorScope::DbFlush,
            ErrorScope::Worker,
        ];
        let detail: Vec<String> = scopes
            .iter()
            .filter(|scope| counts.errors(**scope) > 0)
            .map(|scope| format!("{}={}", scope, counts.errors(*scope)))
            .collect();
        warn!(
            "{} errors during scan ({})",
            format!("{}", counts.total_errors()).red(),
            detail.join(", ")
        );
    }
    info!(
        "{} batches written in {}",
        format!("{}", counts.batches_flushed()).green(),
        format!("{:.2}s", counts.flush_time().as_secs_f64()).green(),
    );

    if cancel.is_cancelled() {
        warn!("Scan interrupted; rerun to index the remaining files");
        return Ok(ScanExit::Interrupted);
    }
    Ok(if all_ok {
        ScanExit::Completed
    } else {
        ScanExit::Failed
    })
}

fn print_summary(summary: &ScanSummary) {
    info!(
        "{}: {} added, {} modified, {} skipped, {} failed in {}",
        summary.root.display(),
        format!("{}", summary.added).green(),
        format!("{}", summary.modified).yellow(),
        format!("{}", summary.skipped).dimmed(),
        format!("{}", summary.failed).red(),
        format!("{:.2}s", summary.duration.as_secs_f64()).green(),
    );
    info!(
        "{} directories, {} files discovered, {} archives with {} entries indexed",
        summary.directories,
        summary.files_discovered,
        format!("{}", summary.archives_scanned).cyan(),
        format!("{}", summary.archive_entries).cyan(),
    );
    if summary.failed_flushes > 0 {
        warn!(
            "{} batches failed to commit; {} paths need a rescan",
            format!("{}", summary.failed_flushes).red(),
            summary.failed_paths.len()
        );
    }
}

fn run_stats(config: &AppConfig) -> Result<()> {
    let db = open_database(config)?;
    let stats = db.get_statistics()?;

    println!("{}", "Index statistics".bold());
    println!("  {:<18} {}", "Files:", stats.total_files);
    println!("  {:<18} {}", "Total size:", human_size(stats.total_size));
    println!("  {:<18} {}", "Distinct contents:", stats.total_hashes);
    println!("  {:<18} {}", "Archived entries:", stats.archived_files);
    println!(
        "  {:<18} {}",
        "Duplicate files:",
        format!("{}", stats.duplicate_files).red()
    );
    if !stats.machine_stats.is_empty() {
        println!("{}", "Files per machine".bold());
        for (machine, count) in &stats.machine_stats {
            println!("  {:<18} {}", machine.cyan(), count);
        }
    }
    Ok(())
}

fn run_duplicates(config: &AppConfig, filter: &DuplicateFilter) -> Result<()> {
    let db = open_database(config)?;
    let page = db.find_duplicate_files(filter)?;

    println!(
        "{} duplicate groups (page {}/{})",
        format!("{}", page.total_groups).red(),
        page.page,
        page.pages().max(1)
    );
    for group in &page.groups {
        let wasted = group.hash.size * (group.files.len() as i64 - 1);
        println!(
            "\n{} {} x{} ({} reclaimable)",
            human_size(group.hash.size).bold(),
            group.hash.sha256.get(..16).unwrap_or(&group.hash.sha256).dimmed(),
            group.files.len(),
            human_size(wasted).yellow()
        );
        for file in &group.files {
            println!("  {} [{}]", file.path, file.machine.cyan());
        }
    }
    Ok(())
}

fn run_search(config: &AppConfig, query: &str, by: SearchBy, limit: i64) -> Result<()> {
    let db = open_database(config)?;
    let results = db.search_files(query, by.into(), limit)?;
    if results.is_empty() {
        println!("No matches for {}", query.yellow());
        return Ok(());
    }
    for FileWithHash { meta, hash } in &results {
        let size = hash
            .as_ref()
            .map(|h| human_size(h.size))
            .unwrap_or_else(|| "?".to_string());
        let md5 = hash.as_ref().map(|h| h.md5.as_str()).unwrap_or("-");
        println!(
            "{:>10}  {}  {} [{}]",
            size,
            md5.dimmed(),
            meta.path,
            meta.machine.cyan()
        );
    }
    println!("{} results", results.len());
    Ok(())
}

fn run_merge(config: &AppConfig, sources: &[PathBuf]) -> Result<()> {
    let target = open_database(config)?;
    let stats = merge_databases(sources, &target)?;
    info!(
        "Merged {} rows: {} written, {} skipped; {} new contents, {} reused",
        stats.total_files_processed,
        format!("{}", stats.files_added).green(),
        format!("{}", stats.files_skipped).dimmed(),
        format!("{}", stats.hashes_added).green(),
        format!("{}", stats.hashes_reused).cyan(),
    );
    Ok(())
}

fn human_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes.max(0) as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::human_size;

    #[test]
    fn human_size_picks_largest_unit() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1023), "1023 B");
        assert_eq!(human_size(1536), "1.50 KB");
        assert_eq!(human_size(5 * 1024 * 1024 * 1024), "5.00 GB");
    }
}
